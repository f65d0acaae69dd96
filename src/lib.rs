pub mod config;
pub mod error;

pub mod controller;
pub mod mock;
pub mod models;
pub mod session;
pub mod sse;
pub mod transport;

pub use crate::config::SearchConfig;
pub use crate::controller::SearchController;
pub use crate::error::{Result, SearchError};
pub use crate::models::{AccumulatedResult, ProductWidget, UserInput, Widget};
pub use crate::session::{CancellationToken, SearchUpdate, SessionState};
pub use crate::transport::FlowClient;
