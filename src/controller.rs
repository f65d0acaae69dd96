use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::UserInput;
use crate::session::{CancellationToken, SearchUpdate, run_session};
use crate::transport::FlowClient;

// ============================================================================
// Session Handle
// ============================================================================

/// The controller's grip on one live session: its token plus the driver
/// task. Cancelling is idempotent and immediately fences off every callback
/// the session could still produce.
struct SessionHandle {
    token: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl SessionHandle {
    fn cancel(&mut self) {
        if self.token.cancel() {
            log::debug!("session superseded");
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

// ============================================================================
// Search Controller
// ============================================================================

struct ControllerInner {
    raw_query: String,
    debounce: Option<JoinHandle<()>>,
    current: Option<SessionHandle>,
}

struct ControllerCore {
    client: FlowClient,
    updates: mpsc::UnboundedSender<SearchUpdate>,
    /// Mirrors whether a live session exists; read by the debounce gate.
    searching: Arc<AtomicBool>,
    inner: Mutex<ControllerInner>,
}

impl Drop for ControllerCore {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("controller lock poisoned");
        if let Some(debounce) = inner.debounce.take() {
            debounce.abort();
        }
        if let Some(mut current) = inner.current.take() {
            current.cancel();
        }
    }
}

/// Debounces user input, enforces the minimum word count, and keeps at most
/// one flow session alive. Observers consume `SearchUpdate`s from the
/// receiver returned by `new`.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SearchController {
    core: Arc<ControllerCore>,
}

impl SearchController {
    pub fn new(client: FlowClient) -> (Self, mpsc::UnboundedReceiver<SearchUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let controller = Self {
            core: Arc::new(ControllerCore {
                client,
                updates,
                searching: Arc::new(AtomicBool::new(false)),
                inner: Mutex::new(ControllerInner {
                    raw_query: String::new(),
                    debounce: None,
                    current: None,
                }),
            }),
        };
        (controller, rx)
    }

    /// Whether a session is currently live (started and not yet terminal).
    pub fn is_searching(&self) -> bool {
        self.core.searching.load(Ordering::SeqCst)
    }

    /// Input changed. Empty input clears displayed results immediately;
    /// anything else schedules a debounced evaluation, replacing whatever
    /// evaluation was pending.
    pub fn on_query_change(&self, text: &str) {
        let delay = self.core.client.config().debounce;
        {
            let mut inner = self.core.inner.lock().expect("controller lock poisoned");
            inner.raw_query = text.to_string();
            if let Some(debounce) = inner.debounce.take() {
                debounce.abort();
            }
            if text.trim().is_empty() {
                let _ = self.core.updates.send(SearchUpdate::Cleared);
                return;
            }
            // Weak: a pending timer must not keep a dropped controller
            // alive, and must not fire a search after disposal.
            let core = Arc::downgrade(&self.core);
            let query = text.to_string();
            inner.debounce = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(core) = core.upgrade() else {
                    return;
                };
                SearchController { core }.debounce_fired(query);
            }));
        }
    }

    /// Explicit trigger (Enter key, form submit). Bypasses the debounce;
    /// a too-short query is reported instead of silently cleared; a live
    /// session is superseded rather than skipped.
    pub fn submit_now(&self, text: &str) {
        {
            let mut inner = self.core.inner.lock().expect("controller lock poisoned");
            inner.raw_query = text.to_string();
            if let Some(debounce) = inner.debounce.take() {
                debounce.abort();
            }
        }
        let min_words = self.core.client.config().min_word_count;
        if word_count(text) < min_words {
            let _ = self.core.updates.send(SearchUpdate::Failed {
                message: format!("Please type at least {} words to search", min_words),
            });
            return;
        }
        self.begin(UserInput::search(text.trim()));
    }

    /// Similar-products flow for one product card. Same session machinery,
    /// no word gate.
    pub fn similar_products(&self, product_id: &str) {
        let product_id = product_id.trim();
        if product_id.is_empty() {
            return;
        }
        self.begin(UserInput::similar_products(product_id));
    }

    /// Cancels the pending debounce and the live session. Idempotent; also
    /// runs when the last controller clone is dropped.
    pub fn shutdown(&self) {
        let mut inner = self.core.inner.lock().expect("controller lock poisoned");
        if let Some(debounce) = inner.debounce.take() {
            debounce.abort();
        }
        if let Some(mut current) = inner.current.take() {
            current.cancel();
        }
        self.core.searching.store(false, Ordering::SeqCst);
    }

    fn debounce_fired(&self, query: String) {
        if self.is_searching() {
            log::debug!("search already in flight, skipping debounced query");
            return;
        }
        if word_count(&query) < self.core.client.config().min_word_count {
            let _ = self.core.updates.send(SearchUpdate::Cleared);
            return;
        }
        self.begin(UserInput::search(query.trim()));
    }

    /// Starts a new session, superseding any live one. The previous session
    /// is cancelled synchronously, before the new start-flow request goes
    /// out, so at most one session is ever in flight.
    fn begin(&self, input: UserInput) {
        let token = CancellationToken::new();
        {
            let mut inner = self.core.inner.lock().expect("controller lock poisoned");
            if let Some(mut previous) = inner.current.take() {
                previous.cancel();
            }
            inner.current = Some(SessionHandle {
                token: token.clone(),
                driver: None,
            });
        }
        self.core.searching.store(true, Ordering::SeqCst);
        let _ = self.core.updates.send(SearchUpdate::Searching);

        // Weak for the same reason as the debounce timer: a start-flow
        // call still in the air must not keep a dropped controller alive.
        let core = Arc::downgrade(&self.core);
        let client = self.core.client.clone();
        tokio::spawn(async move {
            let started = tokio::select! {
                started = client.start_flow(&input) => started,
                _ = token.cancelled() => return,
            };
            let Some(core) = core.upgrade() else {
                return;
            };
            match started {
                Ok(session_id) => {
                    if token.is_cancelled() {
                        // Superseded while the start-flow call was in the
                        // air. Silent: the newer session owns the UI now.
                        return;
                    }
                    log::info!("search session {} streaming", session_id);
                    let events = client.subscribe(&session_id, token.clone());
                    let driver = tokio::spawn(run_session(
                        session_id,
                        events,
                        client.config().stream_timeout,
                        token.clone(),
                        core.updates.clone(),
                        core.searching.clone(),
                    ));

                    let mut inner = core.inner.lock().expect("controller lock poisoned");
                    match inner.current.as_mut() {
                        Some(handle) if handle.token.same(&token) => {
                            handle.driver = Some(driver);
                        }
                        _ => {
                            // Superseded after the id arrived; the token is
                            // already cancelled so the driver exits quietly.
                            driver.abort();
                        }
                    }
                }
                Err(err) => {
                    if token.is_cancelled() {
                        return;
                    }
                    core.searching.store(false, Ordering::SeqCst);
                    let _ = core.updates.send(SearchUpdate::Failed {
                        message: err.user_message(),
                    });
                }
            }
        });
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// ============================================================================
// Tests
// ============================================================================
