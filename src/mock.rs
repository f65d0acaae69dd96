use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::Stream;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::models::{FlowRequest, UserInput};

// ============================================================================
// Mock Backend
// ============================================================================

/// In-process flow backend for demos and tests. Serves the same two routes
/// as the real service and streams canned frames whose shape varies per
/// frame, so clients exercise every payload nesting they claim to handle.
///
/// Query markers select a behavior: "expired" fails the flow, "hang" opens
/// a silent stream, "slow" streams partial results and never terminates.
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

struct MockState {
    search_key: String,
    flow_requests: AtomicUsize,
    sessions: Mutex<HashMap<String, UserInput>>,
}

impl MockBackend {
    pub async fn spawn(search_key: &str) -> std::io::Result<Self> {
        let state = Arc::new(MockState {
            search_key: search_key.to_string(),
            flow_requests: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
        });

        let router = Router::new()
            .route("/flow/execute", post(execute_flow))
            .route("/sse/session/{id}", get(session_stream))
            .layer(CorsLayer::permissive())
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                log::error!("mock backend stopped: {}", e);
            }
        });
        log::info!("mock backend listening on {}", addr);

        Ok(Self { addr, state, server })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// How many start-flow requests reached the backend.
    pub fn flow_requests(&self) -> usize {
        self.state.flow_requests.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.server.abort();
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

// ============================================================================
// Routes
// ============================================================================

async fn execute_flow(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(request): Json<FlowRequest>,
) -> impl IntoResponse {
    let presented = headers
        .get("x-search-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.search_key {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid search key"})),
        );
    }

    state.flow_requests.fetch_add(1, Ordering::SeqCst);
    let session_id = Uuid::now_v7().to_string();
    log::debug!(
        "mock flow {} for input {:?}",
        session_id,
        request.user_input.text()
    );
    state
        .sessions
        .lock()
        .expect("mock session lock poisoned")
        .insert(session_id.clone(), request.user_input);

    (StatusCode::OK, Json(json!({"sessionId": session_id})))
}

async fn session_stream(
    State(state): State<Arc<MockState>>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let input = state
        .sessions
        .lock()
        .expect("mock session lock poisoned")
        .get(&session_id)
        .cloned();

    let stream = async_stream::stream! {
        let query = match input {
            Some(input) => input.text().to_lowercase(),
            None => {
                yield Ok(frame("flow-error", json!({
                    "event": "flow-error",
                    "message": "unknown session",
                })));
                return;
            }
        };

        if query.contains("hang") {
            // Open stream, no frames, never terminates.
            futures::future::pending::<()>().await;
            return;
        }
        if query.contains("expired") {
            tokio::time::sleep(Duration::from_millis(10)).await;
            yield Ok(frame("flow-error", json!({
                "event": "flow-error",
                "message": "expired campaign",
            })));
            return;
        }

        let products = catalog(&query);

        // Summary as a text widget under the top-level response nesting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        yield Ok(frame("search-result", json!({
            "event": "search-result",
            "response": {"widgets": [{
                "type": "text",
                "text": format!("Found {} matching products", products.len()),
            }]},
        })));

        tokio::time::sleep(Duration::from_millis(10)).await;
        yield Ok(frame("products", json!({
            "event": "products",
            "response": {"widgets": products},
        })));

        if query.contains("slow") {
            // Partial results delivered, then the stream stalls.
            futures::future::pending::<()>().await;
            return;
        }

        // Unranked follow-up inside a data envelope, re-sending the first
        // product under its alternate field spellings plus one new card.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut trailing = vec![json!({
            "type": "product",
            "id": products[0]["productId"],
            "name": products[0]["title"],
            "relevance": "0.5",
        })];
        trailing.push(json!({
            "type": "product",
            "productId": "extra-01",
            "title": "Board Wax Kit",
            "brand": "GlideWorks",
            "imagePaths": ["https://img.mock/extra-01.jpg"],
        }));
        yield Ok(frame("unranked-products", json!({
            "data": {
                "event": "unranked-products",
                "response": {"widgets": trailing},
            },
        })));

        tokio::time::sleep(Duration::from_millis(10)).await;
        yield Ok(frame("flow-end", json!({
            "event": "flow-end",
            "status": "done",
        })));
    };

    Sse::new(stream)
}

fn frame(name: &str, payload: Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

// ============================================================================
// Catalog
// ============================================================================

/// Canned product cards keyed off the query text.
fn catalog(query: &str) -> Vec<Value> {
    if query.contains("surf") {
        return vec![
            product("surf-01", "Shortboard 6'2\"", "WaveCo", 0.94, "Responsive shortboard for punchy waves"),
            product("surf-02", "Foam Cruiser 8'0\"", "SoftTop", 0.81, "Forgiving foam board for first sessions"),
        ];
    }
    if query.contains("gift") {
        return vec![product(
            "gift-01",
            "Gift Card 50",
            "Storefront",
            0.99,
            "Digital gift card, delivered by email",
        )];
    }
    vec![
        product("long-01", "Pintail Longboard 40\"", "RollCo", 0.92, "Stable pintail deck for relaxed cruising"),
        product("long-02", "Drop-Through Longboard 38\"", "RollCo", 0.85, "Low deck height, easy pushing for beginners"),
        product("long-03", "Mini Cruiser 28\"", "CityGlide", 0.78, "Compact cruiser that fits in a school locker"),
    ]
}

fn product(id: &str, title: &str, brand: &str, score: f64, description: &str) -> Value {
    json!({
        "type": "product",
        "productId": id,
        "title": title,
        "brand": brand,
        "imageUrl": format!("https://img.mock/{}.jpg", id),
        "score": score,
        "description": description,
        "reason": format!("Matches your query with {:.0}% confidence", score * 100.0),
    })
}

// ============================================================================
// Tests
// ============================================================================
