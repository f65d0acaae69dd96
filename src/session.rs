use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::models::{AccumulatedResult, ProductWidget, Widget};
use crate::sse::StreamEvent;

// ============================================================================
// Cancellation Token
// ============================================================================

/// One token per session, shared by the stream reader, the session driver
/// and the controller. Cancelling twice is a no-op. Backed by a watch
/// channel so async tasks can park on `cancelled()` instead of polling
/// between chunks that may never arrive.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually flipped the token.
    pub fn cancel(&self) -> bool {
        !self.flag.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives inside self, so wait_for cannot observe a
        // closed channel while we borrow it.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Whether two tokens guard the same session.
    pub fn same(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Streaming)
    }
}

// ============================================================================
// Observer Protocol
// ============================================================================

/// What the session layer tells whoever renders results. `Completed`,
/// `TimedOut` and `Failed` are terminal; a timed-out session hands over its
/// partial accumulation rather than an error (partial results are a valid
/// outcome for this backend). Cancelled sessions emit nothing at all.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchUpdate {
    /// Results, errors and summary were reset (empty or too-short query).
    Cleared,
    /// A new search was accepted; previous display state is stale.
    Searching,
    Summary { text: String },
    Products { added: Vec<ProductWidget> },
    Completed(AccumulatedResult),
    TimedOut(AccumulatedResult),
    Failed { message: String },
}

impl SearchUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::TimedOut(_) | Self::Failed { .. })
    }
}

// ============================================================================
// Session Accumulator
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Completed,
    Failed(String),
}

/// Effect of applying one event: deltas to forward to the observer and the
/// terminal transition, if this event caused one.
#[derive(Debug, Default)]
pub struct Applied {
    pub summary: Option<String>,
    pub added: Vec<ProductWidget>,
    pub terminal: Option<Terminal>,
}

/// The per-session state machine. Consumes parsed events strictly in
/// arrival order and owns the accumulated result until a terminal state
/// freezes it.
#[derive(Debug)]
pub struct SessionAccumulator {
    session_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    state: SessionState,
    result: AccumulatedResult,
    seen_ids: HashSet<String>,
}

impl SessionAccumulator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: chrono::Utc::now(),
            state: SessionState::Pending,
            result: AccumulatedResult::default(),
            seen_ids: HashSet::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn result(&self) -> &AccumulatedResult {
        &self.result
    }

    pub fn apply(&mut self, event: &StreamEvent) -> Applied {
        let mut applied = Applied::default();
        if self.state.is_terminal() {
            return applied;
        }
        if self.state == SessionState::Pending {
            self.state = SessionState::Streaming;
        }

        if event.is_flow_error() {
            let message = event
                .error_message()
                .unwrap_or_else(|| "Search failed".to_string());
            self.state = SessionState::Failed;
            applied.terminal = Some(Terminal::Failed(message));
            return applied;
        }

        for widget in event.widgets() {
            match widget {
                Widget::Text(text) => {
                    // Latest text widget wins; empty ones don't erase a
                    // summary we already have.
                    if !text.text.is_empty() {
                        self.result.summary = text.text.clone();
                        applied.summary = Some(text.text);
                    }
                }
                Widget::Product(product) => {
                    let Some(id) = product.product_id.clone() else {
                        // No id, no dedup identity: drop it.
                        continue;
                    };
                    if self.seen_ids.insert(id) {
                        self.result.products.push(product.clone());
                        applied.added.push(product);
                    }
                }
            }
        }

        // Widgets above are merged before this check so a terminating flush
        // that also carries products loses none of them.
        if event.signals_completion() {
            self.state = SessionState::Completed;
            applied.terminal = Some(Terminal::Completed);
        }
        applied
    }

    /// Deadline elapsed with no terminal event. Freezes and returns whatever
    /// accumulated; the observer receives it as a partial completion.
    pub fn time_out(&mut self) -> AccumulatedResult {
        self.state = SessionState::TimedOut;
        self.result.clone()
    }

    pub fn mark_cancelled(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Cancelled;
        }
    }
}

// ============================================================================
// Session Driver
// ============================================================================

/// Drives one session to a terminal state: consumes the subscription's
/// events in order, enforces the stream timeout, and forwards updates to
/// the observer. The timeout timer and the subscription share the session's
/// token, so a terminal transition stops both together. Every send is
/// guarded by the token: once the session is superseded, nothing leaks out.
pub(crate) async fn run_session(
    session_id: String,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    timeout: Duration,
    token: CancellationToken,
    updates: mpsc::UnboundedSender<SearchUpdate>,
    searching: Arc<AtomicBool>,
) {
    let mut accumulator = SessionAccumulator::new(session_id);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if token.is_cancelled() {
            accumulator.mark_cancelled();
            return;
        }

        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => {
                time_out(&mut accumulator, &token, &updates, &searching);
                return;
            }
        };

        let Some(event) = event else {
            // The stream closed without a terminal event. That is silent
            // completion at the transport layer; hold what we have until
            // the deadline so the session never resolves early.
            tokio::time::sleep_until(deadline).await;
            time_out(&mut accumulator, &token, &updates, &searching);
            return;
        };

        let applied = accumulator.apply(&event);
        if token.is_cancelled() {
            accumulator.mark_cancelled();
            return;
        }

        if let Some(text) = applied.summary {
            let _ = updates.send(SearchUpdate::Summary { text });
        }
        if !applied.added.is_empty() {
            let _ = updates.send(SearchUpdate::Products { added: applied.added });
        }
        match applied.terminal {
            Some(Terminal::Completed) => {
                log::debug!(
                    "session {} completed: {} product(s)",
                    accumulator.session_id(),
                    accumulator.result().products.len()
                );
                searching.store(false, Ordering::SeqCst);
                let _ = updates.send(SearchUpdate::Completed(accumulator.result().clone()));
                return;
            }
            Some(Terminal::Failed(message)) => {
                log::warn!("session {} failed: {}", accumulator.session_id(), message);
                searching.store(false, Ordering::SeqCst);
                let _ = updates.send(SearchUpdate::Failed { message });
                return;
            }
            None => {}
        }
    }
}

fn time_out(
    accumulator: &mut SessionAccumulator,
    token: &CancellationToken,
    updates: &mpsc::UnboundedSender<SearchUpdate>,
    searching: &AtomicBool,
) {
    if token.is_cancelled() {
        accumulator.mark_cancelled();
        return;
    }
    let partial = accumulator.time_out();
    log::warn!(
        "session {} timed out with {} product(s) accumulated",
        accumulator.session_id(),
        partial.products.len()
    );
    searching.store(false, Ordering::SeqCst);
    let _ = updates.send(SearchUpdate::TimedOut(partial));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn products_event(widgets: serde_json::Value) -> StreamEvent {
        StreamEvent::new("products", json!({"event": "products", "response": {"widgets": widgets}}))
    }

    #[test]
    fn test_first_event_moves_pending_to_streaming() {
        let mut acc = SessionAccumulator::new("s1");
        assert_eq!(acc.state(), SessionState::Pending);
        acc.apply(&products_event(json!([])));
        assert_eq!(acc.state(), SessionState::Streaming);
    }

    #[test]
    fn test_duplicate_product_first_write_wins() {
        let mut acc = SessionAccumulator::new("s1");
        acc.apply(&products_event(json!([
            {"type": "product", "productId": "p1", "title": "Longboard A"}
        ])));
        acc.apply(&products_event(json!([
            {"type": "product", "productId": "p1", "title": "Longboard A (dup)"}
        ])));
        let applied = acc.apply(&StreamEvent::new("flow-end", json!({"event": "flow-end"})));

        assert_eq!(applied.terminal, Some(Terminal::Completed));
        assert_eq!(acc.state(), SessionState::Completed);
        assert_eq!(acc.result().products.len(), 1);
        assert_eq!(acc.result().products[0].title, "Longboard A");
    }

    #[test]
    fn test_product_without_id_dropped() {
        let mut acc = SessionAccumulator::new("s1");
        let applied = acc.apply(&products_event(json!([
            {"type": "product", "title": "no identity"},
            {"type": "product", "productId": "  ", "title": "blank identity"},
            {"type": "product", "productId": "p1", "title": "keeper"}
        ])));
        assert_eq!(applied.added.len(), 1);
        assert_eq!(acc.result().products.len(), 1);
        assert_eq!(acc.result().products[0].product_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_summary_latest_write_wins_and_empty_ignored() {
        let mut acc = SessionAccumulator::new("s1");
        acc.apply(&products_event(json!([{"type": "text", "text": "first"}])));
        acc.apply(&products_event(json!([{"type": "text", "text": ""}])));
        assert_eq!(acc.result().summary, "first");

        let applied = acc.apply(&products_event(json!([{"type": "text", "value": "second"}])));
        assert_eq!(applied.summary.as_deref(), Some("second"));
        assert_eq!(acc.result().summary, "second");
    }

    #[test]
    fn test_flow_error_is_terminal_and_stops_processing() {
        let mut acc = SessionAccumulator::new("s1");
        let applied = acc.apply(&StreamEvent::new(
            "flow-error",
            json!({"event": "flow-error", "message": "expired campaign"}),
        ));
        assert_eq!(applied.terminal, Some(Terminal::Failed("expired campaign".to_string())));
        assert_eq!(acc.state(), SessionState::Failed);
        assert!(acc.result().products.is_empty());

        // Anything after a terminal state is ignored.
        let applied = acc.apply(&products_event(json!([
            {"type": "product", "productId": "late", "title": "too late"}
        ])));
        assert!(applied.added.is_empty());
        assert!(acc.result().products.is_empty());
    }

    #[test]
    fn test_flow_error_without_message_uses_fallback() {
        let mut acc = SessionAccumulator::new("s1");
        let applied = acc.apply(&StreamEvent::new("flows-error", json!({"event": "flows-error"})));
        assert_eq!(applied.terminal, Some(Terminal::Failed("Search failed".to_string())));
    }

    #[test]
    fn test_products_in_terminating_flush_are_kept() {
        let mut acc = SessionAccumulator::new("s1");
        let applied = acc.apply(&StreamEvent::new(
            "products",
            json!({
                "event": "products",
                "status": "done",
                "response": {"widgets": [
                    {"type": "product", "productId": "p1", "title": "Longboard A"}
                ]}
            }),
        ));
        assert_eq!(applied.added.len(), 1);
        assert_eq!(applied.terminal, Some(Terminal::Completed));
        assert_eq!(acc.result().products.len(), 1);
    }

    #[test]
    fn test_time_out_freezes_partial_result() {
        let mut acc = SessionAccumulator::new("s1");
        acc.apply(&products_event(json!([
            {"type": "product", "productId": "p1", "title": "Longboard A"}
        ])));
        let partial = acc.time_out();
        assert_eq!(acc.state(), SessionState::TimedOut);
        assert_eq!(partial.products.len(), 1);
    }

    #[test]
    fn test_cancel_token_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wait_parks_until_cancel() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() never resolved")
            .unwrap();

        // Already-cancelled tokens resolve immediately.
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() did not resolve on a flipped token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_times_out_at_deadline_not_before() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let searching = Arc::new(AtomicBool::new(true));
        let token = CancellationToken::new();

        let driver = tokio::spawn(run_session(
            "s1".to_string(),
            event_rx,
            Duration::from_secs(25),
            token,
            update_tx,
            searching.clone(),
        ));

        event_tx
            .send(StreamEvent::new(
                "products",
                json!({"event": "products", "response": {"widgets": [
                    {"type": "product", "productId": "p1", "title": "Longboard A"}
                ]}}),
            ))
            .unwrap();

        assert!(matches!(
            update_rx.recv().await,
            Some(SearchUpdate::Products { .. })
        ));

        // Nothing terminal before the deadline.
        tokio::time::advance(Duration::from_secs(24)).await;
        assert!(update_rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        match update_rx.recv().await {
            Some(SearchUpdate::TimedOut(partial)) => {
                assert_eq!(partial.products.len(), 1);
            }
            other => panic!("expected TimedOut, got {:?}", other),
        }
        assert!(!searching.load(Ordering::SeqCst));
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_holds_closed_stream_until_deadline() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let driver = tokio::spawn(run_session(
            "s1".to_string(),
            event_rx,
            Duration::from_secs(25),
            token,
            update_tx,
            Arc::new(AtomicBool::new(true)),
        ));

        // Connection closes without a terminal event: silent completion,
        // resolved by the timeout and not a moment earlier.
        drop(event_tx);
        tokio::time::advance(Duration::from_secs(24)).await;
        assert!(update_rx.try_recv().is_err());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(update_rx.recv().await, Some(SearchUpdate::TimedOut(_))));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_driver_emits_nothing() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let searching = Arc::new(AtomicBool::new(true));
        let token = CancellationToken::new();

        let driver = tokio::spawn(run_session(
            "s1".to_string(),
            event_rx,
            Duration::from_millis(200),
            token.clone(),
            update_tx,
            searching.clone(),
        ));

        token.cancel();
        event_tx
            .send(StreamEvent::new("flow-end", json!({"event": "flow-end"})))
            .unwrap();

        driver.await.unwrap();
        assert!(update_rx.recv().await.is_none());
        // A superseded session must not clear the flag its successor set.
        assert!(searching.load(Ordering::SeqCst));
    }
}
