use serde_json::Value;

use crate::models::Widget;

// ============================================================================
// Stream Event
// ============================================================================

/// One decoded frame from a session stream. `name` may be empty when the
/// upstream sent neither an `event:` line nor an embedded `event` field.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub name: String,
    pub payload: Value,
}

impl StreamEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self { name: name.into(), payload }
    }

    /// `status` field, top level or nested under `data`.
    pub fn status(&self) -> Option<&str> {
        nested_str(&self.payload, "status")
    }

    /// Widgets from any of the upstream nestings: `response.widgets`,
    /// `data.response.widgets`, or a bare `widgets` array, after first
    /// unwrapping a `data` envelope when present.
    pub fn widgets(&self) -> Vec<Widget> {
        let env = envelope(&self.payload);
        let raw = env
            .pointer("/response/widgets")
            .or_else(|| env.pointer("/data/response/widgets"))
            .or_else(|| env.get("widgets").filter(|v| v.is_array()));
        match raw.and_then(Value::as_array) {
            Some(widgets) => widgets.iter().filter_map(Widget::from_value).collect(),
            None => Vec::new(),
        }
    }

    /// Human-readable message for error events: `message`, then `error`,
    /// each checked at the top level and under `data`.
    pub fn error_message(&self) -> Option<String> {
        nested_str(&self.payload, "message")
            .or_else(|| nested_str(&self.payload, "error"))
            .map(|s| s.to_string())
    }

    pub fn is_flow_error(&self) -> bool {
        matches!(self.name.as_str(), "flow-error" | "flows-error")
    }

    /// Completion is signalled by `status: "done"` or an end event name.
    pub fn signals_completion(&self) -> bool {
        self.status() == Some("done") || matches!(self.name.as_str(), "end" | "flow-end")
    }
}

/// `payload.data` when it is a non-null value, else the payload itself.
fn envelope(payload: &Value) -> &Value {
    payload.get("data").filter(|v| !v.is_null()).unwrap_or(payload)
}

/// Non-empty trimmed string at `key`, top level first, then under `data`.
fn nested_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    let direct = payload.get(key).and_then(Value::as_str).map(str::trim);
    match direct.filter(|s| !s.is_empty()) {
        Some(s) => Some(s),
        None => payload
            .pointer(&format!("/data/{}", key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty()),
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Incremental `event:`/`data:` line parser. Chunk boundaries may fall
/// anywhere; partial lines stay buffered until their terminator arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: String,
    pending_event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            if let Some(event) = self.parse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    fn parse_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            let name = name.trim();
            self.pending_event = if name.is_empty() { None } else { Some(name.to_string()) };
            return None;
        }
        let raw = line.strip_prefix("data:")?.trim();
        if raw == "[DONE]" {
            return None;
        }
        let payload: Value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Some(self.normalize(payload))
    }

    /// Payloads that already carry `event`/`response`/`data` structure are
    /// self-describing; anything else is attributed to the last `event:`
    /// line seen.
    fn normalize(&self, payload: Value) -> StreamEvent {
        let self_describing = payload.as_object().is_some_and(|obj| {
            obj.contains_key("event") || obj.contains_key("response") || obj.contains_key("data")
        });
        let name = if self_describing {
            nested_str(&payload, "event").unwrap_or_default().to_string()
        } else {
            self.pending_event.clone().unwrap_or_default()
        };
        StreamEvent::new(name, payload)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Widget;
    use serde_json::json;

    #[test]
    fn test_event_and_data_line_pairing() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: products\ndata: {\"widgets\":[]}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "products");
    }

    #[test]
    fn test_partial_line_buffered_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"event\":\"pro").is_empty());
        let events = parser.push(b"ducts\",\"response\":{\"widgets\":[]}}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "products");
    }

    #[test]
    fn test_non_json_payload_falls_back_to_raw_string() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: ping\ndata: still alive\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "ping");
        assert_eq!(events[0].payload, Value::String("still alive".to_string()));
    }

    #[test]
    fn test_done_sentinel_discarded() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: [DONE]\n").is_empty());
    }

    #[test]
    fn test_embedded_event_name_wins_over_line_name() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: message\ndata: {\"event\":\"flow-end\"}\n");
        assert_eq!(events[0].name, "flow-end");
    }

    #[test]
    fn test_nested_event_name_under_data() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"data: {\"data\":{\"event\":\"products\",\"response\":{\"widgets\":[]}}}\n");
        assert_eq!(events[0].name, "products");
    }

    #[test]
    fn test_multiple_events_in_one_flush() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b"event: a\ndata: {\"v\":1}\nevent: b\ndata: {\"v\":2}\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "a");
        assert_eq!(events[1].name, "b");
    }

    #[test]
    fn test_widgets_from_top_level_response() {
        let event = StreamEvent::new(
            "products",
            json!({"event": "products", "response": {"widgets": [
                {"type": "product", "productId": "p1", "title": "Longboard A"}
            ]}}),
        );
        let widgets = event.widgets();
        assert_eq!(widgets.len(), 1);
        match &widgets[0] {
            Widget::Product(p) => assert_eq!(p.product_id.as_deref(), Some("p1")),
            other => panic!("expected product widget, got {:?}", other),
        }
    }

    #[test]
    fn test_widgets_from_data_envelope() {
        let event = StreamEvent::new(
            "products",
            json!({"data": {"response": {"widgets": [
                {"type": "text", "text": "two boards found"}
            ]}}}),
        );
        assert_eq!(event.widgets().len(), 1);
    }

    #[test]
    fn test_widgets_from_bare_array() {
        let event = StreamEvent::new(
            "search-result",
            json!({"event": "search-result", "widgets": [
                {"type": "product", "id": "p2"}
            ]}),
        );
        assert_eq!(event.widgets().len(), 1);
    }

    #[test]
    fn test_error_message_extraction_order() {
        let event = StreamEvent::new("flow-error", json!({"event": "flow-error", "message": "expired campaign"}));
        assert_eq!(event.error_message().as_deref(), Some("expired campaign"));

        let event = StreamEvent::new("flow-error", json!({"event": "flow-error", "data": {"error": "backend down"}}));
        assert_eq!(event.error_message().as_deref(), Some("backend down"));

        let event = StreamEvent::new("flow-error", json!({"event": "flow-error"}));
        assert_eq!(event.error_message(), None);
    }

    #[test]
    fn test_completion_signals() {
        assert!(StreamEvent::new("flow-end", json!({"event": "flow-end"})).signals_completion());
        assert!(StreamEvent::new("end", json!({"event": "end"})).signals_completion());
        assert!(
            StreamEvent::new("products", json!({"event": "products", "data": {"status": "done"}}))
                .signals_completion()
        );
        assert!(!StreamEvent::new("products", json!({"event": "products"})).signals_completion());
    }

    #[test]
    fn test_flow_error_names() {
        assert!(StreamEvent::new("flow-error", json!({})).is_flow_error());
        assert!(StreamEvent::new("flows-error", json!({})).is_flow_error());
        assert!(!StreamEvent::new("flow-end", json!({})).is_flow_error());
    }
}
