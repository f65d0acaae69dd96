use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::SearchConfig;
use crate::error::{Result, SearchError};
use crate::models::{FlowRequest, UserInput};
use crate::session::CancellationToken;
use crate::sse::{SseParser, StreamEvent};

// ============================================================================
// Flow Client
// ============================================================================

/// Transport adapter for the flow API. Explicitly constructed and passed
/// around; there is no process-wide client singleton.
#[derive(Clone)]
pub struct FlowClient {
    http: reqwest::Client,
    config: Arc<SearchConfig>,
}

impl FlowClient {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Starts one flow execution and returns its session id.
    ///
    /// Fails with `Configuration` when the search key is missing (no
    /// request is sent), `Protocol` on a non-success response, and
    /// `MissingSessionId` when the body carries no usable id.
    pub async fn start_flow(&self, user_input: &UserInput) -> Result<String> {
        let search_key = self.config.require_search_key()?;
        let url = format!("{}/flow/execute", self.config.api_base_url);
        let body = FlowRequest {
            language: self.config.language.clone(),
            user_input: user_input.clone(),
        };

        let response = self
            .http
            .post(&url)
            .query(&[("searchKey", search_key)])
            .header("X-Search-Key", search_key)
            .header("Authorization", format!("SearchKey {}", search_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SearchError::protocol(
                format!("{} {}", status, text.trim()).trim().to_string(),
            ));
        }

        let json: Value = response.json().await?;
        let session_id = json
            .get("sessionId")
            .or_else(|| json.pointer("/data/sessionId"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if session_id.is_empty() {
            return Err(SearchError::MissingSessionId);
        }
        log::debug!("flow started, session {}", session_id);
        Ok(session_id.to_string())
    }

    /// Opens the per-session event stream and returns the receiving end.
    ///
    /// A spawned reader decodes frames until the stream ends, the receiver
    /// is dropped, or the token is cancelled; the latter two drop the
    /// response mid-body, which closes the connection. Connection failures
    /// are swallowed here (logged at warn): the caller observes silence and
    /// falls back on its own timeout, which is how a demo-grade streaming
    /// backend degrades gracefully.
    pub fn subscribe(
        &self,
        session_id: &str,
        token: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let search_key = self.config.search_key.clone();
        let url = format!(
            "{}/sse/session/{}",
            self.config.api_base_url,
            encode_path_segment(session_id)
        );
        let http = self.http.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let request = http
                .get(&url)
                .query(&[("searchKey", &search_key)])
                .header("X-Search-Key", &search_key)
                .header("Authorization", format!("SearchKey {}", search_key))
                .header("Accept", "text/event-stream")
                .send();
            let response = tokio::select! {
                response = request => response,
                _ = token.cancelled() => return,
            };

            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    log::warn!("session {} stream rejected: {}", session_id, r.status());
                    return;
                }
                Err(e) => {
                    log::warn!("session {} stream failed to open: {}", session_id, e);
                    return;
                }
            };

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = token.cancelled() => {
                        log::debug!("session {} stream cancelled", session_id);
                        return;
                    }
                    _ = tx.closed() => return,
                };
                let Some(chunk) = chunk else {
                    break;
                };
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // Mid-stream drop counts as silent completion.
                        log::warn!("session {} stream interrupted: {}", session_id, e);
                        return;
                    }
                };
                for event in parser.push(&chunk) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            log::debug!("session {} stream ended", session_id);
        });

        rx
    }
}

/// Percent-encoding for the session id path segment. Query-string values go
/// through reqwest's own encoder; path segments it leaves to the caller.
fn encode_path_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_encode_path_segment() {
        assert_eq!(encode_path_segment("plain-id_1.2~x"), "plain-id_1.2~x");
        assert_eq!(encode_path_segment("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_path_segment("key=v&x"), "key%3Dv%26x");
    }

    #[tokio::test]
    async fn test_missing_search_key_makes_no_request() {
        // Base URL points nowhere reachable; a Configuration error proves
        // the request was never attempted.
        let client = FlowClient::new(SearchConfig::new("http://127.0.0.1:1", ""));
        let err = client
            .start_flow(&UserInput::search("kid longboard beginner"))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_protocol_error() {
        let client = FlowClient::new(SearchConfig::new("http://127.0.0.1:1", "key"));
        let err = client
            .start_flow(&UserInput::search("kid longboard beginner"))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_cancel_closes_silent_stream_connection() {
        // Raw socket server: accepts the subscription, sends SSE headers,
        // never emits a frame, then waits for the client to hang up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n")
                .await
                .unwrap();
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        });

        let client = FlowClient::new(SearchConfig::new(format!("http://{}", addr), "key"));
        let token = CancellationToken::new();
        let rx = client.subscribe("s1", token.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        token.cancel();
        drop(rx);

        // The reader must drop the response, closing the connection even
        // though no chunk ever arrives.
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("connection stayed open after cancel")
            .unwrap();
    }
}
