use std::time::Duration;

use crate::error::{Result, SearchError};

// ============================================================================
// Configuration
// ============================================================================

/// Debounce delays outside this window degrade the experience either way
/// (too twitchy or too sluggish), so configured values are clamped into it.
pub const MIN_DEBOUNCE_MS: u64 = 300;
pub const MAX_DEBOUNCE_MS: u64 = 1000;

pub const DEFAULT_DEBOUNCE_MS: u64 = 550;
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 25_000;
pub const DEFAULT_MIN_WORD_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Base URL of the flow API, without trailing slash.
    pub api_base_url: String,
    /// Tenant search key. Required before any network call.
    pub search_key: String,
    /// Campaign identifier, consumed by the campaign runner (out of scope
    /// here); carried so one config object serves the whole widget.
    pub campaign_id: Option<String>,
    /// Language code sent with every flow request.
    pub language: String,
    /// Minimum whitespace-separated token count before a query is searched.
    pub min_word_count: usize,
    /// Delay between the last keystroke and the debounced evaluation.
    pub debounce: Duration,
    /// Wall-clock deadline for a session that never sends a terminal event.
    pub stream_timeout: Duration,
}

impl SearchConfig {
    pub fn new(api_base_url: impl Into<String>, search_key: impl Into<String>) -> Self {
        Self {
            api_base_url: strip_trailing_slash(api_base_url.into()),
            search_key: search_key.into().trim().to_string(),
            campaign_id: None,
            language: "en".to_string(),
            min_word_count: DEFAULT_MIN_WORD_COUNT,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            stream_timeout: Duration::from_millis(DEFAULT_STREAM_TIMEOUT_MS),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_base_url = std::env::var("INOPS_API_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
        let search_key = std::env::var("INOPS_SEARCH_KEY")
            .map_err(|_| SearchError::configuration("Missing INOPS_SEARCH_KEY"))?;

        let mut config = Self::new(api_base_url, search_key);
        config.campaign_id = std::env::var("INOPS_CAMPAIGN_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Ok(lang) = std::env::var("INOPS_LANGUAGE") {
            config.language = lang.trim().to_string();
        }
        if let Some(ms) = env_u64("INOPS_DEBOUNCE_MS") {
            config = config.with_debounce(Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64("INOPS_STREAM_TIMEOUT_MS") {
            config.stream_timeout = Duration::from_millis(ms);
        }
        config.require_search_key()?;
        Ok(config)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        let ms = (debounce.as_millis() as u64).clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS);
        self.debounce = Duration::from_millis(ms);
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Hard precondition: an empty search key means the widget was embedded
    /// without credentials. Fail fast, never retry.
    pub fn require_search_key(&self) -> Result<&str> {
        if self.search_key.is_empty() {
            return Err(SearchError::configuration("Missing INOPS_SEARCH_KEY"));
        }
        Ok(&self.search_key)
    }
}

fn strip_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SearchConfig::new("http://localhost:3000/", "key-1");
        assert_eq!(config.api_base_url, "http://localhost:3000");
        assert_eq!(config.min_word_count, 3);
        assert_eq!(config.debounce, Duration::from_millis(550));
        assert_eq!(config.stream_timeout, Duration::from_millis(25_000));
    }

    #[test]
    fn test_debounce_clamped() {
        let config = SearchConfig::new("http://x", "k").with_debounce(Duration::from_millis(50));
        assert_eq!(config.debounce, Duration::from_millis(300));

        let config = SearchConfig::new("http://x", "k").with_debounce(Duration::from_millis(5000));
        assert_eq!(config.debounce, Duration::from_millis(1000));

        let config = SearchConfig::new("http://x", "k").with_debounce(Duration::from_millis(700));
        assert_eq!(config.debounce, Duration::from_millis(700));
    }

    #[test]
    fn test_missing_search_key_fails_fast() {
        let config = SearchConfig::new("http://x", "   ");
        let err = config.require_search_key().unwrap_err();
        assert!(matches!(err, SearchError::Configuration(_)));
    }
}
