//! Client configuration.

use crate::error::{InvalidHeaderError, StreamError};
use crate::queue::{OwnershipPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::retry::RetryPolicy;
use crate::sse::DEFAULT_DATA_FIELD;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// Everything a [`StreamingClient`](crate::StreamingClient) needs to know.
///
/// Only `target` is required. The value is checked by [`validate`](Self::validate)
/// when the client is created.
///
/// | Field | Default |
/// |---|---|
/// | `headers` | none |
/// | `field_prefix` | `"data"` |
/// | `retry` | [`RetryPolicy::default`]: 2s initial, factor 10, 60s cap, 3 attempts |
/// | `queue_capacity` | 100 |
/// | `ownership` | [`OwnershipPolicy::Fail`] |
/// | `request_timeout` | none |
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Stream endpoint, an absolute `http` or `https` URL.
    pub target: String,
    /// Extra request headers sent on every connection attempt.
    pub headers: Vec<(String, String)>,
    /// Name of the field carrying the event payload.
    pub field_prefix: String,
    pub retry: RetryPolicy,
    /// Bound of the delivery queue.
    pub queue_capacity: usize,
    /// What the delivery queue does when a stale writer mutates it.
    pub ownership: OwnershipPolicy,
    /// Connection setup timeout for the HTTP transport.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            headers: Vec::new(),
            field_prefix: DEFAULT_DATA_FIELD.to_string(),
            retry: RetryPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ownership: OwnershipPolicy::default(),
            request_timeout: None,
        }
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_field_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.field_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_ownership(mut self, ownership: OwnershipPolicy) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), StreamError> {
        let url = reqwest::Url::parse(&self.target)
            .map_err(|e| StreamError::InvalidConfig(format!("target {:?}: {e}", self.target)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StreamError::InvalidConfig(format!(
                "target must be an http or https URL, got scheme {:?}",
                url.scheme()
            )));
        }

        let prefix = self.field_prefix.trim();
        if prefix.is_empty() || prefix != self.field_prefix || prefix.contains(':') {
            return Err(StreamError::InvalidConfig(format!(
                "field prefix must be a non-empty field name, got {:?}",
                self.field_prefix
            )));
        }

        if self.queue_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }

        if self.request_timeout == Some(Duration::ZERO) {
            return Err(StreamError::InvalidConfig(
                "request timeout must be greater than zero".to_string(),
            ));
        }

        self.header_map()?;
        Ok(())
    }

    /// User headers as a header map.
    pub(crate) fn header_map(&self) -> Result<HeaderMap, InvalidHeaderError> {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| InvalidHeaderError::InvalidName(key.clone()))?;
            let val = HeaderValue::from_str(value)
                .map_err(|_| InvalidHeaderError::InvalidValue(value.clone()))?;
            headers.insert(name, val);
        }
        Ok(headers)
    }
}
