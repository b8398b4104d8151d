//! Correlation ids and per-request deadlines at the HTTP boundary.
//!
//! Each request gets an ambient [`RequestContext`] carrying the
//! correlation id (honoring an incoming `x-request-id`) and the deadline
//! derived from the server's request timeout or the client's
//! `x-request-deadline-ms` header, whichever is sooner. Handlers thread
//! the context through every ensemble call so cancellation and deadline
//! exhaustion propagate to in-flight upstream work.

use axum::http::HeaderMap;
use helixagent_ensemble::context::RequestContext;
use std::time::Duration;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEADLINE_HEADER: &str = "x-request-deadline-ms";

/// Build the ambient context for an incoming request.
pub fn context_from_headers(headers: &HeaderMap, server_timeout: Duration) -> RequestContext {
    let id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut timeout = server_timeout;
    if let Some(requested) = headers
        .get(DEADLINE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        timeout = timeout.min(Duration::from_millis(requested));
    }

    RequestContext::with_id(id).with_timeout(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn incoming_request_id_is_honored() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-123"));
        let ctx = context_from_headers(&headers, Duration::from_secs(30));
        assert_eq!(ctx.id(), "req-123");
    }

    #[test]
    fn missing_request_id_generates_one() {
        let ctx = context_from_headers(&HeaderMap::new(), Duration::from_secs(30));
        assert!(!ctx.id().is_empty());
    }

    #[test]
    fn client_deadline_tightens_the_server_timeout() {
        let mut headers = HeaderMap::new();
        headers.insert(DEADLINE_HEADER, HeaderValue::from_static("200"));
        let ctx = context_from_headers(&headers, Duration::from_secs(300));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(200));
    }

    #[test]
    fn client_cannot_extend_the_server_timeout() {
        let mut headers = HeaderMap::new();
        headers.insert(DEADLINE_HEADER, HeaderValue::from_static("999999999"));
        let ctx = context_from_headers(&headers, Duration::from_secs(1));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }
}
