use crate::error::ProviderError;
use reqwest::{header::HeaderMap, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

/// Shared reqwest wrapper used by every HTTP adapter. Owns the base URL,
/// default headers and the auth strategy; normalizes error responses into
/// the taxonomy via [`map_error_response`].
#[derive(Clone, Debug)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpProviderClient {
    pub fn new(
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            ProviderError::Internal {
                message: format!("failed to create HTTP client: {e}"),
            }
        })?;

        let mut default_headers = HeaderMap::new();

        match auth {
            AuthStrategy::Bearer { token } => {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    default_headers.insert("Authorization", value);
                }
            }
            AuthStrategy::Header { name, value } => {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<reqwest::header::HeaderName>(), value.parse())
                {
                    default_headers.insert(name, value);
                }
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        let base_url = base_url.unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url,
            default_headers,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TResp, ProviderError> {
        let resp = self
            .http
            .request(Method::POST, self.build_url(path))
            .headers(self.default_headers.clone())
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    /// POST returning the raw response, for SSE / chunked streams. Status
    /// checking is left to the caller so stream errors can be normalized
    /// before any body is consumed.
    pub async fn post_json_raw<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<Response, ProviderError> {
        let resp = self
            .http
            .request(Method::POST, self.build_url(path))
            .headers(self.default_headers.clone())
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<TResp, ProviderError> {
        let resp = self
            .http
            .request(Method::GET, self.build_url(path))
            .headers(self.default_headers.clone())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }
}

/// Normalize an upstream error response into the taxonomy.
///
/// 401 ⇒ Unauthenticated; 429 ⇒ RateLimited with the `retry-after` hint;
/// 503/529 and other 5xx ⇒ ProviderBusy; 4xx carrying a safety payload ⇒
/// ContentFiltered; remaining 4xx ⇒ InvalidRequest.
pub async fn map_error_response(resp: Response) -> ProviderError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = resp.text().await.unwrap_or_default();
    let message = extract_error_message(&body);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthenticated {
            message: message.unwrap_or_else(|| "credential rejected".to_string()),
        },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        s if s.as_u16() == 529 || s == StatusCode::SERVICE_UNAVAILABLE => {
            ProviderError::ProviderBusy {
                message: message.unwrap_or_else(|| "overloaded".to_string()),
            }
        }
        s if s.is_server_error() => ProviderError::ProviderBusy {
            message: message.unwrap_or_else(|| format!("upstream returned {s}")),
        },
        s if s.is_client_error() => {
            if is_safety_payload(&body) {
                ProviderError::ContentFiltered {
                    reason: message.unwrap_or_else(|| "content policy violation".to_string()),
                }
            } else {
                ProviderError::InvalidRequest {
                    message: message.unwrap_or_else(|| format!("upstream rejected request ({s})")),
                }
            }
        }
        s => ProviderError::Transport {
            message: format!("unexpected upstream status {s}"),
        },
    }
}

/// Pull a message out of the common `{"error": {"message": ...}}` shapes.
fn extract_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| error.as_str().map(|s| s.to_string()))
}

/// Heuristic for upstream safety refusals: either an explicit error type
/// or the well-known refusal phrasing in the message.
fn is_safety_payload(body: &str) -> bool {
    let Some(value) = serde_json::from_str::<serde_json::Value>(body).ok() else {
        return false;
    };
    let error_type = value
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    if matches!(
        error_type,
        "content_filter" | "content_policy_violation" | "moderation" | "safety"
    ) {
        return true;
    }
    extract_error_message(body)
        .map(|m| {
            let m = m.to_lowercase();
            m.contains("content policy") || m.contains("safety") || m.contains("flagged")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn error_for(template: ResponseTemplate) -> ProviderError {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/test"))
            .respond_with(template)
            .mount(&server)
            .await;

        let client = HttpProviderClient::new(
            Duration::from_secs(5),
            Some(server.uri()),
            "http://unused",
            &HashMap::new(),
            AuthStrategy::None,
        )
        .unwrap();

        client
            .post_json::<_, serde_json::Value>("/v1/test", &serde_json::json!({}))
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn status_401_maps_to_unauthenticated() {
        let err = error_for(ResponseTemplate::new(401)).await;
        assert!(matches!(err, ProviderError::Unauthenticated { .. }));
    }

    #[tokio::test]
    async fn status_429_carries_retry_after() {
        let err = error_for(
            ResponseTemplate::new(429).insert_header("retry-after", "7"),
        )
        .await;
        match err {
            ProviderError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_529_maps_to_provider_busy() {
        let err = error_for(ResponseTemplate::new(529)).await;
        assert!(matches!(err, ProviderError::ProviderBusy { .. }));
    }

    #[tokio::test]
    async fn safety_payload_maps_to_content_filtered() {
        let err = error_for(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"type": "content_filter", "message": "flagged by moderation"}
        })))
        .await;
        assert!(matches!(err, ProviderError::ContentFiltered { .. }));
    }

    #[tokio::test]
    async fn plain_400_maps_to_invalid_request() {
        let err = error_for(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"message": "model is required"}
        })))
        .await;
        match err {
            ProviderError::InvalidRequest { message } => {
                assert_eq!(message, "model is required");
            }
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }
}
