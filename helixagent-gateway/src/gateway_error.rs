//! # Gateway Error Mapping
//!
//! Maps the ensemble failure taxonomy onto HTTP statuses and the
//! structured `{"error": {"kind", "message", "code"}}` body. No other
//! error kinds leak to clients.
//!
//! | Taxonomy kind        | Status |
//! |----------------------|--------|
//! | Unauthenticated      | 401    |
//! | InvalidRequest       | 400    |
//! | ContentFiltered      | 400 (structured reason) |
//! | RateLimited          | 429    |
//! | NoEligibleProvider   | 503    |
//! | Timeout              | 504    |
//! | ProviderBusy / Transport | 502 |
//! | Internal / NoConsensus-hard | 500 |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use helixagent_ensemble::error::{EnsembleError, ProviderError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("ensemble error: {0}")]
    Ensemble(#[from] EnsembleError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("internal server error: {message}")]
    Internal { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Ensemble(e) => ensemble_status(e),
            GatewayError::Provider(e) => provider_status(e),
            GatewayError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            GatewayError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            GatewayError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

fn provider_status(error: &ProviderError) -> (StatusCode, &'static str) {
    match error {
        ProviderError::Unauthenticated { .. } => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        ProviderError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
        ProviderError::ContentFiltered { .. } => (StatusCode::BAD_REQUEST, "content_filtered"),
        ProviderError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        ProviderError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        ProviderError::ProviderBusy { .. } => (StatusCode::BAD_GATEWAY, "provider_busy"),
        ProviderError::Transport { .. } => (StatusCode::BAD_GATEWAY, "transport"),
        ProviderError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

fn ensemble_status(error: &EnsembleError) -> (StatusCode, &'static str) {
    match error {
        EnsembleError::Provider(e) => provider_status(e),
        EnsembleError::NoEligibleProvider { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "no_eligible_provider")
        }
        EnsembleError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        EnsembleError::NoConsensus { .. } => {
            // Only the hard case (no synthesis at all) reaches the error
            // path; the soft result is returned as a 200 upstream.
            (StatusCode::INTERNAL_SERVER_ERROR, "no_consensus")
        }
        EnsembleError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "request failed");
        }
        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": self.to_string(),
                "code": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(error: GatewayError) -> StatusCode {
        error.status_and_kind().0
    }

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(
            status_of(GatewayError::Provider(ProviderError::Unauthenticated {
                message: "k".into()
            })),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(GatewayError::Provider(ProviderError::ContentFiltered {
                reason: "policy".into()
            })),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(GatewayError::Ensemble(EnsembleError::NoEligibleProvider {
                message: "pool".into()
            })),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(GatewayError::Ensemble(EnsembleError::Timeout)),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(GatewayError::Provider(ProviderError::ProviderBusy {
                message: "load".into()
            })),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn content_filtered_kind_is_structured() {
        let error = GatewayError::Provider(ProviderError::ContentFiltered {
            reason: "policy".into(),
        });
        assert_eq!(error.status_and_kind().1, "content_filtered");
    }
}
