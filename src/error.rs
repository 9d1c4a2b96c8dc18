use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors the dispatcher can raise, tagged with the failure classification
/// from which "counted vs. not counted" and "failover-eligible vs. not"
/// are derived. This is the single place that decides those two
/// questions; nothing else in the crate re-derives them.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Connection refused, DNS failure, TLS failure, or a read reset
    /// before any response headers arrived.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// Non-2xx status from the upstream provider.
    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: StatusCode, message: String },

    /// Transport closed mid-response-body before any byte reached the
    /// client.
    #[error("response body read failed before commit: {0}")]
    BodyRead(String),

    /// Transport error after the first byte was already forwarded to
    /// the client. Never failover-eligible; the response is already
    /// committed.
    #[error("stream interrupted after commit: {0}")]
    StreamInterrupted(String),

    /// Transport error with no status and zero bytes read, or the
    /// client connection closed. Never counted as a provider failure.
    #[error("client aborted the request")]
    ClientAbort,

    /// Provider has no URL/key or fails its per-provider validator.
    /// Skipped pre-dispatch, never counted.
    #[error("provider misconfigured: {0}")]
    Config(String),

    /// Requested model is not in `supportedModels` and not a mapping
    /// key. Skipped pre-dispatch, never counted.
    #[error("model not served by this provider: {0}")]
    ModelGate(String),

    /// Body has no `model` field but a mapping was required for this
    /// attempt.
    #[error("cannot apply model mapping: {0}")]
    Mapping(String),

    /// No provider survived filtering.
    #[error("no providers available for this request")]
    NoCandidate { skipped: SkipCounters },

    /// Every candidate was attempted and failed.
    #[error("all providers failed")]
    TotalExhaustion {
        last_provider: String,
        last_error: String,
        total_attempts: u32,
        mode: &'static str,
    },

    /// Request body could not be parsed as JSON.
    #[error("invalid request body: {0}")]
    BadRequest(String),

    /// Anything else: config load failure, internal bug, I/O error
    /// outside the request path.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-request tally of why each candidate provider was skipped,
/// surfaced in the `404` body when no candidate survives filtering.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SkipCounters {
    pub disabled: u32,
    pub misconfigured: u32,
    pub model_gate: u32,
    pub blacklisted: u32,
}

impl SkipCounters {
    pub fn total(&self) -> u32 {
        self.disabled + self.misconfigured + self.model_gate + self.blacklisted
    }
}

impl RelayError {
    /// Is this classification counted against the provider's failure
    /// counter? (§4.2 `recordFailure`, §7.)
    pub fn is_counted_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_)
                | RelayError::UpstreamStatus { .. }
                | RelayError::BodyRead(_)
                | RelayError::StreamInterrupted(_)
        )
    }

    /// Is a further attempt against a different provider permitted
    /// after this error? Once a stream is committed, no.
    pub fn is_failover_eligible(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_) | RelayError::UpstreamStatus { .. } | RelayError::BodyRead(_)
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            RelayError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": { "message": msg, "type": "bad_request" } }),
            ),
            RelayError::NoCandidate { skipped } => (
                StatusCode::NOT_FOUND,
                json!({
                    "error": {
                        "message": "no providers available",
                        "type": "no_candidate",
                        "skipped": skipped,
                    }
                }),
            ),
            RelayError::TotalExhaustion {
                last_provider,
                last_error,
                total_attempts,
                mode,
            } => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": {
                        "message": "all providers failed",
                        "type": "total_exhaustion",
                        "last_provider": last_provider,
                        "last_error": last_error,
                        "total_attempts": total_attempts,
                        "mode": mode,
                        "hint": "check that each configured provider's base URL and API key are correct and that the upstream service is reachable",
                    }
                }),
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": { "message": other.to_string(), "type": "internal_error" } }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            RelayError::Transport(err)
        } else if let Some(status) = err.status() {
            RelayError::UpstreamStatus {
                status,
                message: err.to_string(),
            }
        } else {
            RelayError::Transport(err)
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::BadRequest(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_failures_match_spec_taxonomy() {
        assert!(RelayError::UpstreamStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "boom".into()
        }
        .is_counted_failure());
        assert!(!RelayError::ClientAbort.is_counted_failure());
        assert!(!RelayError::ModelGate("m".into()).is_counted_failure());
    }

    #[test]
    fn stream_interrupted_is_counted_but_not_failover_eligible() {
        let err = RelayError::StreamInterrupted("reset".into());
        assert!(err.is_counted_failure());
        assert!(!err.is_failover_eligible());
    }

    #[test]
    fn client_abort_never_counts_or_failovers() {
        let err = RelayError::ClientAbort;
        assert!(!err.is_counted_failure());
        assert!(!err.is_failover_eligible());
    }
}
