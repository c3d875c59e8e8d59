use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Body of every accepted request.
pub const OK_RESPONSE: &str = "OK";

/// Reasons a request is turned away before its events reach the job store.
/// None of them is fatal to the process, and none is retried here.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Failed to read writeKey from header")]
    NoWriteKeyInAuth,
    #[error("Request body is nil")]
    RequestBodyNil,
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Request size exceeds max limit")]
    RequestBodyTooLarge,
    #[error("Invalid Write Key")]
    InvalidWriteKey,
    #[error("Max Requests Limit reached")]
    RateLimitExceeded,
}

impl GatewayError {
    /// Short tag used to label metrics and log lines.
    pub fn reason(&self) -> &'static str {
        match *self {
            Self::NoWriteKeyInAuth => "no_write_key",
            Self::RequestBodyNil => "body_nil",
            Self::InvalidJson => "invalid_json",
            Self::RequestBodyTooLarge => "body_too_large",
            Self::InvalidWriteKey => "invalid_write_key",
            Self::RateLimitExceeded => "rate_limited",
        }
    }

    /// The exact response body sent back to the caller.
    pub fn body(&self) -> String {
        format!("{self}\n")
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.body()).into_response()
    }
}

/// Outcome of one pipeline run, as seen by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(GatewayError),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Admission::Accepted => StatusCode::OK,
            Admission::Rejected(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn body(&self) -> String {
        match self {
            Admission::Accepted => OK_RESPONSE.to_string(),
            Admission::Rejected(err) => err.body(),
        }
    }
}

impl IntoResponse for Admission {
    fn into_response(self) -> Response {
        match self {
            Admission::Accepted => (StatusCode::OK, OK_RESPONSE).into_response(),
            Admission::Rejected(err) => err.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_bodies_end_with_newline() {
        assert_eq!(GatewayError::RequestBodyNil.body(), "Request body is nil\n");
        assert_eq!(GatewayError::InvalidJson.body(), "Invalid JSON\n");
        assert_eq!(
            GatewayError::RateLimitExceeded.body(),
            "Max Requests Limit reached\n"
        );
    }

    #[test]
    fn accepted_is_plain_ok() {
        let admission = Admission::Accepted;
        assert_eq!(admission.status(), StatusCode::OK);
        assert_eq!(admission.body(), "OK");
    }

    #[test]
    fn every_rejection_is_bad_request() {
        for err in [
            GatewayError::NoWriteKeyInAuth,
            GatewayError::RequestBodyNil,
            GatewayError::InvalidJson,
            GatewayError::RequestBodyTooLarge,
            GatewayError::InvalidWriteKey,
            GatewayError::RateLimitExceeded,
        ] {
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
            assert_eq!(Admission::Rejected(err).status(), StatusCode::BAD_REQUEST);
        }
    }
}
