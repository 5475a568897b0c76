use hyper::{Body, Response};

use crate::ledger::LedgerError;

/// Everything a gateway request can fail with, mapped onto HTTP at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing or invalid api key")]
    Unauthenticated,

    #[error("caller ip is not allowed for this api key")]
    IpForbidden,

    #[error("no available client")]
    NoAvailableClient,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("upstream request failed: {0}")]
    UpstreamFailure(String),

    #[error("upstream request timeout")]
    UpstreamTimeout,

    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    #[error("client configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::IpForbidden | GatewayError::NoAvailableClient => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamFailure(_)
            | GatewayError::UpstreamTimeout
            | GatewayError::LedgerInconsistency(_)
            | GatewayError::Configuration(_)
            | GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "invalid_api_key",
            GatewayError::IpForbidden => "ip_forbidden",
            GatewayError::NoAvailableClient => "no_available_client",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::NotFound => "not_found",
            GatewayError::PayloadTooLarge => "body_too_large",
            GatewayError::UpstreamFailure(_) => "upstream_error",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::LedgerInconsistency(_) => "ledger_inconsistency",
            GatewayError::Configuration(_) => "client_misconfigured",
            GatewayError::Storage(_) => "internal_error",
        }
    }

    pub fn into_response(self) -> Response<Body> {
        json_error(self.status(), &self.to_string(), self.code())
    }
}

impl From<LedgerError> for GatewayError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Storage(e) => GatewayError::Storage(e),
            LedgerError::Overflow(who) => GatewayError::BadRequest(format!("balance of {who} would overflow")),
            other => GatewayError::LedgerInconsistency(other.to_string()),
        }
    }
}

/// Standardized OpenAI-shaped JSON error response.
pub fn json_error(status: http::StatusCode, message: &str, code: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "gateway_error",
            "param": null,
            "code": code,
        }
    });
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from("gateway_error")))
}
