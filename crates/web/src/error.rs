//! Proxy error taxonomy and its mapping onto HTTP statuses and WebSocket
//! close codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Close code: no credential was presented.
pub const CLOSE_MISSING_TOKEN: u16 = 4001;
/// Close code: the credential did not authenticate.
pub const CLOSE_UNAUTHORIZED: u16 = 4003;
/// Close code: authenticated, but the instance cannot be relayed to.
pub const CLOSE_CANNOT_RELAY: u16 = 4004;
/// Close code: unexpected server-side failure.
pub const CLOSE_INTERNAL: u16 = 1011;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Not authenticated")]
    Unauthenticated,

    /// Covers both "does not exist" and "not yours".
    #[error("Instance not found")]
    NotFound,

    #[error("Instance is not running")]
    NotRunning,

    #[error("Container not reachable")]
    UpstreamUnreachable,

    #[error("Container timed out")]
    UpstreamTimeout,

    #[error("Bad gateway: {0}")]
    UpstreamProtocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Close code used when this error ends a WebSocket handshake.
    pub fn close_code(&self) -> u16 {
        match self {
            ProxyError::Unauthenticated => CLOSE_UNAUTHORIZED,
            ProxyError::NotFound | ProxyError::NotRunning => CLOSE_CANNOT_RELAY,
            ProxyError::UpstreamUnreachable
            | ProxyError::UpstreamTimeout
            | ProxyError::UpstreamProtocol(_) => CLOSE_CANNOT_RELAY,
            ProxyError::Internal(_) => CLOSE_INTERNAL,
        }
    }

    /// Message safe to show to the client.
    pub fn public_message(&self) -> String {
        match self {
            // Details of internal failures stay in the logs.
            ProxyError::Internal(_) => "Internal error".to_string(),
            ProxyError::UpstreamProtocol(_) => "Bad gateway".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status(),
            Json(serde_json::json!({ "error": self.public_message() })),
        )
            .into_response();

        if matches!(self, ProxyError::Unauthenticated) {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
