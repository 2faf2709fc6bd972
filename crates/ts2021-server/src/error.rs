//! Server error types.
//!
//! [`HttpError`] is what request handlers fail with: a status plus a message
//! that is safe to show the client. The underlying cause, if any, is only
//! logged. [`ServerError`] covers startup and the accept loop.

use crate::body::{text_response, BoxError, ResponseBody};
use http::{Response, StatusCode};
use thiserror::Error;
use tracing::{debug, error};
use ts2021_core::ControlError;

/// Client-facing message for every unexpected failure.
pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// A request failure with a client-safe message.
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    /// 500 with the generic message; `err` is kept for the log only.
    pub fn internal(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_SERVER_ERROR).with_source(err)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn with_source(mut self, err: impl Into<BoxError>) -> Self {
        self.source = Some(err.into());
        self
    }

    /// Log the failure and render it as a plain-text response.
    pub fn into_response(self) -> Response<ResponseBody> {
        let cause = self.source.as_ref().map(|e| e.to_string());
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), cause = ?cause, "{}", self.message);
        } else {
            debug!(status = self.status.as_u16(), cause = ?cause, "{}", self.message);
        }
        text_response(self.status, self.message)
    }
}

/// Errors from server startup and the accept loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Control(#[from] ControlError),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn internal_hides_cause() {
        let err = HttpError::internal(std::io::Error::other("disk on fire"));
        assert!(err.source.is_some());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], INTERNAL_SERVER_ERROR.as_bytes());
    }

    #[test]
    fn display_includes_status() {
        let err = HttpError::bad_request("invalid handshake header");
        assert_eq!(err.to_string(), "400 Bad Request: invalid handshake header");
    }
}
