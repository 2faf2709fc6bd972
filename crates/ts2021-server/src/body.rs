//! HTTP body helpers shared by the outer server and the Noise routes.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::{Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, Limited};
use hyper::body::Body;
use std::convert::Infallible;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response this server produces.
pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Request bodies larger than this are refused.
pub const MAX_REQUEST_BODY: usize = 4 * 1024 * 1024;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

pub fn full(content: impl Into<Bytes>) -> ResponseBody {
    Full::new(content.into()).boxed_unsync()
}

pub fn empty() -> ResponseBody {
    Empty::new().boxed_unsync()
}

fn with_status(status: StatusCode, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// A plain-text response.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    let mut response = with_status(status, full(message.into()));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_CONTENT_TYPE));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// A JSON response from an already encoded body.
pub fn json_response(status: StatusCode, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = with_status(status, body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

/// Read a whole request body, bounded by [`MAX_REQUEST_BODY`].
pub async fn read_body<B>(body: B) -> Result<Bytes, BoxError>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let collected = Limited::new(body, MAX_REQUEST_BODY).collect().await?;
    Ok(collected.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_response_sets_headers() {
        let resp = text_response(StatusCode::NOT_FOUND, "node not found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[CONTENT_TYPE], TEXT_CONTENT_TYPE);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"node not found");
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let body = Full::new(Bytes::from(vec![0u8; MAX_REQUEST_BODY + 1]));
        assert!(read_body(body).await.is_err());

        let body = Full::new(Bytes::from_static(b"{}"));
        assert_eq!(&read_body(body).await.unwrap()[..], b"{}");
    }
}
