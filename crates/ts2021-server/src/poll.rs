//! `/machine/map` over the Noise channel.
//!
//! A map request either gets one JSON reply or, when the client asks to
//! stream, a long-lived body carrying one update per frame:
//!
//! Wire format: `[4-byte little-endian length][JSON MapResponse]`
//!
//! The stream is fed by a task that stops when the request's token is
//! cancelled (connection closed, server shutting down) or the client drops
//! the body.

use crate::body::{empty, full, json_response, read_body, BoxError, ResponseBody};
use crate::error::HttpError;
use crate::gate::reject_unsupported;
use crate::session::NoiseSession;
use crate::store::StoreError;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use std::convert::Infallible;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use ts2021_core::tailcfg::{MapRequest, MapResponse, Node};

/// Updates buffered between the long-poll task and the response body.
pub const MAP_UPDATE_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum MapSessionError {
    #[error("{0}")]
    BadRequest(String),

    #[error("map session: {0}")]
    Internal(#[source] BoxError),
}

impl From<MapSessionError> for HttpError {
    fn from(err: MapSessionError) -> Self {
        match err {
            MapSessionError::BadRequest(msg) => HttpError::bad_request(msg),
            MapSessionError::Internal(source) => HttpError::internal(source),
        }
    }
}

/// Creates one map session per map request.
pub trait MapSessionFactory: Send + Sync {
    fn new_session(
        &self,
        request: MapRequest,
        node: Node,
        cancel: CancellationToken,
    ) -> Result<Box<dyn MapSession>, MapSessionError>;
}

/// Serves a single map request.
pub trait MapSession: Send {
    /// Whether the client asked for a stream of updates.
    fn is_streaming(&self) -> bool;

    /// Produce the single reply. `None` means an empty 200.
    fn serve(self: Box<Self>) -> BoxFuture<'static, Result<Option<MapResponse>, MapSessionError>>;

    /// Push updates until done, cancelled or the client goes away.
    fn serve_long_poll(self: Box<Self>, updates: MapUpdates) -> BoxFuture<'static, Result<(), MapSessionError>>;
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("map update stream closed")]
    Closed,

    #[error("encode map update: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sending half of a streaming map response.
pub struct MapUpdates {
    tx: mpsc::Sender<Bytes>,
}

impl MapUpdates {
    /// Frame and queue one update, waiting for buffer space.
    pub async fn send(&self, update: &MapResponse) -> Result<(), SendError> {
        let frame = encode_update(update)?;
        self.tx.send(frame).await.map_err(|_| SendError::Closed)
    }
}

/// Encode one streamed update.
pub fn encode_update(update: &MapResponse) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(update)?;
    let mut buf = BytesMut::with_capacity(4 + json.len());
    buf.put_u32_le(json.len() as u32);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Run a streaming session on its own task and return the body it feeds.
///
/// The body ends when the task does.
pub fn spawn_long_poll(
    session: Box<dyn MapSession>,
    cancel: CancellationToken,
) -> (ResponseBody, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Bytes>(MAP_UPDATE_BUFFER);
    let watcher = tx.clone();
    let updates = MapUpdates { tx };

    let task = tokio::spawn(async move {
        tokio::select! {
            res = session.serve_long_poll(updates) => match res {
                Ok(()) => debug!("long poll finished"),
                Err(e) => warn!(error = %e, "long poll failed"),
            },
            _ = cancel.cancelled() => debug!("long poll cancelled"),
            _ = watcher.closed() => debug!("long poll client went away"),
        }
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(Frame::data(frame)), rx))
    });
    (StreamBody::new(stream).boxed_unsync(), task)
}

impl NoiseSession {
    /// Handle a map request.
    pub async fn handle_poll_netmap<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        match self.poll_netmap(req).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        }
    }

    async fn poll_netmap<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>, HttpError>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let body = read_body(req.into_body()).await.map_err(HttpError::internal)?;
        let request: MapRequest = serde_json::from_slice(&body).map_err(HttpError::internal)?;

        trace!(
            machine_key = %self.machine_key().short_string(),
            node_key = %request.node_key.short_string(),
            stream = request.stream,
            omit_peers = request.omit_peers,
            "a node sending a MapRequest with Noise protocol"
        );

        reject_unsupported(request.version, &self.machine_key(), &request.node_key)?;
        self.record_node_key(request.node_key);

        let node = match self.state().nodes.get_node_by_node_key(request.node_key).await {
            Ok(node) => node,
            Err(StoreError::NotFound) => {
                return Err(HttpError::new(StatusCode::NOT_FOUND, "node not found"));
            }
            Err(e) => return Err(HttpError::internal(e)),
        };

        let cancel = self.cancel_token().child_token();
        let session = self.state().mapper.new_session(request, node, cancel.clone())?;

        if session.is_streaming() {
            let (body, _task) = spawn_long_poll(session, cancel);
            return Ok(json_response(StatusCode::OK, body));
        }

        match session.serve().await? {
            Some(resp) => {
                let json = serde_json::to_vec(&resp).map_err(HttpError::internal)?;
                Ok(json_response(StatusCode::OK, full(json)))
            }
            None => Ok(json_response(StatusCode::OK, empty())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collect_text, json_request, test_session, TestState};
    use std::time::Duration;
    use ts2021_core::{CapabilityVersion, NodePublic};

    fn request(node_key: NodePublic, stream: bool) -> MapRequest {
        MapRequest {
            version: CapabilityVersion(106),
            node_key,
            stream,
            ..Default::default()
        }
    }

    /// Read one length-prefixed update from a streaming body.
    async fn next_update(body: &mut ResponseBody) -> Option<MapResponse> {
        let mut buf = Vec::new();
        loop {
            if buf.len() >= 4 {
                let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
                if buf.len() >= 4 + len {
                    return Some(serde_json::from_slice(&buf[4..4 + len]).unwrap());
                }
            }
            let frame = body.frame().await?.unwrap();
            buf.extend_from_slice(&frame.into_data().unwrap());
        }
    }

    #[test]
    fn update_frames_are_little_endian_length_prefixed() {
        let frame = encode_update(&MapResponse::keep_alive()).unwrap();
        let json = br#"{"KeepAlive":true}"#;
        assert_eq!(&frame[..4], &(json.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..], json);
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let session = test_session(TestState::new().build(), 106);
        let nk = NodePublic::from_raw32([4u8; 32]);
        let resp = session
            .handle_poll_netmap(json_request("POST", "/machine/map", &request(nk, false)))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(collect_text(resp).await, "node not found");
        assert_eq!(session.last_node_key(), Some(nk));
    }

    #[tokio::test]
    async fn old_client_is_rejected_before_lookup() {
        let session = test_session(TestState::new().build(), 106);
        let mut req = request(NodePublic::from_raw32([4u8; 32]), false);
        req.version = CapabilityVersion(60);
        let resp = session
            .handle_poll_netmap(json_request("POST", "/machine/map", &req))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(collect_text(resp).await.contains("(60)"));
        assert_eq!(session.last_node_key(), None);
    }

    #[tokio::test]
    async fn single_reply_carries_self_node() {
        let state = TestState::new();
        let node = state.add_node(1).await;
        let session = test_session(state.build(), 106);

        let resp = session
            .handle_poll_netmap(json_request("GET", "/machine/map", &request(node.key, false)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let map: MapResponse = serde_json::from_str(&collect_text(resp).await).unwrap();
        assert_eq!(map.node.unwrap().key, node.key);
    }

    #[tokio::test]
    async fn stream_ends_when_client_drops_body() {
        let state = TestState::new();
        let node = state.add_node(1).await;
        let session = test_session(state.build(), 106);

        let req = request(node.key, true);
        let map_session = session
            .state()
            .mapper
            .new_session(req, node.clone(), CancellationToken::new())
            .unwrap();
        assert!(map_session.is_streaming());

        let (mut body, task) = spawn_long_poll(map_session, CancellationToken::new());
        let first = next_update(&mut body).await.unwrap();
        assert_eq!(first.node.unwrap().key, node.key);

        drop(body);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("long poll should stop once the body is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn stream_ends_on_cancellation() {
        let state = TestState::new();
        let node = state.add_node(1).await;
        let session = test_session(state.build(), 106);

        let cancel = CancellationToken::new();
        let map_session = session
            .state()
            .mapper
            .new_session(request(node.key, true), node, cancel.clone())
            .unwrap();
        let (mut body, task) = spawn_long_poll(map_session, cancel.clone());
        assert!(next_update(&mut body).await.is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        // Whatever was queued drains, then the body ends.
        while body.frame().await.is_some() {}
    }

    #[tokio::test]
    async fn streaming_response_is_served_through_handler() {
        let state = TestState::new();
        let node = state.add_node(1).await;
        let peer = state.add_node(2).await;
        let session = test_session(state.build(), 106);

        let resp = session
            .handle_poll_netmap(json_request("POST", "/machine/map", &request(node.key, true)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();
        let first = next_update(&mut body).await.unwrap();
        assert_eq!(first.peers.len(), 1);
        assert_eq!(first.peers[0].key, peer.key);

        session.cancel_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while body.frame().await.is_some() {}
        })
        .await
        .expect("body should end after the session is cancelled");
    }
}
