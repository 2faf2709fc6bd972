//! Per-connection state for an upgraded Noise connection.
//!
//! A [`NoiseSession`] lives as long as its connection. It owns the challenge
//! key sent in the early payload, remembers the last node key a client
//! presented, and serves HTTP/2 over the decrypted stream. Requests on the
//! same connection run concurrently and share the session through an `Arc`.

use crate::body::{text_response, BoxError, ResponseBody};
use crate::error::HttpError;
use crate::router::{self, Resolution, Route};
use crate::server::ControlState;
use crate::upgrade::EarlyNoiseHook;
use http::{Request, Response, StatusCode};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use ts2021_core::tailcfg::EarlyNoise;
use ts2021_core::{
    is_supported_version, write_early_payload, CapabilityVersion, ChallengePrivate,
    ChallengePublic, ControlError, ControlResult, MachinePublic, NodePublic,
};

/// HTTP/2 PING interval on an idle connection.
const H2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A PING left unanswered this long closes the connection.
const H2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

pub struct NoiseSession {
    state: Arc<ControlState>,
    machine_key: MachinePublic,
    challenge: ChallengePrivate,
    protocol_version: CapabilityVersion,
    node_key: watch::Sender<Option<NodePublic>>,
    cancel: CancellationToken,
}

impl NoiseSession {
    /// Create the session for a freshly accepted connection.
    ///
    /// The session's token is a child of the server's shutdown token.
    pub fn new(
        state: Arc<ControlState>,
        machine_key: MachinePublic,
        protocol_version: CapabilityVersion,
    ) -> Self {
        let cancel = state.shutdown.child_token();
        Self {
            state,
            machine_key,
            challenge: ChallengePrivate::generate(),
            protocol_version,
            node_key: watch::Sender::new(None),
            cancel,
        }
    }

    pub fn state(&self) -> &Arc<ControlState> {
        &self.state
    }

    /// The peer's machine key, fixed for the connection's lifetime.
    pub fn machine_key(&self) -> MachinePublic {
        self.machine_key
    }

    pub fn protocol_version(&self) -> CapabilityVersion {
        self.protocol_version
    }

    pub fn challenge_public(&self) -> ChallengePublic {
        self.challenge.public()
    }

    /// Last node key seen on this connection, if any request carried one.
    pub fn last_node_key(&self) -> Option<NodePublic> {
        *self.node_key.borrow()
    }

    /// Record the node key of a decoded request. Concurrent requests race
    /// and the latest write wins.
    pub fn record_node_key(&self, node_key: NodePublic) {
        self.node_key.send_replace(Some(node_key));
    }

    /// Cancelled when the connection ends or the server shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dispatch one inner request.
    pub async fn route<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        trace!(method = %req.method(), path = req.uri().path(), "noise request");
        match router::resolve(req.method(), req.uri().path()) {
            Resolution::Matched(Route::Register) => self.handle_register(req).await,
            Resolution::Matched(Route::Map) => self.handle_poll_netmap(req).await,
            Resolution::MethodNotAllowed => {
                HttpError::new(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
            }
            Resolution::NotFound => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    /// Serve HTTP/2 over the decrypted stream until the client goes away or
    /// the session is cancelled.
    ///
    /// Cancellation shuts the connection down gracefully, letting in-flight
    /// requests finish. The session's token is cancelled on return.
    pub async fn serve<S>(self: Arc<Self>, io: S) -> Result<(), hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = self.cancel.clone().drop_guard();

        let session = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let session = session.clone();
            async move { Ok::<_, Infallible>(session.route(req).await) }
        });

        let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(H2_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(H2_KEEPALIVE_TIMEOUT)
            .serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            res = conn.as_mut() => res,
            _ = self.cancel.cancelled() => {
                debug!(machine_key = %self.machine_key.short_string(), "shutting down noise connection");
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        debug!(machine_key = %self.machine_key.short_string(), "noise connection finished");
        result
    }
}

impl EarlyNoiseHook for NoiseSession {
    fn early_noise(&self, protocol_version: CapabilityVersion, writer: &mut dyn Write) -> ControlResult<()> {
        if !is_supported_version(protocol_version) {
            return Err(ControlError::UnsupportedClientVersion(protocol_version));
        }
        write_early_payload(
            writer,
            &EarlyNoise {
                node_key_challenge: self.challenge_public(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collect_text, json_request, test_session, StubRegistrar, TestState};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::client::conn::http2::SendRequest;
    use tokio::sync::Notify;
    use ts2021_core::early::{Decoded, EarlyPayloadDecoder};
    use ts2021_core::tailcfg::{MapRequest, MapResponse, RegisterRequest, RegisterResponse};

    /// Serve `session` over an in-memory pipe and return an HTTP/2 client.
    async fn connect(session: Arc<NoiseSession>) -> (SendRequest<Full<Bytes>>, tokio::task::JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            session.serve(server_io).await.unwrap();
        });
        let (sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(client_io))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        (sender, server)
    }

    #[test]
    fn early_noise_writes_session_challenge() {
        let session = test_session(TestState::new().build(), 106);
        let mut buf = Vec::new();
        session.early_noise(CapabilityVersion(106), &mut buf).unwrap();

        match EarlyPayloadDecoder::new().feed(&buf).unwrap() {
            Decoded::Early(early, rest) => {
                assert_eq!(early.node_key_challenge, session.challenge_public());
                assert!(rest.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn early_noise_refuses_unsupported_version() {
        let session = test_session(TestState::new().build(), 60);
        let mut buf = Vec::new();
        let err = session.early_noise(CapabilityVersion(60), &mut buf).unwrap_err();
        assert!(matches!(err, ControlError::UnsupportedClientVersion(CapabilityVersion(60))));
        assert!(buf.is_empty());
    }

    #[test]
    fn challenge_is_per_session() {
        let state = TestState::new().build();
        let a = test_session(state.clone(), 106);
        let b = test_session(state, 106);
        assert_ne!(a.challenge_public(), b.challenge_public());
    }

    #[tokio::test]
    async fn unknown_path_and_wrong_method() {
        let session = test_session(TestState::new().build(), 106);

        let resp = session.route(json_request("POST", "/nope", &())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(collect_text(resp).await, "Not Found");

        let resp = session.route(json_request("GET", "/machine/register", &())).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn register_and_map_run_concurrently() {
        let gate = Arc::new(Notify::new());
        let state = TestState::new().registrar(StubRegistrar::ok(RegisterResponse {
            machine_authorized: true,
            ..Default::default()
        })
        .wait_for(gate.clone()));
        let node = state.add_node(1).await;
        let session = Arc::new(NoiseSession::new(state.build(), node.machine, CapabilityVersion(106)));
        let (sender, _server) = connect(session.clone()).await;

        // Registration blocks inside the registrar until `gate` is notified.
        let mut register_sender = sender.clone();
        let register = tokio::spawn(async move {
            let req = json_request(
                "POST",
                "/machine/register",
                &RegisterRequest {
                    version: CapabilityVersion(106),
                    node_key: ts2021_core::NodePublic::from_raw32([42u8; 32]),
                    ..Default::default()
                },
            );
            register_sender.send_request(req).await.unwrap()
        });

        let mut map_sender = sender.clone();
        let req = json_request(
            "POST",
            "/machine/map",
            &MapRequest {
                version: CapabilityVersion(106),
                node_key: node.key,
                ..Default::default()
            },
        );
        let resp = tokio::time::timeout(Duration::from_secs(5), map_sender.send_request(req))
            .await
            .expect("map request must not wait for the pending registration")
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let map: MapResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(map.node.unwrap().key, node.key);
        assert!(!register.is_finished());

        gate.notify_one();
        let resp = tokio::time::timeout(Duration::from_secs(5), register).await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let last = session.last_node_key().unwrap();
        assert!(last == node.key || last == ts2021_core::NodePublic::from_raw32([42u8; 32]));
    }

    #[tokio::test]
    async fn cancellation_ends_serve() {
        let session = test_session(TestState::new().build(), 106);
        let (_sender, server) = connect(session.clone()).await;

        session.state().shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve should return after shutdown")
            .unwrap();
        assert!(session.cancel_token().is_cancelled());
    }
}
