//! Core server: accepts TCP connections and serves the outer HTTP/1.1 API.
//!
//! Owns the server's Noise key and the collaborators shared by every Noise
//! session. Routes:
//! - `/ts2021`: upgrade to the Noise control channel
//! - `GET /key?v=<capver>`: the server's Noise public key
//! - `GET /health`: liveness check

use crate::body::{full, json_response, text_response, ResponseBody};
use crate::config::ServerConfig;
use crate::error::{HttpError, ServerResult};
use crate::gate;
use crate::mapper::MemoryMapper;
use crate::poll::MapSessionFactory;
use crate::register::Registrar;
use crate::registrar::MemoryRegistrar;
use crate::store::{MemoryNodeStore, NodeStore};
use crate::upgrade::{noise_upgrade_handler, TS2021_UPGRADE_PATH};
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ts2021_core::tailcfg::OverTlsPublicKeyResponse;
use ts2021_core::{CapabilityVersion, MachinePrivate, MachinePublic, NodePublic};

pub const KEY_PATH: &str = "/key";
pub const HEALTH_PATH: &str = "/health";

/// Everything a Noise session needs from the server.
pub struct ControlState {
    /// Server's static Noise key.
    pub noise_private_key: MachinePrivate,
    pub nodes: Arc<dyn NodeStore>,
    pub registrar: Arc<dyn Registrar>,
    pub mapper: Arc<dyn MapSessionFactory>,
    /// Cancelled on server shutdown; every session token is a child of it.
    pub shutdown: CancellationToken,
}

/// The control server instance.
pub struct ControlServer {
    state: Arc<ControlState>,
    read_header_timeout: Duration,
}

impl ControlServer {
    pub fn new(state: ControlState, read_header_timeout: Duration) -> Self {
        Self {
            state: Arc::new(state),
            read_header_timeout,
        }
    }

    /// Build a server with the in-memory store, registrar and mapper.
    pub fn from_config(config: &ServerConfig, noise_private_key: MachinePrivate) -> Self {
        let nodes = Arc::new(MemoryNodeStore::new());
        let registrar = MemoryRegistrar::new(nodes.clone(), config.preauth_keys.clone(), config.server_url.clone());
        let mapper = MemoryMapper::new(nodes.clone(), config.keepalive_interval, config.domain.clone());

        info!(
            public_key = %noise_private_key.public(),
            preauth_keys = config.preauth_keys.len(),
            "control server configured"
        );

        Self::new(
            ControlState {
                noise_private_key,
                nodes,
                registrar: Arc::new(registrar),
                mapper: Arc::new(mapper),
                shutdown: CancellationToken::new(),
            },
            config.read_header_timeout,
        )
    }

    pub fn state(&self) -> &Arc<ControlState> {
        &self.state
    }

    /// Cancelling this token stops the accept loop and shuts down every
    /// connection gracefully.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Accept connections until shutdown.
    pub async fn run(self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        let shutdown = self.state.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted connection");
                        let state = self.state.clone();
                        let timeout = self.read_header_timeout;
                        tokio::spawn(handle_connection(state, stream, remote, timeout));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        Ok(())
    }
}

async fn handle_connection(state: Arc<ControlState>, stream: TcpStream, remote: SocketAddr, timeout: Duration) {
    let shutdown = state.shutdown.clone();
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(&state, req, remote)) }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        if e.is_incomplete_message() || e.is_timeout() {
            debug!(%remote, error = %e, "connection closed");
        } else {
            warn!(%remote, error = %e, "connection error");
        }
    }
}

/// Route one outer request.
pub fn handle_request<B>(state: &Arc<ControlState>, req: Request<B>, remote: SocketAddr) -> Response<ResponseBody>
where
    B: Send + 'static,
{
    match (req.method(), req.uri().path()) {
        (_, TS2021_UPGRADE_PATH) => noise_upgrade_handler(state, req, remote),
        (&Method::GET, KEY_PATH) => match key_handler(state, req.uri()) {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        },
        (&Method::GET, HEALTH_PATH) => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Serve the server's Noise public key.
///
/// A client that declares its capability version via `?v=` is checked
/// against the supported minimum first.
fn key_handler(state: &ControlState, uri: &Uri) -> Result<Response<ResponseBody>, HttpError> {
    let declared = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .find_map(|pair| pair.strip_prefix("v="));
    if let Some(v) = declared {
        let version: i32 = v
            .parse()
            .map_err(|_| HttpError::bad_request(format!("invalid capability version {v:?}")))?;
        gate::reject_unsupported(
            CapabilityVersion(version),
            &MachinePublic::default(),
            &NodePublic::default(),
        )?;
    }

    let resp = OverTlsPublicKeyResponse {
        legacy_public_key: MachinePublic::default(),
        public_key: state.noise_private_key.public(),
    };
    let json = serde_json::to_vec(&resp).map_err(HttpError::internal)?;
    Ok(json_response(StatusCode::OK, full(json)))
}
