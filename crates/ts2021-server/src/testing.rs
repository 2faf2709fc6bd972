//! Fixtures shared by the server's unit tests.

use crate::body::ResponseBody;
use crate::mapper::MemoryMapper;
use crate::register::{RegisterError, Registrar};
use crate::server::ControlState;
use crate::session::NoiseSession;
use crate::store::MemoryNodeStore;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use ts2021_core::tailcfg::{Node, RegisterRequest, RegisterResponse};
use ts2021_core::{CapabilityVersion, MachinePrivate, MachinePublic, NodePublic};

/// Registrar returning a canned outcome, optionally after a signal.
pub struct StubRegistrar {
    outcome: Box<dyn Fn() -> Result<RegisterResponse, RegisterError> + Send + Sync>,
    gate: Option<Arc<Notify>>,
}

impl StubRegistrar {
    pub fn ok(response: RegisterResponse) -> Self {
        Self {
            outcome: Box::new(move || Ok(response.clone())),
            gate: None,
        }
    }

    pub fn err(make: impl Fn() -> RegisterError + Send + Sync + 'static) -> Self {
        Self {
            outcome: Box::new(move || Err(make())),
            gate: None,
        }
    }

    /// Block each registration until `gate` is notified.
    pub fn wait_for(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl Registrar for StubRegistrar {
    fn register(
        &self,
        _request: RegisterRequest,
        _machine_key: MachinePublic,
    ) -> BoxFuture<'_, Result<RegisterResponse, RegisterError>> {
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            (self.outcome)()
        })
    }
}

/// Builder for a [`ControlState`] backed by in-memory collaborators.
pub struct TestState {
    pub nodes: Arc<MemoryNodeStore>,
    registrar: Option<Arc<dyn Registrar>>,
}

impl TestState {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(MemoryNodeStore::new()),
            registrar: None,
        }
    }

    pub fn registrar(mut self, registrar: impl Registrar + 'static) -> Self {
        self.registrar = Some(Arc::new(registrar));
        self
    }

    /// Store a node whose node and machine keys are filled with `b`.
    pub async fn add_node(&self, b: u8) -> Node {
        self.nodes
            .insert(Node {
                key: NodePublic::from_raw32([b; 32]),
                machine: MachinePublic::from_raw32([b; 32]),
                ..Default::default()
            })
            .await
    }

    pub fn build(self) -> Arc<ControlState> {
        let registrar = self.registrar.unwrap_or_else(|| {
            Arc::new(StubRegistrar::err(|| RegisterError::BadRequest("no registrar".into())))
        });
        Arc::new(ControlState {
            noise_private_key: MachinePrivate::generate(),
            nodes: self.nodes.clone(),
            registrar,
            mapper: Arc::new(MemoryMapper::new(self.nodes, Duration::from_secs(60), "")),
            shutdown: CancellationToken::new(),
        })
    }
}

pub fn test_session(state: Arc<ControlState>, version: i32) -> Arc<NoiseSession> {
    Arc::new(NoiseSession::new(
        state,
        MachinePublic::from_raw32([0xaa; 32]),
        CapabilityVersion(version),
    ))
}

pub fn json_request<T: Serialize>(method: &str, path: &str, body: &T) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Full::new(Bytes::from(serde_json::to_vec(body).unwrap())))
        .unwrap()
}

pub async fn collect_text(resp: Response<ResponseBody>) -> String {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(body.to_vec()).unwrap()
}
