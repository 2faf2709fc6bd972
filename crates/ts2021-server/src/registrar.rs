//! In-memory registrar backed by [`MemoryNodeStore`].
//!
//! Registration outcomes, in order:
//! - the node key is already known for this machine: authorized
//! - `OldNodeKey` names a node of this machine: the node moves to the new key
//! - a valid pre-auth key: a new node is created
//! - an invalid pre-auth key: 401
//! - no key at all: the client is sent to `<server_url>/register/<nodekey>`

use crate::register::{RegisterError, Registrar};
use crate::store::MemoryNodeStore;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use ts2021_core::tailcfg::{Node, RegisterRequest, RegisterResponse, UserProfile};
use ts2021_core::MachinePublic;

pub struct MemoryRegistrar {
    nodes: Arc<MemoryNodeStore>,
    preauth_keys: HashSet<String>,
    server_url: String,
    user: UserProfile,
}

impl MemoryRegistrar {
    pub fn new(
        nodes: Arc<MemoryNodeStore>,
        preauth_keys: impl IntoIterator<Item = String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            nodes,
            preauth_keys: preauth_keys.into_iter().collect(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user: UserProfile {
                id: 1,
                login_name: "default".into(),
                display_name: "Default".into(),
            },
        }
    }

    fn authorized(&self) -> RegisterResponse {
        RegisterResponse {
            user: self.user.clone(),
            login: self.user.clone(),
            machine_authorized: true,
            ..Default::default()
        }
    }

    async fn decide(
        &self,
        request: RegisterRequest,
        machine_key: MachinePublic,
    ) -> Result<RegisterResponse, RegisterError> {
        if request.node_key.is_zero() {
            return Err(RegisterError::BadRequest("missing node key".into()));
        }

        if let Some(node) = self.nodes.get(&request.node_key).await {
            if node.machine != machine_key {
                return Err(RegisterError::Unauthorized(
                    "node key is registered to another machine".into(),
                ));
            }
            return Ok(self.authorized());
        }

        if !request.old_node_key.is_zero() {
            if let Some(old) = self.nodes.get(&request.old_node_key).await {
                if old.machine == machine_key {
                    self.nodes.rekey(&request.old_node_key, request.node_key).await;
                    return Ok(self.authorized());
                }
            }
        }

        let auth_key = request
            .auth
            .as_ref()
            .map(|auth| auth.auth_key.as_str())
            .unwrap_or_default();
        if auth_key.is_empty() {
            return Ok(RegisterResponse {
                auth_url: format!("{}/register/{}", self.server_url, request.node_key),
                ..Default::default()
            });
        }
        if !self.preauth_keys.contains(auth_key) {
            return Err(RegisterError::Unauthorized("invalid pre auth key".into()));
        }

        let name = request
            .hostinfo
            .as_ref()
            .and_then(|h| h.get("Hostname"))
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();
        let node = self
            .nodes
            .insert(Node {
                name,
                user: self.user.id,
                key: request.node_key,
                machine: machine_key,
                hostinfo: request.hostinfo,
                ..Default::default()
            })
            .await;
        info!(
            node_id = node.id,
            node_key = %node.key.short_string(),
            machine_key = %machine_key.short_string(),
            "node registered with pre auth key"
        );
        Ok(self.authorized())
    }
}

impl Registrar for MemoryRegistrar {
    fn register(
        &self,
        request: RegisterRequest,
        machine_key: MachinePublic,
    ) -> BoxFuture<'_, Result<RegisterResponse, RegisterError>> {
        Box::pin(self.decide(request, machine_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts2021_core::tailcfg::RegisterAuth;
    use ts2021_core::{CapabilityVersion, NodePublic};

    fn registrar() -> (Arc<MemoryNodeStore>, MemoryRegistrar) {
        let store = Arc::new(MemoryNodeStore::new());
        let registrar = MemoryRegistrar::new(store.clone(), ["tskey-good".to_string()], "https://ctl.example/");
        (store, registrar)
    }

    fn request(node: u8, auth_key: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            version: CapabilityVersion(106),
            node_key: NodePublic::from_raw32([node; 32]),
            auth: auth_key.map(|k| RegisterAuth { auth_key: k.into() }),
            hostinfo: Some(serde_json::json!({ "Hostname": "laptop" })),
            ..Default::default()
        }
    }

    fn machine(b: u8) -> MachinePublic {
        MachinePublic::from_raw32([b; 32])
    }

    #[tokio::test]
    async fn preauth_key_creates_node() {
        let (store, registrar) = registrar();
        let resp = registrar.register(request(1, Some("tskey-good")), machine(1)).await.unwrap();
        assert!(resp.machine_authorized);
        assert_eq!(resp.user.login_name, "default");

        let node = store.get(&NodePublic::from_raw32([1u8; 32])).await.unwrap();
        assert_eq!(node.name, "laptop");
        assert_eq!(node.machine, machine(1));
        assert_eq!(node.addresses, vec!["100.64.0.1/32".to_string()]);
    }

    #[tokio::test]
    async fn bad_preauth_key_is_unauthorized() {
        let (store, registrar) = registrar();
        let err = registrar.register(request(1, Some("nope")), machine(1)).await.unwrap_err();
        assert!(matches!(err, RegisterError::Unauthorized(_)));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn no_key_gets_auth_url() {
        let (_, registrar) = registrar();
        let req = request(3, None);
        let node_key = req.node_key;
        let resp = registrar.register(req, machine(1)).await.unwrap();
        assert!(!resp.machine_authorized);
        assert_eq!(resp.auth_url, format!("https://ctl.example/register/{node_key}"));
    }

    #[tokio::test]
    async fn known_node_needs_same_machine() {
        let (_, registrar) = registrar();
        registrar.register(request(1, Some("tskey-good")), machine(1)).await.unwrap();

        let resp = registrar.register(request(1, None), machine(1)).await.unwrap();
        assert!(resp.machine_authorized);

        let err = registrar.register(request(1, None), machine(2)).await.unwrap_err();
        assert!(matches!(err, RegisterError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn old_node_key_rotates() {
        let (store, registrar) = registrar();
        registrar.register(request(1, Some("tskey-good")), machine(1)).await.unwrap();

        let mut req = request(2, None);
        req.old_node_key = NodePublic::from_raw32([1u8; 32]);
        let resp = registrar.register(req, machine(1)).await.unwrap();
        assert!(resp.machine_authorized);
        assert!(store.get(&NodePublic::from_raw32([1u8; 32])).await.is_none());
        assert_eq!(store.get(&NodePublic::from_raw32([2u8; 32])).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn zero_node_key_is_bad_request() {
        let (_, registrar) = registrar();
        let req = RegisterRequest::default();
        let err = registrar.register(req, machine(1)).await.unwrap_err();
        assert!(matches!(err, RegisterError::BadRequest(_)));
    }
}
