//! Node lookup and the in-memory node store.

use crate::body::BoxError;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use ts2021_core::tailcfg::Node;
use ts2021_core::NodePublic;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found")]
    NotFound,

    #[error("node store: {0}")]
    Backend(#[source] BoxError),
}

/// Lookup of registered nodes by node key.
pub trait NodeStore: Send + Sync {
    fn get_node_by_node_key(&self, node_key: NodePublic) -> BoxFuture<'_, Result<Node, StoreError>>;
}

/// Process-local node store.
///
/// Every mutation is announced on a broadcast channel so streaming map
/// sessions can push fresh maps.
pub struct MemoryNodeStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<()>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodePublic, Node>,
    next_id: u64,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                next_id: 1,
            }),
            changes,
        }
    }

    /// Insert or replace a node keyed by `node.key`.
    ///
    /// A node with `id == 0` is assigned the next free id and, if it has none,
    /// an address in 100.64.0.0/10.
    pub async fn insert(&self, mut node: Node) -> Node {
        {
            let mut inner = self.inner.write().await;
            if node.id == 0 {
                node.id = inner.next_id;
                inner.next_id += 1;
            } else {
                inner.next_id = inner.next_id.max(node.id + 1);
            }
            if node.stable_id.is_empty() {
                node.stable_id = format!("n{}", node.id);
            }
            if node.addresses.is_empty() {
                node.addresses = vec![node_address(node.id)];
            }
            inner.nodes.insert(node.key, node.clone());
        }
        debug!(node_id = node.id, node_key = %node.key.short_string(), "node stored");
        self.notify();
        node
    }

    pub async fn get(&self, node_key: &NodePublic) -> Option<Node> {
        self.inner.read().await.nodes.get(node_key).cloned()
    }

    /// All nodes, ordered by id.
    pub async fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.inner.read().await.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    /// Record endpoints and host info reported by a node.
    ///
    /// Returns `false` if the node is unknown.
    pub async fn update_endpoints(
        &self,
        node_key: &NodePublic,
        endpoints: Vec<String>,
        hostinfo: Option<serde_json::Value>,
    ) -> bool {
        {
            let mut inner = self.inner.write().await;
            let Some(node) = inner.nodes.get_mut(node_key) else {
                return false;
            };
            node.endpoints = endpoints;
            if hostinfo.is_some() {
                node.hostinfo = hostinfo;
            }
        }
        self.notify();
        true
    }

    /// Move a node from `old` to `new`, keeping its identity.
    pub async fn rekey(&self, old: &NodePublic, new: NodePublic) -> Option<Node> {
        let node = {
            let mut inner = self.inner.write().await;
            let mut node = inner.nodes.remove(old)?;
            node.key = new;
            inner.nodes.insert(new, node.clone());
            node
        };
        debug!(
            node_id = node.id,
            old_key = %old.short_string(),
            new_key = %new.short_string(),
            "node key rotated"
        );
        self.notify();
        Some(node)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        // No subscribers is fine.
        let _ = self.changes.send(());
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get_node_by_node_key(&self, node_key: NodePublic) -> BoxFuture<'_, Result<Node, StoreError>> {
        Box::pin(async move { self.get(&node_key).await.ok_or(StoreError::NotFound) })
    }
}

fn node_address(id: u64) -> String {
    let host = id.min(u64::from(u16::MAX)) as u16;
    format!("100.64.{}.{}/32", host >> 8, host & 0xff)
}
