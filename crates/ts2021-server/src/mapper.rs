//! In-memory map sessions built on [`MemoryNodeStore`].
//!
//! Every map is the full picture: the requesting node plus all other nodes
//! as peers. Streaming sessions resend it whenever the store changes and
//! send keep-alives in between.

use crate::poll::{MapSession, MapSessionError, MapSessionFactory, MapUpdates, SendError};
use crate::store::MemoryNodeStore;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use ts2021_core::tailcfg::{MapRequest, MapResponse, Node};

pub struct MemoryMapper {
    nodes: Arc<MemoryNodeStore>,
    keepalive_interval: Duration,
    domain: String,
}

impl MemoryMapper {
    pub fn new(nodes: Arc<MemoryNodeStore>, keepalive_interval: Duration, domain: impl Into<String>) -> Self {
        Self {
            nodes,
            keepalive_interval,
            domain: domain.into(),
        }
    }
}

impl MapSessionFactory for MemoryMapper {
    fn new_session(
        &self,
        request: MapRequest,
        node: Node,
        cancel: CancellationToken,
    ) -> Result<Box<dyn MapSession>, MapSessionError> {
        if request.read_only && !request.stream {
            return Err(MapSessionError::BadRequest(
                "read-only map requests must stream".into(),
            ));
        }
        if !request.compress.is_empty() {
            return Err(MapSessionError::BadRequest(format!(
                "unsupported compression {:?}",
                request.compress
            )));
        }
        Ok(Box::new(MemoryMapSession {
            nodes: self.nodes.clone(),
            keepalive_interval: self.keepalive_interval,
            domain: self.domain.clone(),
            request,
            node,
            cancel,
        }))
    }
}

struct MemoryMapSession {
    nodes: Arc<MemoryNodeStore>,
    keepalive_interval: Duration,
    domain: String,
    request: MapRequest,
    node: Node,
    cancel: CancellationToken,
}

impl MemoryMapSession {
    /// Store what the client reported about itself.
    async fn record_endpoints(&self) {
        if self.request.read_only {
            return;
        }
        if self.request.endpoints.is_empty() && self.request.hostinfo.is_none() {
            return;
        }
        self.nodes
            .update_endpoints(
                &self.node.key,
                self.request.endpoints.clone(),
                self.request.hostinfo.clone(),
            )
            .await;
    }

    async fn full_map(&self) -> MapResponse {
        let mut this = None;
        let mut peers = Vec::new();
        for node in self.nodes.list().await {
            if node.key == self.node.key {
                this = Some(node);
            } else {
                peers.push(node);
            }
        }
        MapResponse {
            keep_alive: false,
            // The node may have been removed since the request was routed.
            node: Some(this.unwrap_or_else(|| self.node.clone())),
            peers,
            domain: self.domain.clone(),
        }
    }

    async fn stream(&self, updates: MapUpdates) -> Result<(), SendError> {
        let mut changes = self.nodes.subscribe();
        self.record_endpoints().await;
        updates.send(&self.full_map().await).await?;

        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(node_key = %self.node.key.short_string(), "map stream cancelled");
                    return Ok(());
                }
                change = changes.recv() => match change {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        trace!(node_key = %self.node.key.short_string(), "sending map update");
                        updates.send(&self.full_map().await).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = keepalive.tick() => {
                    updates.send(&MapResponse::keep_alive()).await?;
                }
            }
        }
    }
}

impl MapSession for MemoryMapSession {
    fn is_streaming(&self) -> bool {
        self.request.stream
    }

    fn serve(self: Box<Self>) -> BoxFuture<'static, Result<Option<MapResponse>, MapSessionError>> {
        Box::pin(async move {
            self.record_endpoints().await;
            // Endpoint updates get an empty reply.
            if self.request.omit_peers {
                return Ok(None);
            }
            Ok(Some(self.full_map().await))
        })
    }

    fn serve_long_poll(self: Box<Self>, updates: MapUpdates) -> BoxFuture<'static, Result<(), MapSessionError>> {
        Box::pin(async move {
            match self.stream(updates).await {
                Ok(()) | Err(SendError::Closed) => Ok(()),
                Err(e @ SendError::Encode(_)) => Err(MapSessionError::Internal(e.into())),
            }
        })
    }
}
