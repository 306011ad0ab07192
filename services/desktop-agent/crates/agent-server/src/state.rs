//! Shared application state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use desktop_agent_common::{AgentServerConfig, ToolRegistry};
use tokio::sync::Mutex;

use crate::runner::ProcessRunner;

/// Bookkeeping for one live client.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub active_tool: Option<String>,
}

/// State shared by every connection task.
///
/// The registry and config are read-only after startup; the connection
/// table is the only mutable shared structure.
#[derive(Debug)]
pub struct AppState {
    pub config: AgentServerConfig,
    pub registry: ToolRegistry,
    pub runner: ProcessRunner,
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
    next_id: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(config: AgentServerConfig, registry: ToolRegistry) -> Self {
        let runner = ProcessRunner::new(config.timeouts(), config.grace_period());
        Self {
            config,
            registry,
            runner,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Admit a new connection, or `None` when `max_connections` are live.
    pub async fn register(&self, peer: SocketAddr) -> Option<u64> {
        let mut connections = self.connections.lock().await;
        if connections.len() >= self.config.max_connections {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        connections.insert(
            id,
            ConnectionInfo {
                peer,
                connected_at: Utc::now(),
                active_tool: None,
            },
        );
        Some(id)
    }

    pub async fn unregister(&self, id: u64) {
        if let Some(info) = self.connections.lock().await.remove(&id) {
            let connected_secs = (Utc::now() - info.connected_at).num_seconds();
            tracing::debug!(connection_id = id, peer = %info.peer, connected_secs, "connection released");
        }
    }

    pub async fn set_active_tool(&self, id: u64, tool: Option<&str>) {
        if let Some(info) = self.connections.lock().await.get_mut(&id) {
            info.active_tool = tool.map(str::to_string);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Number of connections with a scan in flight.
    pub async fn active_scans(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|info| info.active_tool.is_some())
            .count()
    }
}
