//! Managed-server records, the persistence boundary, and registration.
//!
//! `Repository` is the seam to the persistence collaborator; the gateway only
//! depends on the trait so tests (and single-node deployments) can run on the
//! in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Control-channel port a backend listens on unless its configuration says
/// otherwise (`ws_port` key).
pub const DEFAULT_BACKEND_PORT: u16 = 8080;

/// Lifecycle state of a managed MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerStatus {
    /// States in which the record is expected to hold a container handle.
    pub fn holds_container(self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Error => "error",
        };
        f.write_str(status)
    }
}

/// A managed MCP server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedServer {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub image: String,
    pub status: ServerStatus,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<Value>>,
}

impl ManagedServer {
    /// Control-channel endpoint of the backing container, derived from the
    /// `ws_port` configuration hint.
    pub fn backend_ws_url(&self) -> String {
        let port = self
            .config
            .get("ws_port")
            .and_then(|value| match value {
                Value::String(s) => s.parse::<u16>().ok(),
                Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                _ => None,
            })
            .unwrap_or(DEFAULT_BACKEND_PORT);
        format!("ws://127.0.0.1:{}", port)
    }
}

/// Persistence operations for managed-server records.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_servers(&self, owner_id: Uuid) -> Result<Vec<ManagedServer>>;
    async fn get_server(&self, id: Uuid) -> Result<ManagedServer>;
    async fn create_server(&self, server: &ManagedServer) -> Result<()>;
    async fn update_server(&self, server: &ManagedServer) -> Result<()>;
    async fn delete_server(&self, id: Uuid) -> Result<()>;
    async fn search_servers(&self, query: &str) -> Result<Vec<ManagedServer>>;
}

/// In-memory repository backing tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryRepository {
    servers: RwLock<HashMap<Uuid, ManagedServer>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn list_servers(&self, owner_id: Uuid) -> Result<Vec<ManagedServer>> {
        let servers = self.servers.read().await;
        Ok(servers
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn get_server(&self, id: Uuid) -> Result<ManagedServer> {
        let servers = self.servers.read().await;
        servers
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("server {}", id)))
    }

    async fn create_server(&self, server: &ManagedServer) -> Result<()> {
        let mut servers = self.servers.write().await;
        if servers.contains_key(&server.id) {
            return Err(GatewayError::Persistence(format!(
                "server {} already exists",
                server.id
            )));
        }
        servers.insert(server.id, server.clone());
        Ok(())
    }

    async fn update_server(&self, server: &ManagedServer) -> Result<()> {
        let mut servers = self.servers.write().await;
        if !servers.contains_key(&server.id) {
            return Err(GatewayError::NotFound(format!("server {}", server.id)));
        }
        servers.insert(server.id, server.clone());
        Ok(())
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        let mut servers = self.servers.write().await;
        servers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("server {}", id)))
    }

    async fn search_servers(&self, query: &str) -> Result<Vec<ManagedServer>> {
        let query = query.to_lowercase();
        let servers = self.servers.read().await;
        Ok(servers
            .values()
            .filter(|s| {
                query.is_empty()
                    || s.name.to_lowercase().contains(&query)
                    || s.image.to_lowercase().contains(&query)
            })
            .cloned()
            .collect())
    }
}

/// Registration and discovery of managed servers.
pub struct Registry {
    repo: Arc<dyn Repository>,
}

impl Registry {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Create a new server record in the stopped state.
    pub async fn register(
        &self,
        owner_id: Uuid,
        name: String,
        image: String,
        config: Map<String, Value>,
    ) -> Result<ManagedServer> {
        let now = Utc::now();
        let server = ManagedServer {
            id: Uuid::new_v4(),
            owner_id,
            name,
            image,
            status: ServerStatus::Stopped,
            config,
            container_id: String::new(),
            created_at: now,
            updated_at: now,
            tools: None,
            resources: None,
        };
        self.repo.create_server(&server).await?;
        Ok(server)
    }

    pub async fn list(&self, owner_id: Uuid) -> Result<Vec<ManagedServer>> {
        self.repo.list_servers(owner_id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<ManagedServer> {
        self.repo.get_server(id).await
    }

    pub async fn discover(&self, query: &str) -> Result<Vec<ManagedServer>> {
        self.repo.search_servers(query).await
    }

    /// Remove a server record. Refused while the record still owns a
    /// container; callers must stop the server first.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let server = self.repo.get_server(id).await?;
        if server.status.holds_container() {
            return Err(GatewayError::ServerRunning);
        }
        self.repo.delete_server(id).await
    }
}
