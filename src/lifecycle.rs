//! Start/stop orchestration for managed servers.
//!
//! The lifecycle manager is the only component that moves a server record
//! between states. Start/stop for a given server id are serialized by an
//! advisory lock; operations on distinct ids proceed concurrently.

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::CapabilitySyncConfig;
use crate::error::{GatewayError, Result};
use crate::mcp::{methods, RpcRequest, RpcResponse};
use crate::registry::{ManagedServer, Repository, ServerStatus};
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// Correlation ids for the two introspection requests.
const SYNC_TOOLS_ID: &str = "sync-tools";
const SYNC_RESOURCES_ID: &str = "sync-resources";

/// Timing knobs for post-start capability introspection.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Delay before the first dial, giving the container time to listen.
    pub warmup: Duration,
    pub dial_attempts: u32,
    pub dial_backoff: Duration,
    pub read_timeout: Duration,
    pub read_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(2),
            dial_attempts: 5,
            dial_backoff: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            read_attempts: 5,
        }
    }
}

impl From<&CapabilitySyncConfig> for SyncOptions {
    fn from(config: &CapabilitySyncConfig) -> Self {
        Self {
            warmup: Duration::from_secs(config.warmup_secs),
            dial_attempts: config.dial_attempts,
            dial_backoff: Duration::from_secs(config.dial_backoff_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            read_attempts: config.read_attempts,
        }
    }
}

/// Drives server state transitions through the container runtime.
pub struct LifecycleManager {
    repo: Arc<dyn Repository>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    sync: SyncOptions,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    sync_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(repo: Arc<dyn Repository>, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        Self {
            repo,
            runtime,
            sync: SyncOptions::default(),
            locks: Mutex::new(HashMap::new()),
            sync_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sync_options(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }

    /// Whether a container runtime was configured for this deployment.
    pub fn runtime_configured(&self) -> bool {
        self.runtime.is_some()
    }

    /// Create and start the backing container for a registered server.
    ///
    /// On success the record is persisted as running and a detached
    /// capability-sync task is spawned; sync failures never surface here.
    pub async fn start_server(&self, id: Uuid) -> Result<()> {
        let runtime = self
            .runtime
            .clone()
            .ok_or(GatewayError::ContainerRuntimeUnavailable)?;

        let entry = self.entry_lock(id).await;
        let _guard = entry.lock().await;

        let mut server = self.repo.get_server(id).await?;

        let spec = ContainerSpec {
            image: server.image.clone(),
            env: extract_env(&server.config),
            ..Default::default()
        };

        let container_id = runtime.create(&spec).await?;

        if let Err(err) = runtime.start(&container_id).await {
            // Best-effort cleanup; the start error is returned unchanged.
            if let Err(remove_err) = runtime.remove(&container_id).await {
                warn!(
                    server_id = %id,
                    container_id = %container_id,
                    error = %remove_err,
                    "failed to remove container after failed start"
                );
            }
            return Err(err);
        }

        server.status = ServerStatus::Running;
        server.container_id = container_id.clone();
        server.updated_at = Utc::now();
        self.repo.update_server(&server).await?;

        info!(server_id = %id, container_id = %container_id, "server started");
        self.spawn_capability_sync(id).await;
        Ok(())
    }

    /// Stop and remove the backing container, returning the record to the
    /// stopped state. A no-op on the adapter when no container is recorded.
    pub async fn stop_server(&self, id: Uuid) -> Result<()> {
        let runtime = self
            .runtime
            .clone()
            .ok_or(GatewayError::ContainerRuntimeUnavailable)?;

        let entry = self.entry_lock(id).await;
        let _guard = entry.lock().await;

        if let Some(task) = self.sync_tasks.lock().await.remove(&id) {
            task.abort();
        }

        let mut server = self.repo.get_server(id).await?;

        if !server.container_id.is_empty() {
            runtime.stop(&server.container_id).await?;
            runtime.remove(&server.container_id).await?;
        }

        server.status = ServerStatus::Stopped;
        server.container_id = String::new();
        server.updated_at = Utc::now();
        self.repo.update_server(&server).await?;

        info!(server_id = %id, "server stopped");
        Ok(())
    }

    /// Check relay preconditions without attempting any connection. Returns
    /// the record so the transport layer can derive the backend endpoint.
    pub async fn validate_relay(&self, id: Uuid) -> Result<ManagedServer> {
        let server = self.repo.get_server(id).await?;
        if server.status != ServerStatus::Running {
            return Err(GatewayError::ContainerNotAvailable);
        }
        Ok(server)
    }

    async fn entry_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    async fn spawn_capability_sync(&self, id: Uuid) {
        let repo = self.repo.clone();
        let options = self.sync.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(options.warmup).await;
            if let Err(err) = sync_capabilities(repo, id, &options).await {
                error!(server_id = %id, error = %err, "capability sync failed");
            }
        });

        let mut tasks = self.sync_tasks.lock().await;
        if let Some(previous) = tasks.insert(id, handle) {
            previous.abort();
        }
    }
}

/// Connect to a freshly started backend and discover its declared tools and
/// resources, merging them into the server record.
pub(crate) async fn sync_capabilities(
    repo: Arc<dyn Repository>,
    id: Uuid,
    options: &SyncOptions,
) -> Result<()> {
    let mut server = repo.get_server(id).await?;
    let url = server.backend_ws_url();

    let mut stream = None;
    let mut last_err = None;
    for attempt in 0..options.dial_attempts {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                stream = Some(ws);
                break;
            }
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < options.dial_attempts {
                    tokio::time::sleep(options.dial_backoff).await;
                }
            }
        }
    }
    let Some(ws) = stream else {
        return Err(GatewayError::BackendUnreachable(format!(
            "dialing {} for capability sync: {}",
            url,
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        )));
    };

    let (mut sink, mut messages) = ws.split();

    if let Some(tools) = request_list(
        &mut sink,
        &mut messages,
        methods::TOOLS_LIST,
        SYNC_TOOLS_ID,
        "tools",
        options,
    )
    .await?
    {
        server.tools = Some(tools);
    }

    if let Some(resources) = request_list(
        &mut sink,
        &mut messages,
        methods::RESOURCES_LIST,
        SYNC_RESOURCES_ID,
        "resources",
        options,
    )
    .await?
    {
        server.resources = Some(resources);
    }

    server.updated_at = Utc::now();
    repo.update_server(&server).await
}

/// Issue one introspection request and scan responses for the matching
/// correlation id. Unmatched frames and timed-out reads are retried up to
/// the attempt limit; exhaustion yields `None` rather than an error.
async fn request_list<S, R>(
    sink: &mut S,
    messages: &mut R,
    method: &str,
    request_id: &str,
    result_key: &str,
    options: &SyncOptions,
) -> Result<Option<Vec<Value>>>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
    R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    let request = RpcRequest::new(json!(request_id), method);
    sink.send(Message::Text(serde_json::to_string(&request)?))
        .await
        .map_err(|e| GatewayError::BackendUnreachable(format!("sending {}: {}", method, e)))?;

    for _ in 0..options.read_attempts {
        match timeout(options.read_timeout, messages.next()).await {
            Err(_) => continue,
            Ok(None) | Ok(Some(Err(_))) => return Ok(None),
            Ok(Some(Ok(Message::Text(text)))) => {
                let Ok(response) = serde_json::from_str::<RpcResponse>(&text) else {
                    continue;
                };
                if response.id == json!(request_id) {
                    return Ok(response
                        .result
                        .and_then(|r| r.get(result_key).and_then(Value::as_array).cloned()));
                }
            }
            Ok(Some(Ok(_))) => continue,
        }
    }

    Ok(None)
}

/// Derive container environment variables from a server's free-form config:
/// every entry of a nested `env` map, plus any top-level UPPER_SNAKE key
/// with a string value. Other top-level keys are ignored.
pub(crate) fn extract_env(config: &Map<String, Value>) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(Value::Object(entries)) = config.get("env") {
        for (key, value) in entries {
            env.insert(key.clone(), env_value(value));
        }
    }

    for (key, value) in config {
        if key == "env" {
            continue;
        }
        if key.to_uppercase() == *key && key.contains('_') {
            if let Value::String(s) = value {
                env.insert(key.clone(), s.clone());
            }
        }
    }

    env
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContainerPhase;
    use crate::registry::{InMemoryRepository, Registry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRuntime {
        calls: std::sync::Mutex<Vec<String>>,
        fail_start: bool,
    }

    impl FakeRuntime {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            self.record(format!("create {}", spec.image));
            Ok("c1".to_string())
        }

        async fn start(&self, container_id: &str) -> Result<()> {
            self.record(format!("start {}", container_id));
            if self.fail_start {
                return Err(GatewayError::container(ContainerPhase::Start, "boom"));
            }
            Ok(())
        }

        async fn stop(&self, container_id: &str) -> Result<()> {
            self.record(format!("stop {}", container_id));
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> Result<()> {
            self.record(format!("remove {}", container_id));
            Ok(())
        }

        async fn status(&self, _container_id: &str) -> Result<ServerStatus> {
            Ok(ServerStatus::Running)
        }
    }

    struct CountingRepo {
        inner: InMemoryRepository,
        updates: AtomicUsize,
    }

    impl CountingRepo {
        fn new() -> Self {
            Self {
                inner: InMemoryRepository::new(),
                updates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Repository for CountingRepo {
        async fn list_servers(&self, owner_id: Uuid) -> Result<Vec<ManagedServer>> {
            self.inner.list_servers(owner_id).await
        }

        async fn get_server(&self, id: Uuid) -> Result<ManagedServer> {
            self.inner.get_server(id).await
        }

        async fn create_server(&self, server: &ManagedServer) -> Result<()> {
            self.inner.create_server(server).await
        }

        async fn update_server(&self, server: &ManagedServer) -> Result<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update_server(server).await
        }

        async fn delete_server(&self, id: Uuid) -> Result<()> {
            self.inner.delete_server(id).await
        }

        async fn search_servers(&self, query: &str) -> Result<Vec<ManagedServer>> {
            self.inner.search_servers(query).await
        }
    }

    fn quick_sync() -> SyncOptions {
        SyncOptions {
            // Long warm-up keeps the spawned background sync inert in tests
            // that exercise start/stop; sync itself is driven directly.
            warmup: Duration::from_secs(600),
            dial_attempts: 2,
            dial_backoff: Duration::from_millis(10),
            read_timeout: Duration::from_secs(1),
            read_attempts: 5,
        }
    }

    async fn register_demo(repo: Arc<dyn Repository>) -> ManagedServer {
        Registry::new(repo)
            .register(
                Uuid::new_v4(),
                "demo".to_string(),
                "demo:latest".to_string(),
                Map::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_without_runtime_fails_fast() {
        let repo = Arc::new(CountingRepo::new());
        let server = register_demo(repo.clone()).await;
        let manager = LifecycleManager::new(repo.clone(), None);

        let err = manager.start_server(server.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerRuntimeUnavailable));
        // The update path was never reached.
        assert_eq!(repo.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_without_runtime_fails_fast() {
        let repo = Arc::new(CountingRepo::new());
        let server = register_demo(repo.clone()).await;
        let manager = LifecycleManager::new(repo, None);

        let err = manager.stop_server(server.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerRuntimeUnavailable));
    }

    #[tokio::test]
    async fn test_start_missing_server() {
        let repo = Arc::new(InMemoryRepository::new());
        let runtime = Arc::new(FakeRuntime::default());
        let manager = LifecycleManager::new(repo, Some(runtime));

        let err = manager.start_server(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_failure_removes_created_container() {
        let repo = Arc::new(InMemoryRepository::new());
        let server = register_demo(repo.clone()).await;
        let runtime = Arc::new(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let manager = LifecycleManager::new(repo.clone(), Some(runtime.clone()));

        let err = manager.start_server(server.id).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ContainerOperation {
                phase: ContainerPhase::Start,
                ..
            }
        ));
        assert_eq!(
            runtime.calls(),
            vec!["create demo:latest", "start c1", "remove c1"]
        );

        let record = repo.get_server(server.id).await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
        assert!(record.container_id.is_empty());
    }

    #[tokio::test]
    async fn test_start_then_stop_roundtrip() {
        let repo = Arc::new(InMemoryRepository::new());
        let server = register_demo(repo.clone()).await;
        let runtime = Arc::new(FakeRuntime::default());
        let manager = LifecycleManager::new(repo.clone(), Some(runtime.clone()))
            .with_sync_options(quick_sync());

        manager.start_server(server.id).await.unwrap();
        let record = repo.get_server(server.id).await.unwrap();
        assert_eq!(record.status, ServerStatus::Running);
        assert_eq!(record.container_id, "c1");

        manager.stop_server(server.id).await.unwrap();
        let record = repo.get_server(server.id).await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
        assert!(record.container_id.is_empty());

        let calls = runtime.calls();
        assert_eq!(
            calls,
            vec!["create demo:latest", "start c1", "stop c1", "remove c1"]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let repo = Arc::new(InMemoryRepository::new());
        let server = register_demo(repo.clone()).await;
        let runtime = Arc::new(FakeRuntime::default());
        let manager = LifecycleManager::new(repo.clone(), Some(runtime.clone()))
            .with_sync_options(quick_sync());

        manager.start_server(server.id).await.unwrap();
        manager.stop_server(server.id).await.unwrap();

        let calls_before = runtime.calls().len();
        manager.stop_server(server.id).await.unwrap();
        // No container handle, so no adapter calls were made.
        assert_eq!(runtime.calls().len(), calls_before);

        let record = repo.get_server(server.id).await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_validate_relay_requires_running() {
        let repo = Arc::new(InMemoryRepository::new());
        let server = register_demo(repo.clone()).await;
        let runtime = Arc::new(FakeRuntime::default());
        let manager = LifecycleManager::new(repo.clone(), Some(runtime))
            .with_sync_options(quick_sync());

        let err = manager.validate_relay(server.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerNotAvailable));

        manager.start_server(server.id).await.unwrap();
        let record = manager.validate_relay(server.id).await.unwrap();
        assert_eq!(record.container_id, "c1");

        manager.stop_server(server.id).await.unwrap();
        let err = manager.validate_relay(server.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerNotAvailable));
    }

    #[tokio::test]
    async fn test_stop_aborts_pending_sync() {
        let repo = Arc::new(InMemoryRepository::new());
        let server = register_demo(repo.clone()).await;
        let runtime = Arc::new(FakeRuntime::default());
        let manager = LifecycleManager::new(repo, Some(runtime)).with_sync_options(SyncOptions {
            warmup: Duration::from_secs(60),
            ..quick_sync()
        });

        manager.start_server(server.id).await.unwrap();
        assert!(manager.sync_tasks.lock().await.contains_key(&server.id));

        manager.stop_server(server.id).await.unwrap();
        assert!(manager.sync_tasks.lock().await.is_empty());
    }

    #[test]
    fn test_extract_env() {
        let config: Map<String, Value> = serde_json::from_str(
            r#"{"env":{"DB_HOST":"localhost","DB_PORT":5432},"API_KEY":"secret","localonly":"x"}"#,
        )
        .unwrap();

        let env = extract_env(&config);
        assert_eq!(env.get("DB_HOST").map(String::as_str), Some("localhost"));
        assert_eq!(env.get("DB_PORT").map(String::as_str), Some("5432"));
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("secret"));
        assert!(!env.contains_key("localonly"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_extract_env_empty_config() {
        assert!(extract_env(&Map::new()).is_empty());
    }

    #[tokio::test]
    async fn test_sync_discovers_capabilities() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Ok(text) = msg.to_text() else { continue };
                let Ok(request) = serde_json::from_str::<RpcRequest>(text) else {
                    continue;
                };
                match request.method.as_str() {
                    "tools/list" => {
                        // Unrelated frame first; sync must skip it.
                        ws.send(Message::Text(
                            r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#.to_string(),
                        ))
                        .await
                        .unwrap();
                        ws.send(Message::Text(
                            r#"{"jsonrpc":"2.0","id":"sync-tools","result":{"tools":[{"name":"echo"},{"name":"add"}]}}"#
                                .to_string(),
                        ))
                        .await
                        .unwrap();
                    }
                    "resources/list" => {
                        ws.send(Message::Text(
                            r#"{"jsonrpc":"2.0","id":"sync-resources","result":{"resources":[{"uri":"file:///data"}]}}"#
                                .to_string(),
                        ))
                        .await
                        .unwrap();
                    }
                    _ => {}
                }
            }
        });

        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mut config = Map::new();
        config.insert("ws_port".to_string(), json!(port.to_string()));
        let server = Registry::new(repo.clone())
            .register(
                Uuid::new_v4(),
                "demo".to_string(),
                "demo:latest".to_string(),
                config,
            )
            .await
            .unwrap();

        sync_capabilities(repo.clone(), server.id, &quick_sync())
            .await
            .unwrap();

        let record = repo.get_server(server.id).await.unwrap();
        assert_eq!(record.tools.unwrap().len(), 2);
        assert_eq!(record.resources.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_gives_up_when_backend_unreachable() {
        // Bind and drop to find a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mut config = Map::new();
        config.insert("ws_port".to_string(), json!(port.to_string()));
        let server = Registry::new(repo.clone())
            .register(
                Uuid::new_v4(),
                "demo".to_string(),
                "demo:latest".to_string(),
                config,
            )
            .await
            .unwrap();

        let err = sync_capabilities(repo, server.id, &quick_sync())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnreachable(_)));
    }
}
