use axum::http::Request;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::handlers::{self, AppState};
use crate::lifecycle::{LifecycleManager, SyncOptions};
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::registry::{InMemoryRepository, Registry, Repository};
use crate::relay::RelaySession;
use crate::runtime::{ContainerRuntime, DockerRuntime};

/// Main gateway struct wiring configuration into the running components.
pub struct Gateway {
    config: Config,
    state: AppState,
}

impl Gateway {
    /// Create a gateway with the default component set: an in-memory server
    /// store and, when reachable, the local Docker engine.
    pub fn new(config: Config) -> Result<Self> {
        let runtime: Option<Arc<dyn ContainerRuntime>> = if config.runtime.enabled {
            match DockerRuntime::connect() {
                Ok(runtime) => Some(Arc::new(runtime)),
                Err(err) => {
                    warn!("container runtime unavailable, lifecycle operations will be rejected: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Self::with_components(config, Arc::new(InMemoryRepository::new()), runtime)
    }

    /// Create a gateway from explicit collaborators. This is the seam used
    /// by tests to substitute a fake repository or runtime.
    pub fn with_components(
        config: Config,
        repo: Arc<dyn Repository>,
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.rate,
            config.rate_limit.burst,
        ));
        let _sweeper = limiter.clone().spawn_sweeper(
            config.rate_limit_sweep_interval(),
            config.rate_limit_idle_eviction(),
        );

        let metrics = Arc::new(Metrics::new()?);
        let registry = Arc::new(Registry::new(repo.clone()));
        let lifecycle = Arc::new(
            LifecycleManager::new(repo, runtime)
                .with_sync_options(SyncOptions::from(&config.capability_sync)),
        );
        let relay = Arc::new(RelaySession::new(
            limiter,
            metrics.clone(),
            config.relay_connect_timeout(),
        ));

        let state = AppState {
            registry,
            lifecycle,
            relay,
            metrics,
        };

        Ok(Self { config, state })
    }

    /// Build the HTTP router with the ambient middleware stack applied.
    pub fn router(&self) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(HarborRequestIdMaker))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );

        handlers::router(self.state.clone()).layer(middleware)
    }

    /// Serve the gateway until the process is terminated.
    pub async fn start(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Server(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| GatewayError::Server(format!("Server error: {}", e)))?;

        Ok(())
    }
}

#[derive(Clone, Copy)]
struct HarborRequestIdMaker;

impl MakeRequestId for HarborRequestIdMaker {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let request_id = Uuid::new_v4().to_string();
        Some(RequestId::new(request_id.parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_gateway_router_serves_health() {
        let gateway =
            Gateway::with_components(Config::default(), Arc::new(InMemoryRepository::new()), None)
                .unwrap();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = gateway.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_gateway_rejects_invalid_config() {
        let mut config = Config::default();
        config.rate_limit.rate = -1.0;

        let result =
            Gateway::with_components(config, Arc::new(InMemoryRepository::new()), None);
        assert!(result.is_err());
    }
}
