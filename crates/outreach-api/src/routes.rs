//! API routes

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::get,
    Router,
};
use outreach_common::config::ApiConfig;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{trigger_auth, AppState};
use crate::handlers::{dispatch, health, metrics};
use crate::openapi::create_openapi_routes;

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let state = Arc::new(state);

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    // Trigger routes; GET is accepted for cron services that cannot POST
    let dispatch_routes = Router::new().route(
        "/run",
        get(dispatch::run_dispatch).post(dispatch::run_dispatch),
    );

    let api_v1 = Router::new()
        .nest("/dispatch", dispatch_routes)
        .layer(middleware::from_fn_with_state(state.clone(), trigger_auth))
        .with_state(state.clone());

    let mut router = Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .route("/metrics", get(metrics::metrics).with_state(state));

    if config.enable_swagger {
        router = router.merge(create_openapi_routes());
    }

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&config.cors_origins)),
    )
}

/// Without configured origins no CORS headers are sent, so only same-origin callers work
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    if allowed.is_empty() {
        cors
    } else {
        cors.allow_origin(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{header, HeaderName, StatusCode};
    use axum_test::TestServer;
    use outreach_core::{
        DispatchMetrics, DispatchSettings, DispatchSummary, Dispatcher, GatewayError,
        GatewayReceipt, MessagingGateway, OutboundMessage,
    };
    use outreach_storage::models::{
        AudienceSpec, CampaignStatus, CampaignType, CreateCampaign, CreateRecipient, MessageSpec,
        RetryConfig,
    };
    use outreach_storage::repository::{
        CampaignRepository, RecipientRepository, Repositories, SenderAccountRepository,
    };
    use outreach_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Accepts every message
    #[derive(Default)]
    struct AcceptingGateway {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl MessagingGateway for AcceptingGateway {
        async fn send(
            &self,
            _to: &str,
            _route_id: &str,
            _message: &OutboundMessage,
        ) -> Result<GatewayReceipt, GatewayError> {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(GatewayReceipt {
                message_id: format!("wamid.{}", n),
            })
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            send_interval: std::time::Duration::ZERO,
            grace_period: chrono::Duration::zero(),
            ..Default::default()
        }
    }

    async fn seed_campaign(store: &MemoryStore) -> Uuid {
        let owner = Uuid::new_v4();
        SenderAccountRepository::create(store, owner, "Main line", "waba-1", "route-1")
            .await
            .unwrap();
        let mut ids = Vec::new();
        for phone in ["15550000001", "15550000002"] {
            let recipient = RecipientRepository::create(
                store,
                CreateRecipient {
                    owner_id: owner,
                    phone: phone.to_string(),
                    opted_in: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            ids.push(recipient.id);
        }

        CampaignRepository::create(
            store,
            CreateCampaign {
                owner_id: owner,
                name: "Welcome".to_string(),
                campaign_type: CampaignType::OneTime,
                status: CampaignStatus::Active,
                message: MessageSpec::Text {
                    body: "Welcome aboard".to_string(),
                },
                audience: AudienceSpec::Recipients { ids },
                schedule: None,
                retry: RetryConfig::default(),
                pricing: None,
                sender_account_id: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn server(store: &MemoryStore, token: Option<&str>, registry: Registry) -> TestServer {
        let metrics = DispatchMetrics::new(&registry).unwrap();
        let dispatcher = Dispatcher::new(
            Repositories::memory(store.clone()),
            Arc::new(AcceptingGateway::default()),
            settings(),
        )
        .with_metrics(metrics);
        let state = AppState::new(Arc::new(dispatcher), registry)
            .with_trigger_token(token.map(str::to_string));

        TestServer::new(create_router(state, &ApiConfig::default())).unwrap()
    }

    #[tokio::test]
    async fn test_health_routes() {
        let server = server(&MemoryStore::new(), Some("secret"), Registry::new());

        let response = server.get("/health").await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["status"], "healthy");

        server.get("/health/live").await.assert_status_ok();
        // No pool configured: ready without a database ping
        server.get("/health/ready").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_run_returns_summary() {
        let store = MemoryStore::new();
        let id = seed_campaign(&store).await;
        let server = server(&store, None, Registry::new());

        let response = server.post("/api/v1/dispatch/run").await;
        response.assert_status_ok();

        let summary: DispatchSummary = response.json();
        assert_eq!(summary.found, 1);
        assert_eq!(summary.processed, 1);
        let outcome = summary.outcome(id).unwrap();
        assert_eq!(outcome.name, "Welcome");
        assert_eq!(outcome.sent, 2);
        assert!(outcome.error.is_none());

        // Second call finds nothing left to do
        let summary: DispatchSummary = server.get("/api/v1/dispatch/run").await.json();
        assert_eq!(summary.found, 0);
    }

    #[tokio::test]
    async fn test_run_requires_configured_token() {
        let store = MemoryStore::new();
        seed_campaign(&store).await;
        let server = server(&store, Some("cron-secret"), Registry::new());

        server
            .post("/api/v1/dispatch/run")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        server
            .post("/api/v1/dispatch/run")
            .add_header(
                header::AUTHORIZATION,
                HeaderValue::from_static("Bearer wrong"),
            )
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/api/v1/dispatch/run")
            .add_header(
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_static("cron-secret"),
            )
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<DispatchSummary>().processed, 1);
    }

    #[tokio::test]
    async fn test_metrics_exposes_dispatch_counters() {
        let store = MemoryStore::new();
        seed_campaign(&store).await;
        let server = server(&store, None, Registry::new());

        server.post("/api/v1/dispatch/run").await.assert_status_ok();

        let response = server.get("/metrics").await;
        response.assert_status_ok();
        let body = response.text();
        assert!(body.contains("outreach_messages_total"));
        assert!(body.contains("outreach_dispatch_runs_total 1"));
    }

    #[tokio::test]
    async fn test_openapi_document_lists_trigger() {
        let server = server(&MemoryStore::new(), None, Registry::new());

        let doc: serde_json::Value = server.get("/openapi.json").await.json();
        assert!(doc["paths"]["/api/v1/dispatch/run"]["post"].is_object());
        server.get("/docs").await.assert_status_ok();
    }
}
