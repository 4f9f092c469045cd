use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use subseq_cases::api::{CaseApp, routes};
use subseq_cases::config::Config;
use subseq_cases::db::{PgCaseStore, create_case_tables};
use subseq_cases::events::{Broadcaster, StreamSettings};
use subseq_cases::identity::{SessionStrategy, SessionStrategyKind};
use subseq_cases::operations::CaseOperations;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct DemoApp {
    operations: CaseOperations<PgCaseStore>,
    sessions: SessionStrategy<PgCaseStore>,
    stream: StreamSettings,
}

impl CaseApp for DemoApp {
    type Store = PgCaseStore;

    fn operations(&self) -> &CaseOperations<PgCaseStore> {
        &self.operations
    }

    fn sessions(&self) -> &SessionStrategy<PgCaseStore> {
        &self.sessions
    }

    fn stream_settings(&self) -> StreamSettings {
        self.stream
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("subseq_cases=info,info")),
        )
        .init();

    let config = Config::from_env().context("invalid server configuration")?;
    let database_url = config
        .require_database_url()
        .context("DATABASE_URL is required to run demos/case_sync_server.rs")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    create_case_tables(&pool)
        .await
        .context("failed to run case migrations")?;

    let store = Arc::new(PgCaseStore::new(pool));
    let broadcaster = Arc::new(Broadcaster::new());
    let heartbeat = broadcaster.spawn_heartbeat(config.heartbeat_interval);

    let app_state = DemoApp {
        operations: CaseOperations::new(Arc::clone(&store), Arc::clone(&broadcaster)),
        sessions: SessionStrategy::from_kind(config.session_strategy, store),
        stream: config.stream_settings(),
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .merge(routes::<DemoApp>());
    let app = Router::new().nest("/api/v1", api_v1).with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.bind))?;

    println!("subseq_cases demo server listening on http://{}", config.bind);
    println!("api base path: /api/v1");
    match config.session_strategy {
        SessionStrategyKind::TrustedHeader => {
            println!("identity: x-user-id header is trusted as-is")
        }
        SessionStrategyKind::SessionToken => {
            println!("identity: Authorization: Bearer <token> checked against cases.sessions")
        }
    }

    let shutdown_broadcaster = Arc::clone(&broadcaster);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down, closing push streams");
            shutdown_broadcaster.shutdown();
        })
        .await
        .context("demo server failed");

    heartbeat.abort();
    served
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
