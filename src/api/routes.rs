//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::middleware;
use axum::{
    extract::{Extension, Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::ledger::{FileLedger, InMemoryLedger, LedgerError, SharedLedger};
use crate::redeem::{self, RedemptionCodeStore};
use crate::tasks::{
    start_sweeper, BatchCoordinator, BatchResult, CancelResult, InMemoryTaskStore, TaskEngine,
    TaskStatus, TaskView,
};
use crate::upstream::{HttpUpstreamClient, ProbeReport, SharedUpstream};
use crate::util::mask_identifier;

use super::auth::{self, Credential};
use super::error::ApiError;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Runs verification tasks
    pub engine: Arc<TaskEngine>,
    pub batch: BatchCoordinator,
    /// Credit balances, keyed by API key
    pub ledger: SharedLedger,
    pub codes: Arc<RedemptionCodeStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        ledger: SharedLedger,
        codes: Arc<RedemptionCodeStore>,
        upstream: SharedUpstream,
    ) -> Self {
        let engine = Arc::new(TaskEngine::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::clone(&ledger),
            upstream,
            config.engine.clone(),
        ));
        Self {
            batch: BatchCoordinator::new(Arc::clone(&engine)),
            engine,
            ledger,
            codes,
            config,
        }
    }

    /// Build the production state: file or memory stores, HTTP upstream.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let (ledger, codes): (SharedLedger, RedemptionCodeStore) = match &config.data_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let ledger: SharedLedger =
                    Arc::new(FileLedger::open(dir.join("ledger.json")).await?);
                let codes = RedemptionCodeStore::open(dir.join("redeem_codes.json")).await?;
                tracing::info!(data_dir = %dir.display(), "Using file-backed ledger and codes");
                (ledger, codes)
            }
            None => {
                tracing::warn!("DATA_DIR not set, balances and codes are kept in memory only");
                let ledger: SharedLedger = Arc::new(InMemoryLedger::new());
                (ledger, RedemptionCodeStore::in_memory())
            }
        };
        tracing::info!(persistent = ledger.is_persistent(), "Credit ledger ready");

        let client = HttpUpstreamClient::new(&config.upstream)?;
        tracing::info!(
            base_url = %client.base_url(),
            timeout_ms = config.upstream.timeout.as_millis() as u64,
            "Upstream client ready"
        );
        let upstream: SharedUpstream = Arc::new(client);
        Ok(Self::new(config, ledger, Arc::new(codes), upstream))
    }

    /// Open the configured accounts. Existing balances are left alone.
    pub async fn seed_accounts(&self) -> Result<(), LedgerError> {
        for (key, credits) in &self.config.seed_accounts {
            if self.ledger.open_account(key, *credits).await? {
                tracing::info!(api_key = %mask_identifier(key), credits, "Opened account");
            }
        }
        Ok(())
    }
}

/// Assemble the router with public, user, and admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let user_routes = Router::new()
        .route("/quota", get(get_quota))
        .route("/upstream/status", get(get_upstream_status))
        .route("/redeem", post(redeem_code))
        .route("/verify", post(create_task))
        .route("/verify/status/:task_id", get(get_task_status))
        .route("/verify/batch", post(run_batch))
        .route("/cancel", post(cancel))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    let admin_routes = Router::new()
        .route("/admin/codes", post(mint_codes))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_admin,
        ));

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::from_config(config).await?);
    state.seed_accounts().await?;

    let shutdown = CancellationToken::new();
    let sweeper = start_sweeper(Arc::clone(&state.engine), shutdown.clone());

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Sweeper task ended abnormally: {}", e);
    }
    Ok(())
}

/// Wait for a shutdown signal, then stop the background workers.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, stopping background workers");
    shutdown.cancel();
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tasks: state.engine.active_tasks().await,
    })
}

async fn get_quota(
    State(state): State<Arc<AppState>>,
    Extension(Credential(key)): Extension<Credential>,
) -> Result<Json<QuotaResponse>, ApiError> {
    let credits = state.ledger.get_balance(&key).await?;
    Ok(Json(QuotaResponse {
        api_key: mask_identifier(&key),
        credits,
    }))
}

async fn get_upstream_status(State(state): State<Arc<AppState>>) -> Json<ProbeReport> {
    Json(state.engine.upstream().probe().await)
}

async fn redeem_code(
    State(state): State<Arc<AppState>>,
    Extension(Credential(key)): Extension<Credential>,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Result<Json<RedeemResponse>, ApiError> {
    let Json(req) = payload?;
    let redemption = redeem::redeem(&state.codes, state.ledger.as_ref(), &key, &req.code).await?;
    Ok(Json(RedeemResponse {
        message: format!("Added {} credits", redemption.credits_added),
        code: redemption.code,
        credits_added: redemption.credits_added,
        credits_total: redemption.credits_total,
        api_key: mask_identifier(&key),
    }))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(Credential(key)): Extension<Credential>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let Json(req) = payload?;
    let task = state.engine.create_task(&key, &req.verification_id).await?;
    Ok(Json(CreateTaskResponse {
        task_id: task.id,
        status: TaskStatus::Pending,
        message: "Verification task created".to_string(),
    }))
}

async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Extension(Credential(key)): Extension<Credential>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let id = Uuid::parse_str(&task_id)
        .map_err(|_| ApiError::not_found(format!("task {} not found", task_id)))?;
    Ok(Json(state.engine.get_status(&key, id).await?))
}

async fn run_batch(
    State(state): State<Arc<AppState>>,
    Extension(Credential(key)): Extension<Credential>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResult>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.batch.run_batch(&key, &req.verification_ids).await?))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(Credential(key)): Extension<Credential>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<CancelResult>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.engine.cancel(&key, &req.verification_id).await?))
}

async fn mint_codes(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MintCodesRequest>, JsonRejection>,
) -> Result<Json<MintCodesResponse>, ApiError> {
    let Json(req) = payload?;
    let minted = state.codes.mint(req.count, req.credits).await?;
    Ok(Json(MintCodesResponse {
        credits: req.credits,
        codes: minted.into_iter().map(|c| c.code).collect(),
    }))
}
