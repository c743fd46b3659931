//! Shared server state, router wiring and the serve loop.

use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use bonk_orchestrator::{CodingAgent, Orchestrator, RepositoryHostFactory, SubprocessAgent};
use bonk_tracker::{TrackerClientFactory, TrackerRegistry};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::api_error::ApiError;
use crate::ask_handler::handle_ask;
use crate::config::ServerConfig;
use crate::delivery_cache::DeliveryCache;
use crate::runs_handler::{handle_finalize_run, handle_register_run};
use crate::webhook_handler::handle_github_webhook;

pub const WEBHOOKS_ENDPOINT: &str = "/webhooks";
pub const ASK_ENDPOINT: &str = "/ask";
pub const RUNS_REGISTER_ENDPOINT: &str = "/runs/register";
pub const RUNS_FINALIZE_ENDPOINT: &str = "/runs/finalize";
pub const HEALTH_ENDPOINT: &str = "/health";

pub struct BonkServerState {
    pub config: ServerConfig,
    pub registry: Arc<TrackerRegistry>,
    /// `None` when no agent is configured; only workflow mode runs then.
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub hosts: Arc<dyn RepositoryHostFactory>,
    deliveries: Mutex<DeliveryCache>,
    requests: Mutex<JoinSet<()>>,
}

impl BonkServerState {
    pub fn new(
        config: ServerConfig,
        registry: Arc<TrackerRegistry>,
        orchestrator: Option<Arc<Orchestrator>>,
        hosts: Arc<dyn RepositoryHostFactory>,
    ) -> Self {
        let deliveries = Mutex::new(DeliveryCache::new(config.delivery_cache_cap));
        Self {
            config,
            registry,
            orchestrator,
            hosts,
            deliveries,
            requests: Mutex::new(JoinSet::new()),
        }
    }

    /// Wires the GitHub client factory and, when configured, the subprocess
    /// agent from config.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let orchestrator = match config.agent.clone() {
            Some(agent_config) => {
                let agent: Arc<dyn CodingAgent> = Arc::new(
                    SubprocessAgent::new(agent_config).context("invalid agent configuration")?,
                );
                Some(Arc::new(Orchestrator::new(config.orchestrator, agent)))
            }
            None => None,
        };
        let github = Arc::new(config.github.clone());
        let clients: Arc<dyn TrackerClientFactory> = github.clone();
        let hosts: Arc<dyn RepositoryHostFactory> = github;
        let registry = Arc::new(TrackerRegistry::new(config.tracker.clone(), clients));
        Ok(Self::new(config, registry, orchestrator, hosts))
    }

    /// Records a webhook delivery id; false when it was already seen.
    pub fn note_delivery(&self, delivery_id: &str) -> bool {
        lock_or_recover(&self.deliveries).insert(delivery_id)
    }

    /// Runs an accepted request in the background, tracked so shutdown can
    /// wait for it.
    pub fn spawn_request<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut requests = lock_or_recover(&self.requests);
        while let Some(finished) = requests.try_join_next() {
            log_request_exit(finished);
        }
        requests.spawn(task);
    }

    pub fn in_flight_requests(&self) -> usize {
        lock_or_recover(&self.requests).len()
    }

    /// Waits up to `grace` for in-flight requests. Stragglers are then
    /// interrupted so they finalize their placeholder with a failure notice,
    /// and aborted if they still do not finish within another `grace`.
    pub async fn drain_requests(&self, grace: Duration) -> usize {
        let mut requests = std::mem::take(&mut *lock_or_recover(&self.requests));
        let pending = requests.len();
        if pending == 0 {
            return 0;
        }
        tracing::info!(pending, grace_ms = grace.as_millis() as u64, "waiting for in-flight requests");
        if join_all_within(&mut requests, grace).await {
            return pending;
        }
        if let Some(orchestrator) = self.orchestrator.as_ref() {
            orchestrator.interrupt();
        }
        tracing::warn!(remaining = requests.len(), "interrupting in-flight requests");
        if !join_all_within(&mut requests, grace).await {
            tracing::warn!(remaining = requests.len(), "aborting in-flight requests");
            requests.abort_all();
            while let Some(finished) = requests.join_next().await {
                log_request_exit(finished);
            }
        }
        pending
    }
}

async fn join_all_within(requests: &mut JoinSet<()>, grace: Duration) -> bool {
    tokio::time::timeout(grace, async {
        while let Some(finished) = requests.join_next().await {
            log_request_exit(finished);
        }
    })
    .await
    .is_ok()
}

fn log_request_exit(finished: Result<(), tokio::task::JoinError>) {
    if let Err(error) = finished {
        if !error.is_cancelled() {
            tracing::warn!(error = %error, "request task ended abnormally");
        }
    }
}

pub fn build_router(state: Arc<BonkServerState>) -> Router {
    Router::new()
        .route(WEBHOOKS_ENDPOINT, post(handle_github_webhook))
        .route(ASK_ENDPOINT, post(handle_ask))
        .route(RUNS_REGISTER_ENDPOINT, post(handle_register_run))
        .route(RUNS_FINALIZE_ENDPOINT, post(handle_finalize_run))
        .route(HEALTH_ENDPOINT, get(handle_health))
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<BonkServerState>>) -> Json<Value> {
    let snapshot = state.registry.trigger_snapshot();
    Json(json!({
        "status": "ok",
        "mode": state.config.mode.as_str(),
        "agent": state.orchestrator.is_some(),
        "repositories": snapshot.repositories,
        "pending_triggers": snapshot.pending_triggers,
        "busy_repositories": snapshot.busy_repositories,
        "in_flight_requests": state.in_flight_requests(),
    }))
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let bind = config.bind;
    let tick = Duration::from_millis(config.driver_tick_ms.max(1));
    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let state = Arc::new(BonkServerState::from_config(config)?);
    let recovered = state
        .registry
        .recover()
        .context("failed to recover tracker state")?;

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind bonk server on {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound server address")?;
    tracing::info!(
        addr = %local_addr,
        mode = state.config.mode.as_str(),
        recovered,
        "bonk server listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        signal_tx.send_replace(true);
    });

    let registry = Arc::clone(&state.registry);
    let driver_shutdown = shutdown_requested(shutdown_rx.clone());
    let driver = tokio::spawn(async move {
        registry.run_driver(tick, driver_shutdown).await;
    });

    // Open /ask streams keep the server alive until their request settles,
    // so draining starts with the signal rather than after serve returns.
    let drain_state = Arc::clone(&state);
    let drain_shutdown = shutdown_requested(shutdown_rx.clone());
    let drain = async move {
        drain_shutdown.await;
        drain_state.drain_requests(grace).await
    };
    let app = build_router(Arc::clone(&state));
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_requested(shutdown_rx))
        .into_future();
    let serve = async move {
        let result = serve.await;
        shutdown_tx.send_replace(true);
        result
    };
    let (serve_result, drained) = tokio::join!(serve, drain);
    if drained > 0 {
        tracing::info!(drained, "in-flight requests settled");
    }
    if let Err(error) = driver.await {
        tracing::warn!(error = %error, "tracker driver task ended abnormally");
    }
    serve_result.context("bonk server exited unexpectedly")?;
    tracing::info!("bonk server stopped");
    Ok(())
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

pub(crate) fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice::<T>(body).map_err(|error| {
        ApiError::bad_request(
            "malformed_json",
            format!("failed to parse request body: {error}"),
        )
    })
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
