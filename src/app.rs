use crate::auth::AuthState;
use crate::batch::BatchUpdater;
use crate::channels::{ChannelPool, ChannelStore};
use crate::error::{AppError, AppResult};
use crate::health::ChannelHealth;
use crate::ledger::{Ledger, QuotaCache};
use crate::sensitive::SensitiveWords;
use crate::settings::{RelaySettings, SettingsStore};
use crate::users::UserStore;
use arc_swap::ArcSwap;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::Path;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Audio uploads are the largest bodies the relay accepts.
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub user_store: UserStore,
    pub settings_store: SettingsStore,
    pub channel_store: ChannelStore,
    pub channel_pool: Arc<ChannelPool>,
    pub settings: Arc<ArcSwap<RelaySettings>>,
    pub sensitive: Arc<SensitiveWords>,
    pub ledger: Ledger,
    pub batch: Option<Arc<BatchUpdater>>,
    pub health: ChannelHealth,
    /// Work that must finish before shutdown: stream settlement and the
    /// background loops.
    pub tasks: TaskTracker,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    /// How often settings, channels and cached balances are re-read.
    pub sync_frequency: Duration,
    /// `None` disables the periodic channel test.
    pub channel_test_frequency: Option<Duration>,
    pub batch_update_enabled: bool,
    pub batch_update_interval: Duration,
    pub relay_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            metrics_path: "/metrics".to_string(),
            database_dsn: "sqlite://./data/relaygate.db".to_string(),
            sync_frequency: Duration::from_secs(600),
            channel_test_frequency: None,
            batch_update_enabled: false,
            batch_update_interval: Duration::from_secs(5),
            relay_timeout: Duration::from_secs(600),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: env_value("RELAYGATE_LISTEN").unwrap_or(defaults.listen),
            metrics_path: env_value("RELAYGATE_METRICS_PATH").unwrap_or(defaults.metrics_path),
            database_dsn: resolve_database_dsn().unwrap_or(defaults.database_dsn),
            sync_frequency: env_seconds("SYNC_FREQUENCY").unwrap_or(defaults.sync_frequency),
            channel_test_frequency: env_seconds("CHANNEL_TEST_FREQUENCY"),
            batch_update_enabled: env_value("BATCH_UPDATE_ENABLED")
                .map(|v| matches!(v.as_str(), "true" | "1"))
                .unwrap_or(defaults.batch_update_enabled),
            batch_update_interval: env_seconds("BATCH_UPDATE_INTERVAL")
                .unwrap_or(defaults.batch_update_interval),
            relay_timeout: env_seconds("RELAY_TIMEOUT").unwrap_or(defaults.relay_timeout),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whole seconds; zero and unparsable values count as unset.
fn env_seconds(name: &str) -> Option<Duration> {
    env_value(name)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn resolve_database_dsn() -> Option<String> {
    env_value("RELAYGATE_DATABASE_DSN").or_else(|| env_value("DATABASE_URL"))
}

fn init_error(code: &str, err: impl ToString) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, code, err.to_string())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("relaygate/0.1")
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|err| init_error("http_client_init_failed", err))?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| init_error("database_init_failed", err))?;

    // Every connection to an in-memory database is a separate database.
    let in_memory = runtime.database_dsn.contains(":memory:")
        || runtime.database_dsn.contains("mode=memory");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| init_error("database_dsn_parse_failed", err))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| init_error("database_init_failed", err))?;

    let user_store = UserStore::new(pool.clone())
        .await
        .map_err(|err| init_error("user_store_init_failed", err))?;
    let settings_store = SettingsStore::new(pool.clone())
        .await
        .map_err(|err| init_error("settings_store_init_failed", err))?;
    let channel_store = ChannelStore::new(pool)
        .await
        .map_err(|err| init_error("channel_store_init_failed", err))?;

    let metrics = init_metrics()?;
    crate::tokenizer::preload();

    let settings_snapshot = settings_store
        .get_all()
        .await
        .map_err(|err| init_error("settings_store_init_failed", err))?;
    let sensitive = Arc::new(SensitiveWords::new(&settings_snapshot.sensitive_words));
    let settings = Arc::new(ArcSwap::from_pointee(settings_snapshot));

    let channel_pool = Arc::new(ChannelPool::new());
    let enabled = channel_pool
        .refresh(&channel_store)
        .await
        .map_err(|err| init_error("channel_store_init_failed", err))?;
    tracing::info!(channels = enabled, "channel pool loaded");

    let batch = runtime
        .batch_update_enabled
        .then(|| Arc::new(BatchUpdater::new()));
    let ledger = Ledger::new(
        user_store.clone(),
        channel_store.clone(),
        Arc::new(QuotaCache::new()),
        batch.clone(),
    );
    let health = ChannelHealth::new(
        channel_store.clone(),
        channel_pool.clone(),
        settings.clone(),
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth: AuthState::new(),
        http,
        metrics,
        user_store,
        settings_store,
        channel_store,
        channel_pool,
        settings,
        sensitive,
        ledger,
        batch,
        health,
        tasks: TaskTracker::new(),
    })
}

/// Re-reads settings, the channel list and cached balances.
pub async fn sync_state(state: &AppState) {
    match state.settings_store.get_all().await {
        Ok(snapshot) => {
            if state.sensitive.update(&snapshot.sensitive_words) {
                tracing::info!(
                    words = snapshot.sensitive_words.len(),
                    "sensitive word list reloaded"
                );
            }
            state.settings.store(Arc::new(snapshot));
        }
        Err(err) => tracing::error!("failed to sync settings: {err}"),
    }
    match state.channel_pool.refresh(&state.channel_store).await {
        Ok(count) => tracing::debug!(channels = count, "channel pool synced"),
        Err(err) => tracing::error!("failed to sync channels: {err}"),
    }
    if let Err(err) = state.ledger.cache().refresh_all(&state.user_store).await {
        tracing::error!("failed to sync cached quotas: {err}");
    }
}

/// Periodic loops owned by the server. Dropping this does not stop them;
/// call [`BackgroundTasks::shutdown`].
pub struct BackgroundTasks {
    cancel: CancellationToken,
    tasks: TaskTracker,
    batch: Option<Arc<BatchUpdater>>,
    user_store: UserStore,
    channel_store: ChannelStore,
}

impl BackgroundTasks {
    pub fn spawn(state: &AppState) -> Self {
        let cancel = CancellationToken::new();
        let tasks = state.tasks.clone();

        let sync = state.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(sync.runtime.sync_frequency);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => sync_state(&sync).await,
                }
            }
        });

        if let Some(batch) = state.batch.clone() {
            let users = state.user_store.clone();
            let channels = state.channel_store.clone();
            let interval = state.runtime.batch_update_interval;
            let token = cancel.clone();
            tasks.spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            let written = batch.flush(&users, &channels).await;
                            if written > 0 {
                                tracing::debug!(written, "batched usage flushed");
                            }
                        }
                    }
                }
            });
        }

        if let Some(frequency) = state.runtime.channel_test_frequency {
            let health = state.health.clone();
            let http = state.http.clone();
            let token = cancel.clone();
            tasks.spawn(async move {
                let mut tick = tokio::time::interval(frequency);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => match health.test_all(&http).await {
                            Ok(reports) => tracing::info!(tested = reports.len(), "channel test finished"),
                            Err(err) => tracing::error!("channel test failed: {err}"),
                        },
                    }
                }
            });
        }

        Self {
            cancel,
            tasks,
            batch: state.batch.clone(),
            user_store: state.user_store.clone(),
            channel_store: state.channel_store.clone(),
        }
    }

    /// Stops the loops, waits for in-flight settlements and writes out any
    /// buffered usage.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        if let Some(batch) = self.batch {
            let written = batch.flush(&self.user_store, &self.channel_store).await;
            tracing::info!(written, "final usage flush");
        }
    }
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(init_error("metrics_init_failed", err));
            }
        }
    });
    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| init_error("metrics_init_failed", "metrics recorder not available"))
}

/// Creates the database file and its directory for file-backed sqlite DSNs.
fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let Some(rest) = dsn.trim().strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") || rest.contains("mode=memory") {
        return Ok(());
    }
    let path = Path::new(path);
    if path.exists() {
        return Ok(());
    }
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)
            .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?,
        _ => {}
    }
    std::fs::File::create(path)
        .map(|_| ())
        .map_err(|err| format!("sqlite_file_create_failed: {err}"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .merge(build_relay_router())
        .merge(build_unsupported_router())
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/models/{model}",
            get(crate::handlers::retrieve_model).delete(crate::handlers::not_implemented),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::not_found)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_relay_router() -> Router<AppState> {
    let relay = || post(crate::relay::relay);
    Router::new()
        .route("/v1/chat/completions", relay())
        .route("/v1/completions", relay())
        .route("/v1/edits", relay())
        .route("/v1/embeddings", relay())
        .route("/v1/engines/{model}/embeddings", relay())
        .route("/v1/moderations", relay())
        .route("/v1/images/generations", relay())
        .route("/v1/audio/speech", relay())
        .route("/v1/audio/transcriptions", relay())
        .route("/v1/audio/translations", relay())
}

fn build_unsupported_router() -> Router<AppState> {
    let unsupported = || post(crate::handlers::not_implemented);
    Router::new()
        .route("/v1/images/edits", unsupported())
        .route("/v1/images/variations", unsupported())
        .route(
            "/v1/files",
            get(crate::handlers::not_implemented).post(crate::handlers::not_implemented),
        )
        .route(
            "/v1/files/{id}",
            get(crate::handlers::not_implemented).delete(crate::handlers::not_implemented),
        )
        .route("/v1/files/{id}/content", get(crate::handlers::not_implemented))
        .route(
            "/v1/fine-tunes",
            get(crate::handlers::not_implemented).post(crate::handlers::not_implemented),
        )
        .route("/v1/fine-tunes/{id}", get(crate::handlers::not_implemented))
        .route("/v1/fine-tunes/{id}/cancel", unsupported())
        .route("/v1/fine-tunes/{id}/events", get(crate::handlers::not_implemented))
}
