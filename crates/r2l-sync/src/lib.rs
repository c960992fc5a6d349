//! Sync orchestration: fetch, extract, dedup, batch, submit, persist, notify.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2l_adapters::{
    build_adapters, AdapterError, AdapterSettings, DiscordWebhook, LastFmClient, NoopNotifier, Notifier,
    ScrobbleError, ScrobbleSession, ScrobbleSink, SnapshotSource, DEFAULT_KAMAI_BASE_URL, LASTFM_API_URL,
};
use r2l_core::{
    advance_cursor, batch_with_capacity, dedup, extract, partial_cursor, retain_recent, SourceKey,
    MAX_BATCH_SIZE,
};
use r2l_storage::{
    read_json_or_default, write_json_atomic, CursorStore, HttpClient, HttpClientConfig, JsonFileCursorStore,
    RetryDisposition, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "r2l-sync";

/// Session shared between the web surface and the scheduler. Each cycle
/// reads a clone; the auth handshake swaps in a new value.
pub type SharedSession = Arc<RwLock<ScrobbleSession>>;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub game: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cursor_path: PathBuf,
    pub session_path: PathBuf,
    pub lastfm_api_key: String,
    pub lastfm_shared_secret: String,
    pub lastfm_session_key: Option<String>,
    pub lastfm_api_url: String,
    pub public_url: String,
    pub webhook_url: Option<String>,
    pub adapters: AdapterSettings,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// `None` disables the recency window.
    pub max_age_days: Option<i64>,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            cursor_path: std::env::var("R2L_CURSOR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./gameDataSave.json")),
            session_path: std::env::var("R2L_SESSION_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./session.json")),
            lastfm_api_key: std::env::var("LASTFM_API_KEY").unwrap_or_default(),
            lastfm_shared_secret: std::env::var("LASTFM_SHARED_SECRET").unwrap_or_default(),
            lastfm_session_key: non_empty_var("LASTFM_SESSION_KEY"),
            lastfm_api_url: std::env::var("LASTFM_API_URL").unwrap_or_else(|_| LASTFM_API_URL.to_string()),
            public_url: std::env::var("R2L_PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),
            webhook_url: non_empty_var("R2L_WEBHOOK_URL"),
            adapters: AdapterSettings {
                kamai_base_url: std::env::var("KAMAI_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_KAMAI_BASE_URL.to_string()),
                mithical_base_url: non_empty_var("MITHICAL_BASE_URL"),
                mithical_access_code: non_empty_var("MITHICAL_ACCESS_CODE"),
                wacca_songs_path: std::env::var("WACCA_SONGS_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./waccaSongs.json")),
            },
            user_agent: std::env::var("R2L_USER_AGENT").unwrap_or_else(|_| "r2l-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("R2L_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_age_days: std::env::var("R2L_MAX_AGE_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .map_or(Some(14), |days| (days > 0).then_some(days)),
            web_port: std::env::var("R2L_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            scheduler_enabled: std::env::var("R2L_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn http_client(&self) -> Result<HttpClient> {
        HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
        .context("building HTTP client")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn callback_url(&self) -> String {
        format!("{}/lfm/callback", self.public_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredSession {
    #[serde(default)]
    session_key: Option<String>,
}

/// Credentials from the config, with the session file's key taking
/// precedence over `LASTFM_SESSION_KEY`.
pub async fn load_session(config: &SyncConfig) -> Result<ScrobbleSession> {
    let session = ScrobbleSession::new(&config.lastfm_api_key, &config.lastfm_shared_secret);
    let stored: StoredSession = read_json_or_default(&config.session_path)
        .await
        .with_context(|| format!("loading session from {}", config.session_path.display()))?;
    let key = stored
        .session_key
        .filter(|k| !k.is_empty())
        .or_else(|| config.lastfm_session_key.clone());
    Ok(match key {
        Some(key) => session.with_session_key(key),
        None => session,
    })
}

pub async fn save_session(path: &Path, session: &ScrobbleSession) -> Result<()> {
    let stored = StoredSession {
        session_key: session.session_key.clone(),
    };
    write_json_atomic(path, &stored)
        .await
        .with_context(|| format!("saving session to {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Fetching,
    Extracting,
    Deduplicating,
    Submitting,
    Persisting,
    Notifying,
    Done,
}

impl SyncStage {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStage::Fetching => "fetching",
            SyncStage::Extracting => "extracting",
            SyncStage::Deduplicating => "deduplicating",
            SyncStage::Submitting => "submitting",
            SyncStage::Persisting => "persisting",
            SyncStage::Notifying => "notifying",
            SyncStage::Done => "done",
        }
    }
}

/// Records the batch in flight when a submission is rejected, plus what had
/// already been accepted before it.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionProgress {
    /// 1-based.
    pub batch_number: usize,
    pub batch_count: usize,
    pub reported: usize,
    pub responses: Vec<JsonValue>,
    pub cursor: Option<i64>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),
    #[error("fetching snapshot for {key}: {source}")]
    Fetch {
        key: SourceKey,
        #[source]
        source: AdapterError,
    },
    #[error("loading cursor for {key}: {source}")]
    CursorLoad {
        key: SourceKey,
        #[source]
        source: StoreError,
    },
    #[error("submitting batch {} of {} for {key}: {source}", .progress.batch_number, .progress.batch_count)]
    Submission {
        key: SourceKey,
        progress: SubmissionProgress,
        #[source]
        source: ScrobbleError,
    },
    #[error("persisting cursor {cursor} for {key} after reporting {reported} record(s): {source}")]
    Persistence {
        key: SourceKey,
        cursor: i64,
        reported: usize,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::UnknownSource(_) | SyncError::Fetch { .. } => SyncStage::Fetching,
            SyncError::CursorLoad { .. } => SyncStage::Deduplicating,
            SyncError::Submission { .. } => SyncStage::Submitting,
            SyncError::Persistence { .. } => SyncStage::Persisting,
        }
    }

    pub fn batch(&self) -> Option<usize> {
        match self {
            SyncError::Submission { progress, .. } => Some(progress.batch_number),
            _ => None,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SyncError::Fetch { source, .. } => source.disposition(),
            SyncError::Submission { source, .. } => source.disposition(),
            SyncError::CursorLoad { .. } | SyncError::Persistence { .. } => RetryDisposition::Retryable,
            SyncError::UnknownSource(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub message: String,
    pub reported: usize,
    pub batches: usize,
    pub responses: Vec<JsonValue>,
    pub previous_cursor: Option<i64>,
    pub cursor: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    /// Plays older than this are never submitted. `None` keeps everything.
    pub max_age: Option<chrono::Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            max_age: None,
        }
    }
}

pub type AdapterMap = BTreeMap<&'static str, Arc<dyn SnapshotSource>>;

pub struct SyncPipeline {
    adapters: AdapterMap,
    store: Arc<dyn CursorStore>,
    sink: Arc<dyn ScrobbleSink>,
    notifier: Arc<dyn Notifier>,
    options: SyncOptions,
    source_locks: Mutex<HashMap<SourceKey, Arc<Mutex<()>>>>,
}

impl SyncPipeline {
    pub fn new(
        adapters: AdapterMap,
        store: Arc<dyn CursorStore>,
        sink: Arc<dyn ScrobbleSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            adapters,
            store,
            sink,
            notifier,
            options: SyncOptions::default(),
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = config.http_client()?;
        let adapters = build_adapters(&config.adapters, &http)?;
        let store = Arc::new(JsonFileCursorStore::new(config.cursor_path.clone()));
        let sink = Arc::new(LastFmClient::new(http.clone(), config.lastfm_api_url.clone()));
        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => Arc::new(DiscordWebhook::new(http, url.clone())),
            None => Arc::new(NoopNotifier),
        };
        Ok(Self::new(adapters, store, sink, notifier).with_options(SyncOptions {
            batch_size: MAX_BATCH_SIZE,
            max_age: config.max_age_days.map(chrono::Duration::days),
        }))
    }

    /// Registers `adapter` under its source id, replacing any existing one.
    pub fn with_adapter(mut self, adapter: Arc<dyn SnapshotSource>) -> Self {
        self.adapters.insert(adapter.source_id(), adapter);
        self
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.adapters.keys().copied()
    }

    async fn source_lock(&self, key: &SourceKey) -> Arc<Mutex<()>> {
        let mut locks = self.source_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drops the entry for `key` once no other cycle holds or awaits it.
    async fn release_source_lock(&self, key: &SourceKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.source_locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn source_lock_count(&self) -> usize {
        self.source_locks.lock().await.len()
    }

    /// One full cycle for `(source_id, game)`. Cycles for the same source are
    /// serialized; different sources run independently.
    pub async fn run_once(
        &self,
        session: &ScrobbleSession,
        source_id: &str,
        game: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let adapter = self
            .adapters
            .get(source_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownSource(source_id.to_string()))?;
        let key = SourceKey::new(adapter.source_id(), game);
        if !adapter.supports_game(game) {
            return Err(SyncError::Fetch {
                key,
                source: AdapterError::UnsupportedGame {
                    source_id: adapter.source_id(),
                    game: game.to_string(),
                },
            });
        }
        let run_id = Uuid::new_v4();

        let lock = self.source_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            let span = info_span!("sync", source = %key, %run_id);
            self.run_locked(adapter.as_ref(), session, key.clone(), run_id)
                .instrument(span)
                .await
        };
        self.release_source_lock(&key, lock).await;
        result
    }

    async fn run_locked(
        &self,
        adapter: &dyn SnapshotSource,
        session: &ScrobbleSession,
        key: SourceKey,
        run_id: Uuid,
    ) -> Result<SyncOutcome, SyncError> {
        let started_at = Utc::now();

        debug!(stage = SyncStage::Fetching.as_str(), "stage");
        let snapshot = match adapter.fetch_snapshot(&key.game).await {
            Ok(snapshot) => snapshot,
            Err(source) => return Err(SyncError::Fetch { key, source }),
        };

        debug!(stage = SyncStage::Extracting.as_str(), scores = snapshot.scores.len(), "stage");
        let observed_newest = snapshot.newest_timestamp();
        let mut records = extract(&snapshot);
        if let Some(max_age) = self.options.max_age {
            let before = records.len();
            records = retain_recent(records, started_at.timestamp(), max_age.num_seconds());
            if records.len() < before {
                debug!(dropped = before - records.len(), "dropped records outside the recency window");
            }
        }

        debug!(stage = SyncStage::Deduplicating.as_str(), "stage");
        let previous = match self.store.get(&key).await {
            Ok(previous) => previous,
            Err(source) => return Err(SyncError::CursorLoad { key, source }),
        };
        let expected_kind = adapter.cursor_kind();
        let stored_kind = previous.as_ref().map(|c| c.kind());
        let migrate = stored_kind.is_some_and(|kind| kind != expected_kind);
        if migrate {
            info!(stored = ?stored_kind, expected = ?expected_kind, "stored cursor will be rewritten as a timestamp");
        }
        let previous_ts = previous.as_ref().and_then(|c| c.last_timestamp());
        let fresh = dedup(previous.as_ref(), records);
        let batches = batch_with_capacity(fresh, self.options.batch_size);
        let batch_count = batches.len();

        let mut responses = Vec::with_capacity(batch_count);
        let mut reported = 0usize;
        for (index, batch) in batches.iter().enumerate() {
            debug!(stage = SyncStage::Submitting.as_str(), batch = index + 1, batch_count, size = batch.len(), "stage");
            match self.sink.submit(session, batch).await {
                Ok(response) => {
                    reported += batch.len();
                    responses.push(response);
                }
                Err(source) => {
                    let cursor = partial_cursor(previous_ts, &batches, index);
                    if let Some(ts) = cursor.filter(|ts| migrate || Some(*ts) != previous_ts) {
                        if let Err(err) = self.store.set(&key, ts).await {
                            warn!(error = %err, cursor = ts, "could not record partial progress");
                        }
                    }
                    warn!(batch = index + 1, batch_count, reported, error = %source, "submission rejected");
                    return Err(SyncError::Submission {
                        key,
                        progress: SubmissionProgress {
                            batch_number: index + 1,
                            batch_count,
                            reported,
                            responses,
                            cursor,
                        },
                        source,
                    });
                }
            }
        }

        debug!(stage = SyncStage::Persisting.as_str(), "stage");
        let cursor = advance_cursor(previous_ts, observed_newest);
        if let Some(ts) = cursor.filter(|ts| migrate || Some(*ts) != previous_ts) {
            if let Err(source) = self.store.set(&key, ts).await {
                return Err(SyncError::Persistence {
                    key,
                    cursor: ts,
                    reported,
                    source,
                });
            }
        }

        debug!(stage = SyncStage::Notifying.as_str(), "stage");
        let message = if reported == 0 {
            format!("No new tracks to scrobble for game {}.", key.game)
        } else {
            format!(
                "Scrobbled {reported} track(s) in {batch_count} request(s) for game {}.",
                key.game
            )
        };
        if let Err(err) = self.notifier.notify(&message).await {
            warn!(error = %err, "webhook notification failed");
        }

        info!(stage = SyncStage::Done.as_str(), reported, batches = batch_count, cursor, "{message}");
        Ok(SyncOutcome {
            run_id,
            source: key.to_string(),
            started_at,
            finished_at: Utc::now(),
            message,
            reported,
            batches: batch_count,
            responses,
            previous_cursor: previous_ts,
            cursor,
        })
    }

    /// Runs every enabled registry entry in order. One source failing does
    /// not stop the others.
    pub async fn run_registry(
        &self,
        session: &ScrobbleSession,
        registry: &SourceRegistry,
    ) -> Vec<(SourceConfig, Result<SyncOutcome, SyncError>)> {
        let mut results = Vec::new();
        for source in registry.enabled() {
            let result = self.run_once(session, &source.source_id, &source.game).await;
            if let Err(err) = &result {
                warn!(source_id = %source.source_id, game = %source.game, stage = err.stage().as_str(), error = %err, "sync failed");
            }
            results.push((source.clone(), result));
        }
        results
    }
}

/// Builds the cron scheduler when enabled. Each tick runs the registry once
/// with whatever session is current at that moment.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
    session: SharedSession,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let registry = Arc::new(SourceRegistry::load(&config.registry_path()).await?);
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let session = session.clone();
        let registry = registry.clone();
        Box::pin(async move {
            let current = session.read().await.clone();
            let results = pipeline.run_registry(&current, &registry).await;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            info!(sources = results.len(), failed, "scheduled sync finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Runs the cron job in the foreground until ctrl-c, regardless of
/// `R2L_SCHEDULER_ENABLED`.
pub async fn run_scheduler_from_env() -> Result<()> {
    let mut config = SyncConfig::from_env();
    config.scheduler_enabled = true;
    let session: SharedSession = Arc::new(RwLock::new(load_session(&config).await?));
    let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
    let Some(mut sched) = maybe_build_scheduler(&config, pipeline, session).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// One pass over `sources.yaml` using the environment's configuration.
pub async fn run_sync_once_from_env() -> Result<Vec<(SourceConfig, Result<SyncOutcome, SyncError>)>> {
    let config = SyncConfig::from_env();
    let session = load_session(&config).await?;
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let pipeline = SyncPipeline::from_config(&config)?;
    Ok(pipeline.run_registry(&session, &registry).await)
}
