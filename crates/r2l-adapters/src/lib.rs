//! Source adapters (score trackers) and sink adapters (Last.fm, chat webhook).

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use md5::{Digest, Md5};
use r2l_core::{CursorKind, RawScore, RawSnapshot, RawSong, SubmissionBatch};
use r2l_storage::{FetchError, FetchedResponse, HttpClient, RetryDisposition};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "r2l-adapters";

pub const KAMAI_SOURCE_ID: &str = "kamai";
pub const MITHICAL_SOURCE_ID: &str = "mithical";

pub const DEFAULT_KAMAI_BASE_URL: &str = "https://kamai.tachi.ac/api/v1/users/me/games/";
pub const LASTFM_API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
pub const LASTFM_AUTH_URL: &str = "https://www.last.fm/api/auth/";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("game {game:?} is not supported by {source_id}")]
    UnsupportedGame { source_id: &'static str, game: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            AdapterError::Fetch(err) => err.disposition(),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// A score tracker that can produce a snapshot of recent plays for one game.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Form this source's cursor is kept in. A stored cursor of any other
    /// form is rewritten on the next successful cycle.
    fn cursor_kind(&self) -> CursorKind {
        CursorKind::Timestamp
    }

    /// Cheap check run before a cycle takes any per-source state.
    fn supports_game(&self, game: &str) -> bool {
        is_path_segment(game)
    }

    async fn fetch_snapshot(&self, game: &str) -> Result<RawSnapshot, AdapterError>;
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn is_path_segment(game: &str) -> bool {
    !game.is_empty()
        && game
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Serves a snapshot stored on disk, for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureSnapshotSource {
    source_id: &'static str,
    path: PathBuf,
}

impl FixtureSnapshotSource {
    pub fn new(source_id: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for FixtureSnapshotSource {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch_snapshot(&self, _game: &str) -> Result<RawSnapshot, AdapterError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let snapshot: RawSnapshot =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(snapshot)
    }
}

#[derive(Debug, Deserialize)]
struct TachiEnvelope {
    success: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    body: Option<RawSnapshot>,
}

const KAMAI_PLAYTYPE: &str = "Single";

/// Kamaitachi (Tachi) `GET {base}{game}/Single/scores/recent`.
#[derive(Debug, Clone)]
pub struct KamaiAdapter {
    http: HttpClient,
    base_url: String,
}

impl KamaiAdapter {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn recent_scores_url(&self, game: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/{game}/{KAMAI_PLAYTYPE}/scores/recent")
    }
}

#[async_trait]
impl SnapshotSource for KamaiAdapter {
    fn source_id(&self) -> &'static str {
        KAMAI_SOURCE_ID
    }

    async fn fetch_snapshot(&self, game: &str) -> Result<RawSnapshot, AdapterError> {
        if !is_path_segment(game) {
            return Err(AdapterError::UnsupportedGame {
                source_id: KAMAI_SOURCE_ID,
                game: game.to_string(),
            });
        }
        let url = self.recent_scores_url(game);
        let resp = self.http.get(&url, &[]).await?;
        let envelope: TachiEnvelope = resp.json()?;
        if !envelope.success {
            return Err(AdapterError::Message(format!(
                "kamai rejected request for {game}: {}",
                envelope.description.unwrap_or_default()
            )));
        }
        let snapshot = envelope.body.unwrap_or_default();
        debug!(
            game,
            scores = snapshot.scores.len(),
            songs = snapshot.songs.len(),
            "fetched kamai snapshot"
        );
        Ok(snapshot)
    }
}

/// Entry of the local WACCA song catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaccaSong {
    pub id: i64,
    pub title: String,
    #[serde(rename = "titleEnglish", default)]
    pub title_english: Option<String>,
    pub artist: String,
}

impl WaccaSong {
    /// English title when the catalog has a non-empty one.
    pub fn display_title(&self) -> &str {
        match self.title_english.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => &self.title,
        }
    }
}

pub fn load_wacca_catalog(path: impl AsRef<Path>) -> Result<Vec<WaccaSong>> {
    read_json_file(path)
}

#[derive(Debug, Deserialize)]
struct MithicalAccount {
    #[serde(default)]
    playlog: Vec<PlaylogEntry>,
}

#[derive(Debug, Deserialize)]
struct PlaylogEntry {
    info: PlayInfo,
}

#[derive(Debug, Deserialize)]
struct PlayInfo {
    music_id: i64,
    user_play_date: String,
}

/// Play dates arrive as RFC 3339 or as naive `YYYY-MM-DD[T ]HH:MM:SS`, read as UTC.
pub fn parse_play_date_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Join a Mithical playlog against the WACCA catalog into the common snapshot shape.
fn playlog_to_snapshot(account: MithicalAccount, catalog: &[WaccaSong]) -> RawSnapshot {
    let scores: Vec<RawScore> = account
        .playlog
        .into_iter()
        .map(|entry| {
            let time_achieved = parse_play_date_ms(&entry.info.user_play_date);
            if time_achieved.is_none() {
                debug!(
                    music_id = entry.info.music_id,
                    date = %entry.info.user_play_date,
                    "unparseable play date"
                );
            }
            RawScore {
                song_id: entry.info.music_id,
                time_achieved,
            }
        })
        .collect();
    let played: HashSet<i64> = scores.iter().map(|s| s.song_id).collect();
    let songs = catalog
        .iter()
        .filter(|song| played.contains(&song.id))
        .map(|song| RawSong {
            id: song.id,
            title: song.display_title().to_string(),
            artist: song.artist.clone(),
        })
        .collect();
    RawSnapshot { scores, songs }
}

/// Mithical WACCA server `GET {base}{access_code}/{limit}`.
#[derive(Debug, Clone)]
pub struct MithicalAdapter {
    http: HttpClient,
    base_url: String,
    access_code: String,
    limit: u32,
    catalog: Arc<Vec<WaccaSong>>,
}

impl MithicalAdapter {
    pub const GAME: &'static str = "wacca";

    pub fn new(
        http: HttpClient,
        base_url: impl Into<String>,
        access_code: impl Into<String>,
        catalog: Vec<WaccaSong>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            access_code: access_code.into(),
            limit: 400,
            catalog: Arc::new(catalog),
        }
    }

    fn playlog_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/{}/{}", self.access_code, self.limit)
    }
}

#[async_trait]
impl SnapshotSource for MithicalAdapter {
    fn source_id(&self) -> &'static str {
        MITHICAL_SOURCE_ID
    }

    fn supports_game(&self, game: &str) -> bool {
        game == Self::GAME
    }

    async fn fetch_snapshot(&self, game: &str) -> Result<RawSnapshot, AdapterError> {
        if game != Self::GAME {
            return Err(AdapterError::UnsupportedGame {
                source_id: MITHICAL_SOURCE_ID,
                game: game.to_string(),
            });
        }
        let resp = self.http.get(&self.playlog_url(), &[]).await?;
        let account: MithicalAccount = resp.json()?;
        Ok(playlog_to_snapshot(account, &self.catalog))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub kamai_base_url: String,
    pub mithical_base_url: Option<String>,
    pub mithical_access_code: Option<String>,
    pub wacca_songs_path: PathBuf,
}

/// Every source adapter the settings enable, keyed by source id.
pub fn build_adapters(
    settings: &AdapterSettings,
    http: &HttpClient,
) -> Result<BTreeMap<&'static str, Arc<dyn SnapshotSource>>> {
    let mut adapters: BTreeMap<&'static str, Arc<dyn SnapshotSource>> = BTreeMap::new();
    adapters.insert(
        KAMAI_SOURCE_ID,
        Arc::new(KamaiAdapter::new(http.clone(), settings.kamai_base_url.clone())),
    );

    if let (Some(base_url), Some(access_code)) =
        (&settings.mithical_base_url, &settings.mithical_access_code)
    {
        let catalog = load_wacca_catalog(&settings.wacca_songs_path)
            .context("loading WACCA song catalog for the mithical adapter")?;
        info!(songs = catalog.len(), "loaded WACCA catalog");
        adapters.insert(
            MITHICAL_SOURCE_ID,
            Arc::new(MithicalAdapter::new(
                http.clone(),
                base_url.clone(),
                access_code.clone(),
                catalog,
            )),
        );
    }
    Ok(adapters)
}

/// Last.fm application credentials plus the user session they were granted.
///
/// Passed by value into each sync; the auth handshake returns an updated copy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrobbleSession {
    pub api_key: String,
    pub shared_secret: String,
    #[serde(default)]
    pub session_key: Option<String>,
}

impl ScrobbleSession {
    pub fn new(api_key: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            shared_secret: shared_secret.into(),
            session_key: None,
        }
    }

    pub fn with_session_key(&self, session_key: impl Into<String>) -> Self {
        Self {
            session_key: Some(session_key.into()),
            ..self.clone()
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.session_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// `md5(k1 v1 k2 v2 ... secret)` over keys in byte order, as Last.fm expects.
pub fn sign_params(params: &BTreeMap<String, String>, shared_secret: &str) -> String {
    let mut hasher = Md5::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    hasher.update(shared_secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn auth_url(api_key: &str, callback: &str) -> Result<String> {
    let url = reqwest::Url::parse_with_params(LASTFM_AUTH_URL, &[("api_key", api_key), ("cb", callback)])
        .context("building Last.fm auth URL")?;
    Ok(url.to_string())
}

#[derive(Debug, Error)]
pub enum ScrobbleError {
    #[error("no Last.fm session key configured; authenticate via /lfm/login")]
    MissingSessionKey,
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("Last.fm error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("unexpected Last.fm response: {0}")]
    Unexpected(String),
}

impl ScrobbleError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ScrobbleError::Transport(err) => err.disposition(),
            // 11 service offline, 16 temporarily unavailable, 29 rate limited
            ScrobbleError::Api { code, .. } if matches!(*code, 11 | 16 | 29) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LastFmErrorBody {
    error: i64,
    #[serde(default)]
    message: String,
}

fn api_error_from_body(body: &str) -> Option<ScrobbleError> {
    serde_json::from_str::<LastFmErrorBody>(body)
        .ok()
        .map(|err| ScrobbleError::Api {
            code: err.error,
            message: err.message,
        })
}

fn map_transport(err: FetchError) -> ScrobbleError {
    err.body()
        .and_then(api_error_from_body)
        .unwrap_or(ScrobbleError::Transport(err))
}

/// Session granted by `auth.getSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastFmSessionInfo {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub subscriber: JsonValue,
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    session: LastFmSessionInfo,
}

/// Receives one batch per call and returns the service's response verbatim.
#[async_trait]
pub trait ScrobbleSink: Send + Sync {
    async fn submit(
        &self,
        session: &ScrobbleSession,
        batch: &SubmissionBatch,
    ) -> Result<JsonValue, ScrobbleError>;
}

#[derive(Debug, Clone)]
pub struct LastFmClient {
    http: HttpClient,
    api_url: String,
}

impl LastFmClient {
    pub fn new(http: HttpClient, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    /// Signed request parameters; `format` is appended after signing.
    pub fn signed_params(
        session: &ScrobbleSession,
        method: &str,
        extra: impl IntoIterator<Item = (String, String)>,
    ) -> Vec<(String, String)> {
        let mut params = BTreeMap::new();
        params.insert("api_key".to_string(), session.api_key.clone());
        params.insert("method".to_string(), method.to_string());
        params.extend(extra);
        let api_sig = sign_params(&params, &session.shared_secret);
        let mut out: Vec<(String, String)> = params.into_iter().collect();
        out.push(("api_sig".to_string(), api_sig));
        out.push(("format".to_string(), "json".to_string()));
        out
    }

    /// Last.fm may answer 200 with an `error` object; both shapes are failures.
    fn decode(result: Result<FetchedResponse, FetchError>) -> Result<JsonValue, ScrobbleError> {
        let resp = result.map_err(map_transport)?;
        let body: JsonValue = resp.json()?;
        if body.get("error").is_some() {
            return Err(match serde_json::from_value::<LastFmErrorBody>(body.clone()) {
                Ok(err) => ScrobbleError::Api {
                    code: err.error,
                    message: err.message,
                },
                Err(_) => ScrobbleError::Unexpected(body.to_string()),
            });
        }
        Ok(body)
    }

    /// Exchange an auth token for a session key; returns the session with it set.
    pub async fn get_session(
        &self,
        session: &ScrobbleSession,
        token: &str,
    ) -> Result<(ScrobbleSession, LastFmSessionInfo), ScrobbleError> {
        let params = Self::signed_params(
            session,
            "auth.getSession",
            [("token".to_string(), token.to_string())],
        );
        let body = Self::decode(self.http.get(&self.api_url, &params).await)?;
        let envelope: SessionEnvelope = serde_json::from_value(body.clone())
            .map_err(|_| ScrobbleError::Unexpected(body.to_string()))?;
        info!(user = %envelope.session.name, "obtained Last.fm session");
        Ok((session.with_session_key(envelope.session.key.clone()), envelope.session))
    }
}

#[async_trait]
impl ScrobbleSink for LastFmClient {
    async fn submit(
        &self,
        session: &ScrobbleSession,
        batch: &SubmissionBatch,
    ) -> Result<JsonValue, ScrobbleError> {
        let Some(session_key) = session.session_key.clone().filter(|k| !k.is_empty()) else {
            return Err(ScrobbleError::MissingSessionKey);
        };
        let mut extra = vec![
            ("sk".to_string(), session_key),
            ("autocorrect".to_string(), "1".to_string()),
        ];
        extra.extend(batch.indexed_params());
        let params = Self::signed_params(session, "track.scrobble", extra);
        debug!(records = batch.len(), "submitting scrobble batch");
        Self::decode(self.http.post_form(&self.api_url, &params).await)
    }
}

/// Fire-and-forget summary messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), FetchError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _message: &str) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Discord-compatible incoming webhook (`{"content": ...}`).
#[derive(Debug, Clone)]
pub struct DiscordWebhook {
    http: HttpClient,
    url: String,
}

impl DiscordWebhook {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordWebhook {
    async fn notify(&self, message: &str) -> Result<(), FetchError> {
        self.http
            .post_json(&self.url, &serde_json::json!({ "content": message }))
            .await?;
        Ok(())
    }
}
