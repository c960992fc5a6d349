//! Cursor persistence + HTTP plumbing shared by adapters and the sync pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use r2l_core::{Cursor, SourceKey};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "r2l-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cursor entry {key} is neither a timestamp nor a snapshot: {source}")]
    InvalidEntry {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Read a JSON file, treating a missing file as `T::default()`.
pub async fn read_json_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(io_error("reading", path)(err)),
    };
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&text).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with pretty JSON via a temp file + rename in the same directory.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(io_error("creating directory", &parent))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error("opening temp file", &temp_path))?;
    let written = async {
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error("writing temp file", &temp_path)(err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error("renaming temp file over", path)(err));
    }
    Ok(())
}

/// Durable "already reported up to" marker per source.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored cursor for `key`, falling back to the key older documents used.
    async fn get(&self, key: &SourceKey) -> Result<Option<Cursor>, StoreError>;

    /// Persist a scalar cursor. Legacy snapshot cursors are never written.
    async fn set(&self, key: &SourceKey, timestamp: i64) -> Result<(), StoreError>;
}

fn parse_entry(key: &str, value: &JsonValue) -> Result<Cursor, StoreError> {
    Cursor::deserialize(value).map_err(|source| StoreError::InvalidEntry {
        key: key.to_string(),
        source,
    })
}

fn lookup_entry<'a>(doc: &'a Map<String, JsonValue>, key: &SourceKey) -> Option<(String, &'a JsonValue)> {
    let canonical = key.to_string();
    if let Some(value) = doc.get(&canonical) {
        return Some((canonical, value));
    }
    doc.get(key.legacy_key())
        .map(|value| (key.legacy_key().to_string(), value))
}

/// All sources share one JSON object document, e.g.
/// `{ "kamai:iidx": 1700000000, "wacca": { "scores": [...], "songs": [...] } }`.
#[derive(Debug)]
pub struct JsonFileCursorStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<Map<String, JsonValue>, StoreError> {
        read_json_or_default(&self.path).await
    }
}

#[async_trait]
impl CursorStore for JsonFileCursorStore {
    async fn get(&self, key: &SourceKey) -> Result<Option<Cursor>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let doc = self.read_document().await?;
        let Some((found_under, value)) = lookup_entry(&doc, key) else {
            return Ok(None);
        };
        let cursor = parse_entry(&found_under, value)?;
        debug!(source = %key, found_under = %found_under, kind = ?cursor.kind(), "loaded cursor");
        Ok(Some(cursor))
    }

    async fn set(&self, key: &SourceKey, timestamp: i64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.insert(key.to_string(), JsonValue::from(timestamp));
        write_json_atomic(&self.path, &doc).await?;
        debug!(source = %key, timestamp, path = %self.path.display(), "persisted cursor");
        Ok(())
    }
}

/// In-process store with the same lookup rules as the JSON document.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    entries: Mutex<BTreeMap<String, Cursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, key: impl Into<String>, cursor: Cursor) -> Self {
        self.entries.get_mut().insert(key.into(), cursor);
        self
    }

    pub async fn entries(&self) -> BTreeMap<String, Cursor> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, key: &SourceKey) -> Result<Option<Cursor>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&key.to_string())
            .or_else(|| entries.get(key.legacy_key()))
            .cloned())
    }

    async fn set(&self, key: &SourceKey, timestamp: i64) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Cursor::Timestamp(timestamp));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

/// Transport failures. Nothing is retried here; callers read [`FetchError::disposition`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    /// Response body of a non-2xx reply, when the remote sent one.
    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::HttpStatus { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(|source| FetchError::Request {
            url: "<client builder>".to_string(),
            source,
        })?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str, query: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(query);
        self.send("GET", url, request).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).form(form);
        self.send("POST", url, request).await
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).json(body);
        self.send("POST", url, request).await
    }

    async fn send(
        &self,
        method: &'static str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_request", method, url);
        async move {
            let resp = request.send().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();

            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            Ok(FetchedResponse { final_url, body })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2l_core::{RawScore, RawSnapshot};
    use tempfile::tempdir;

    fn key(game: &str) -> SourceKey {
        SourceKey::new("kamai", game)
    }

    #[tokio::test]
    async fn missing_document_has_no_cursor() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileCursorStore::new(dir.path().join("gameDataSave.json"));
        assert_eq!(store.get(&key("iidx")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_rewrites_whole_document_and_keeps_other_sources() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gameDataSave.json");
        std::fs::write(&path, r#"{ "sdvx": 1650000000, "notes": "kept" }"#).unwrap();
        let store = JsonFileCursorStore::new(&path);

        store.set(&key("iidx"), 1_700_000_000).await.unwrap();
        store.set(&key("iidx"), 1_700_000_500).await.unwrap();

        let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["kamai:iidx"], 1_700_000_500);
        assert_eq!(doc["sdvx"], 1_650_000_000);
        assert_eq!(doc["notes"], "kept");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn legacy_bare_game_key_is_read_until_canonical_key_exists() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gameDataSave.json");
        std::fs::write(&path, r#"{ "iidx": 1600000000 }"#).unwrap();
        let store = JsonFileCursorStore::new(&path);

        assert_eq!(
            store.get(&key("iidx")).await.unwrap(),
            Some(Cursor::Timestamp(1_600_000_000))
        );
        store.set(&key("iidx"), 1_600_000_100).await.unwrap();
        assert_eq!(
            store.get(&key("iidx")).await.unwrap(),
            Some(Cursor::Timestamp(1_600_000_100))
        );
    }

    #[tokio::test]
    async fn legacy_snapshot_entries_are_readable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gameDataSave.json");
        std::fs::write(
            &path,
            r#"{ "kamai:iidx": { "body": { "scores": [{ "songID": 4, "timeAchieved": 1600000000000 }], "songs": [] } } }"#,
        )
        .unwrap();
        let store = JsonFileCursorStore::new(&path);
        let cursor = store.get(&key("iidx")).await.unwrap().unwrap();
        assert_eq!(
            cursor,
            Cursor::Snapshot(RawSnapshot {
                scores: vec![RawScore {
                    song_id: 4,
                    time_achieved: Some(1_600_000_000_000)
                }],
                songs: vec![],
            })
        );
        assert_eq!(cursor.last_timestamp(), Some(1_600_000_000));
    }

    #[tokio::test]
    async fn malformed_entry_is_an_error_not_a_missing_cursor() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gameDataSave.json");
        std::fs::write(&path, r#"{ "kamai:iidx": "yesterday" }"#).unwrap();
        let store = JsonFileCursorStore::new(&path);
        let err = store.get(&key("iidx")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry { .. }));

        std::fs::write(&path, r#"{ "kamai:sdvx": { "ts": 5 }, "kamai:ddr-sp": {} }"#).unwrap();
        let err = store.get(&key("sdvx")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry { .. }));
        let err = store.get(&key("ddr-sp")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry { .. }));
    }

    #[tokio::test]
    async fn concurrent_sets_for_different_sources_are_all_kept() {
        let dir = tempdir().expect("tempdir");
        let store = std::sync::Arc::new(JsonFileCursorStore::new(dir.path().join("doc.json")));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.set(&key(&format!("game{i}")), i).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for i in 0..16 {
            assert_eq!(
                store.get(&key(&format!("game{i}"))).await.unwrap(),
                Some(Cursor::Timestamp(i))
            );
        }
    }

    #[tokio::test]
    async fn memory_store_follows_same_lookup_rules() {
        let store = MemoryCursorStore::new().with_entry("iidx", Cursor::Timestamp(5));
        assert_eq!(store.get(&key("iidx")).await.unwrap(), Some(Cursor::Timestamp(5)));
        store.set(&key("iidx"), 9).await.unwrap();
        assert_eq!(store.get(&key("iidx")).await.unwrap(), Some(Cursor::Timestamp(9)));
        assert_eq!(store.entries().await.len(), 2);
    }

    #[test]
    fn status_classification_marks_server_errors_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 503,
            url: "http://x".into(),
            body: String::new(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(err.body(), None);
    }
}
