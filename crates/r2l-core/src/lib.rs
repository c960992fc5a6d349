//! Core play model and the pure extract / dedup / batch steps of a sync cycle.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CRATE_NAME: &str = "r2l-core";

/// Largest number of scrobbles Last.fm accepts in one `track.scrobble` call.
pub const MAX_BATCH_SIZE: usize = 50;

/// Placeholder track name used when the source title is unrecoverable.
pub const NULL_TRACK: &str = "NULL";

/// U+FFFD after its UTF-8 bytes were decoded as Latin-1 somewhere upstream.
const MISDECODED_REPLACEMENT: &str = "ï¿½";

/// Identifies one cursor: which adapter fetched it and for which game.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub adapter: String,
    pub game: String,
}

impl SourceKey {
    pub fn new(adapter: impl Into<String>, game: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            game: game.into(),
        }
    }

    /// Key under which older cursor documents stored this source (game only).
    pub fn legacy_key(&self) -> &str {
        &self.game
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.adapter, self.game)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawScore {
    #[serde(rename = "songID")]
    pub song_id: i64,
    /// Milliseconds since the epoch; Tachi reports `null` for imported scores.
    #[serde(rename = "timeAchieved", default)]
    pub time_achieved: Option<i64>,
}

impl RawScore {
    pub fn timestamp_secs(&self) -> Option<i64> {
        self.time_achieved.map(|ms| ms.div_euclid(1000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSong {
    pub id: i64,
    pub title: String,
    pub artist: String,
}

/// Point-in-time dump of a player's recent scores plus the songs they reference.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "SnapshotWire")]
pub struct RawSnapshot {
    pub scores: Vec<RawScore>,
    pub songs: Vec<RawSong>,
}

/// `scores` is required so an arbitrary object is not taken for a snapshot.
#[derive(Debug, Default, Deserialize)]
struct SnapshotBody {
    scores: Vec<RawScore>,
    #[serde(default)]
    songs: Vec<RawSong>,
}

/// Tachi wraps payloads in `{ success, description, body }`; stored legacy
/// cursors hold either that envelope or the bare body.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotWire {
    Envelope { body: SnapshotBody },
    Bare(SnapshotBody),
}

impl From<SnapshotWire> for RawSnapshot {
    fn from(wire: SnapshotWire) -> Self {
        let body = match wire {
            SnapshotWire::Envelope { body } | SnapshotWire::Bare(body) => body,
        };
        Self {
            scores: body.scores,
            songs: body.songs,
        }
    }
}

impl RawSnapshot {
    pub fn song(&self, id: i64) -> Option<&RawSong> {
        self.songs.iter().find(|song| song.id == id)
    }

    /// Newest score time in the snapshot, whether or not the score joins to a song.
    pub fn newest_timestamp(&self) -> Option<i64> {
        self.scores.iter().filter_map(RawScore::timestamp_secs).max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRecord {
    pub artist: String,
    pub track: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
}

impl PlayRecord {
    pub fn from_song(song: &RawSong, timestamp: i64) -> Self {
        let track = if is_corrupted_title(&song.title) {
            NULL_TRACK.to_string()
        } else {
            song.title.clone()
        };
        Self {
            artist: song.artist.clone(),
            track,
            timestamp,
        }
    }
}

/// True when a title is nothing but replacement characters (raw or misdecoded).
pub fn is_corrupted_title(title: &str) -> bool {
    let normalized = title.replace(MISDECODED_REPLACEMENT, "\u{FFFD}");
    let trimmed = normalized.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '\u{FFFD}')
}

/// Join scores to songs in score order. Scores without a song or a time are dropped.
pub fn extract(snapshot: &RawSnapshot) -> Vec<PlayRecord> {
    snapshot
        .scores
        .iter()
        .filter_map(|score| {
            let Some(song) = snapshot.song(score.song_id) else {
                debug!(song_id = score.song_id, "dropping score with no matching song");
                return None;
            };
            let Some(timestamp) = score.timestamp_secs() else {
                debug!(song_id = score.song_id, "dropping score with no achieved time");
                return None;
            };
            Some(PlayRecord::from_song(song, timestamp))
        })
        .collect()
}

/// Keep records no older than `max_age_secs` relative to `now_secs`.
pub fn retain_recent(records: Vec<PlayRecord>, now_secs: i64, max_age_secs: i64) -> Vec<PlayRecord> {
    let oldest_allowed = now_secs.saturating_sub(max_age_secs);
    records
        .into_iter()
        .filter(|record| record.timestamp >= oldest_allowed)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    /// Newest reported timestamp.
    Timestamp,
    /// Whole previous snapshot; read-only, migrated to `Timestamp` on first sync.
    LegacySnapshot,
}

/// What has already been reported for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Timestamp(i64),
    Snapshot(RawSnapshot),
}

impl Cursor {
    pub fn kind(&self) -> CursorKind {
        match self {
            Cursor::Timestamp(_) => CursorKind::Timestamp,
            Cursor::Snapshot(_) => CursorKind::LegacySnapshot,
        }
    }

    /// Scalar form of the cursor. A legacy snapshot maps to its newest score time.
    pub fn last_timestamp(&self) -> Option<i64> {
        match self {
            Cursor::Timestamp(ts) => Some(*ts),
            Cursor::Snapshot(snapshot) => snapshot.newest_timestamp(),
        }
    }

    pub fn normalized(&self) -> Option<Cursor> {
        self.last_timestamp().map(Cursor::Timestamp)
    }
}

/// Records strictly newer than the cursor, in input order. No cursor keeps everything.
pub fn dedup(cursor: Option<&Cursor>, records: Vec<PlayRecord>) -> Vec<PlayRecord> {
    match cursor.and_then(Cursor::last_timestamp) {
        Some(last) => records
            .into_iter()
            .filter(|record| record.timestamp > last)
            .collect(),
        None => records,
    }
}

/// Legacy diff of a new snapshot against the previously stored one.
///
/// Keeps a record only when the old snapshot has a record with the same
/// artist and track and does not contain its timestamp. First plays of a
/// track never seen before are dropped, and repeated plays of a known track
/// are kept even when they were already reported under another timestamp.
#[deprecated(note = "drops first plays of unseen tracks; use `dedup` with a timestamp cursor")]
pub fn dedup_snapshot_diff(previous: &RawSnapshot, records: Vec<PlayRecord>) -> Vec<PlayRecord> {
    let old = extract(previous);
    let seen_timestamps: HashSet<i64> = old.iter().map(|r| r.timestamp).collect();
    let seen_tracks: HashSet<(&str, &str)> = old
        .iter()
        .map(|r| (r.artist.as_str(), r.track.as_str()))
        .collect();
    records
        .into_iter()
        .filter(|record| {
            seen_tracks.contains(&(record.artist.as_str(), record.track.as_str()))
                && !seen_timestamps.contains(&record.timestamp)
        })
        .collect()
}

/// One `track.scrobble` call worth of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionBatch {
    records: Vec<PlayRecord>,
}

impl SubmissionBatch {
    pub fn records(&self) -> &[PlayRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.records.iter().map(|r| r.timestamp).max()
    }

    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.records.iter().map(|r| r.timestamp).min()
    }

    /// `artist[i]`, `track[i]`, `timestamp[i]` fields, indexed from zero within the batch.
    pub fn indexed_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(self.records.len() * 3);
        for (idx, record) in self.records.iter().enumerate() {
            params.push((format!("artist[{idx}]"), record.artist.clone()));
            params.push((format!("track[{idx}]"), record.track.clone()));
            params.push((format!("timestamp[{idx}]"), record.timestamp.to_string()));
        }
        params
    }
}

pub fn batch(records: Vec<PlayRecord>) -> Vec<SubmissionBatch> {
    batch_with_capacity(records, MAX_BATCH_SIZE)
}

/// Split into consecutive batches of at most `capacity` (clamped to `1..=MAX_BATCH_SIZE`).
pub fn batch_with_capacity(records: Vec<PlayRecord>, capacity: usize) -> Vec<SubmissionBatch> {
    let capacity = capacity.clamp(1, MAX_BATCH_SIZE);
    records
        .chunks(capacity)
        .map(|chunk| SubmissionBatch {
            records: chunk.to_vec(),
        })
        .collect()
}

/// Cursor after a cycle in which every batch was accepted.
pub fn advance_cursor(previous: Option<i64>, observed_newest: Option<i64>) -> Option<i64> {
    previous.max(observed_newest)
}

/// Cursor after `batches[..accepted]` were accepted and the rest were not sent.
///
/// Stops just below the oldest unsent record so nothing unsent is ever
/// skipped, and never moves backwards.
pub fn partial_cursor(
    previous: Option<i64>,
    batches: &[SubmissionBatch],
    accepted: usize,
) -> Option<i64> {
    let accepted = accepted.min(batches.len());
    let accepted_newest = batches[..accepted]
        .iter()
        .filter_map(SubmissionBatch::newest_timestamp)
        .max();
    let unsent_oldest = batches[accepted..]
        .iter()
        .filter_map(SubmissionBatch::oldest_timestamp)
        .min();
    let candidate = match (accepted_newest, unsent_oldest) {
        (Some(newest), Some(oldest)) => Some(newest.min(oldest.saturating_sub(1))),
        (newest, None) => newest,
        (None, Some(_)) => None,
    };
    previous.max(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: i64, title: &str, artist: &str) -> RawSong {
        RawSong {
            id,
            title: title.to_string(),
            artist: artist.to_string(),
        }
    }

    fn score(song_id: i64, ms: i64) -> RawScore {
        RawScore {
            song_id,
            time_achieved: Some(ms),
        }
    }

    fn record(ts: i64) -> PlayRecord {
        PlayRecord {
            artist: "Artist".into(),
            track: format!("Track {ts}"),
            timestamp: ts,
        }
    }

    fn sample_snapshot() -> RawSnapshot {
        RawSnapshot {
            scores: vec![score(2, 1_700_000_300_999), score(1, 1_700_000_200_000), score(3, 1_700_000_100_500)],
            songs: vec![
                song(1, "Freedom Dive", "xi"),
                song(2, "\u{FFFD}", "Unknown Composer"),
                song(3, "Blue Zenith", "xi"),
            ],
        }
    }

    #[test]
    fn extraction_joins_songs_in_score_order() {
        let records = extract(&sample_snapshot());
        let timestamps: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1_700_000_300, 1_700_000_200, 1_700_000_100]);
        assert_eq!(records[1].track, "Freedom Dive");
        assert_eq!(records[2].artist, "xi");
    }

    #[test]
    fn extraction_is_idempotent() {
        let snapshot = sample_snapshot();
        assert_eq!(extract(&snapshot), extract(&snapshot));
    }

    #[test]
    fn scores_without_song_or_time_are_dropped() {
        let snapshot = RawSnapshot {
            scores: vec![
                score(9, 5_000),
                RawScore {
                    song_id: 1,
                    time_achieved: None,
                },
                score(1, 7_000),
            ],
            songs: vec![song(1, "Song", "Band")],
        };
        let records = extract(&snapshot);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 7);
    }

    #[test]
    fn corrupted_titles_become_null_sentinel() {
        for title in ["\u{FFFD}", "ï¿½", " \u{FFFD}\u{FFFD} ", "ï¿½ï¿½"] {
            for ts in [0, 1_500, 1_700_000_000_000] {
                let snapshot = RawSnapshot {
                    scores: vec![score(1, ts)],
                    songs: vec![song(1, title, "Kobaryo")],
                };
                let records = extract(&snapshot);
                assert_eq!(records[0].track, NULL_TRACK, "title {title:?}");
                assert_eq!(records[0].artist, "Kobaryo");
            }
        }
        assert!(!is_corrupted_title(""));
        assert!(!is_corrupted_title("Caf\u{FFFD} Mix"));
    }

    #[test]
    fn timestamps_floor_to_seconds() {
        let snapshot = RawSnapshot {
            scores: vec![score(1, 1_999), score(1, -1)],
            songs: vec![song(1, "Song", "Band")],
        };
        let timestamps: Vec<_> = extract(&snapshot).iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1, -1]);
    }

    #[test]
    fn snapshot_parses_tachi_envelope_and_bare_body() {
        let envelope = r#"{"success":true,"description":"ok","body":{
            "scores":[{"songID":1,"timeAchieved":1000,"scoreData":{}}],
            "songs":[{"id":1,"title":"A","artist":"B","altTitles":[]}]}}"#;
        let bare = r#"{"scores":[{"songID":1,"timeAchieved":1000}],"songs":[{"id":1,"title":"A","artist":"B"}]}"#;
        let a: RawSnapshot = serde_json::from_str(envelope).unwrap();
        let b: RawSnapshot = serde_json::from_str(bare).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.newest_timestamp(), Some(1));
    }

    #[test]
    fn cursor_parses_scalar_and_legacy_snapshot() {
        let scalar: Cursor = serde_json::from_str("1700000000").unwrap();
        assert_eq!(scalar, Cursor::Timestamp(1_700_000_000));

        let legacy: Cursor = serde_json::from_str(
            r#"{"body":{"scores":[{"songID":1,"timeAchieved":9000},{"songID":7,"timeAchieved":12000}],"songs":[]}}"#,
        )
        .unwrap();
        assert_eq!(legacy.kind(), CursorKind::LegacySnapshot);
        assert_eq!(legacy.normalized(), Some(Cursor::Timestamp(12)));
    }

    #[test]
    fn cursor_rejects_objects_without_scores() {
        for doc in ["{}", r#"{"ts":5}"#, r#"{"body":{}}"#, r#"{"songs":[]}"#] {
            assert!(serde_json::from_str::<Cursor>(doc).is_err(), "{doc} parsed as a cursor");
        }

        let empty: Cursor = serde_json::from_str(r#"{"scores":[]}"#).unwrap();
        assert_eq!(empty.kind(), CursorKind::LegacySnapshot);
        assert_eq!(empty.normalized(), None);
    }

    #[test]
    fn dedup_keeps_only_records_after_cursor() {
        let records = vec![record(900), record(1000), record(1100), record(1200)];
        let kept = dedup(Some(&Cursor::Timestamp(1000)), records);
        let timestamps: Vec<_> = kept.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1100, 1200]);
    }

    #[test]
    fn dedup_output_is_always_after_cursor() {
        let records: Vec<_> = (0..40).map(|i| record((i * 37) % 23)).collect();
        for cursor in -1..25 {
            for kept in dedup(Some(&Cursor::Timestamp(cursor)), records.clone()) {
                assert!(kept.timestamp > cursor);
            }
        }
    }

    #[test]
    fn dedup_without_cursor_keeps_everything_in_order() {
        let records = vec![record(3), record(1), record(2)];
        assert_eq!(dedup(None, records.clone()), records);
    }

    #[test]
    fn dedup_is_stable_for_equal_timestamps() {
        let mut a = record(50);
        a.track = "first".into();
        let mut b = record(50);
        b.track = "second".into();
        let kept = dedup(Some(&Cursor::Timestamp(10)), vec![a.clone(), record(5), b.clone()]);
        assert_eq!(kept, vec![a, b]);
    }

    #[test]
    fn dedup_migrates_legacy_snapshot_cursor() {
        let previous = RawSnapshot {
            scores: vec![score(1, 1_000_000)],
            songs: vec![song(1, "Old", "Band")],
        };
        let kept = dedup(
            Some(&Cursor::Snapshot(previous)),
            vec![record(999), record(1000), record(1001)],
        );
        assert_eq!(kept, vec![record(1001)]);
    }

    #[test]
    #[allow(deprecated)]
    fn snapshot_diff_reproduces_its_known_defects() {
        let previous = RawSnapshot {
            scores: vec![score(1, 100_000)],
            songs: vec![song(1, "Known", "Band"), song(2, "Fresh", "Band")],
        };
        let known_replay = PlayRecord {
            artist: "Band".into(),
            track: "Known".into(),
            timestamp: 200,
        };
        let first_play = PlayRecord {
            artist: "Band".into(),
            track: "Fresh".into(),
            timestamp: 300,
        };
        let kept = dedup_snapshot_diff(&previous, vec![first_play, known_replay.clone()]);
        assert_eq!(kept, vec![known_replay]);
    }

    #[test]
    fn batches_respect_capacity() {
        let sizes: Vec<_> = batch((0..120).map(record).collect())
            .iter()
            .map(SubmissionBatch::len)
            .collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert!(batch(Vec::new()).is_empty());
        for b in batch_with_capacity((0..7).map(record).collect(), 500) {
            assert!(b.len() <= MAX_BATCH_SIZE);
        }
    }

    #[test]
    fn batching_conserves_records_in_order() {
        let records: Vec<_> = (0..137).map(|i| record(1_000 - i)).collect();
        let batches = batch(records.clone());
        let rejoined: Vec<_> = batches.iter().flat_map(|b| b.records().to_vec()).collect();
        assert_eq!(rejoined, records);
    }

    #[test]
    fn indexed_params_restart_at_zero_per_batch() {
        let batches = batch((0..52).map(record).collect());
        let second = batches[1].indexed_params();
        assert_eq!(
            second,
            vec![
                ("artist[0]".to_string(), "Artist".to_string()),
                ("track[0]".to_string(), "Track 50".to_string()),
                ("timestamp[0]".to_string(), "50".to_string()),
                ("artist[1]".to_string(), "Artist".to_string()),
                ("track[1]".to_string(), "Track 51".to_string()),
                ("timestamp[1]".to_string(), "51".to_string()),
            ]
        );
    }

    #[test]
    fn retain_recent_drops_old_plays() {
        let kept = retain_recent(vec![record(10), record(95), record(100)], 100, 5);
        assert_eq!(kept, vec![record(95), record(100)]);
    }

    #[test]
    fn cursor_advances_monotonically() {
        assert_eq!(advance_cursor(None, Some(5)), Some(5));
        assert_eq!(advance_cursor(Some(9), Some(5)), Some(9));
        assert_eq!(advance_cursor(Some(9), None), Some(9));
        assert_eq!(advance_cursor(None, None), None);
    }

    #[test]
    fn partial_cursor_for_oldest_first_batches_stops_at_last_accepted() {
        let batches = batch((1..=120).map(record).collect());
        assert_eq!(partial_cursor(Some(0), &batches, 1), Some(50));
        assert_eq!(partial_cursor(Some(0), &batches, 0), Some(0));
        assert_eq!(partial_cursor(None, &batches, 3), Some(120));
    }

    #[test]
    fn partial_cursor_for_newest_first_batches_never_skips_unsent() {
        let batches = batch((1..=120).rev().map(record).collect());
        // Batch 0 holds 120..=71; unsent batches reach down to 1.
        assert_eq!(partial_cursor(Some(0), &batches, 1), Some(0));
        assert_eq!(partial_cursor(None, &batches, 1), Some(0));
        assert_eq!(partial_cursor(Some(0), &batches, 2), Some(0));
    }
}
