use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

const VIDEO_HISTORY_MARKER: &str = "Streaming_History_Video";
const OFFLINE_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// One entry of a streaming history export, as found on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEntry {
    pub ts: Option<Value>,
    #[serde(deserialize_with = "deserialize_opt_i64_string_or_number")]
    pub ms_played: Option<i64>,
    pub master_metadata_track_name: Option<String>,
    pub master_metadata_album_artist_name: Option<String>,
    pub master_metadata_album_album_name: Option<String>,
    #[serde(deserialize_with = "deserialize_opt_i64_string_or_number")]
    pub offline_timestamp: Option<i64>,
    pub incognito_mode: Option<bool>,
    pub is_private_session: Option<bool>,
    pub episode_name: Option<String>,
    pub episode_show_name: Option<String>,
    pub spotify_episode_uri: Option<String>,
    pub audiobook_title: Option<String>,
    pub audiobook_uri: Option<String>,
    pub reason_start: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Music,
    Podcast,
    Audiobook,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub artist: String,
    pub track: String,
    pub album: Option<String>,
    /// End of playback, UTC seconds.
    pub end_time: i64,
    pub ms_played: i64,
    pub offline_timestamp: Option<i64>,
    pub kind: ContentKind,
    pub private: bool,
    pub chosen_by_user: bool,
}

/// Turns a raw entry into a play record. Entries without an artist, a track
/// or a parseable end timestamp are dropped.
pub fn normalize(entry: &RawEntry) -> Option<PlayRecord> {
    let artist = non_empty(entry.master_metadata_album_artist_name.as_deref())?;
    let track = non_empty(entry.master_metadata_track_name.as_deref())?;
    let end_time = entry.ts.as_ref().and_then(parse_end_time)?;
    let kind = if has_any(&[
        &entry.episode_name,
        &entry.episode_show_name,
        &entry.spotify_episode_uri,
    ]) {
        ContentKind::Podcast
    } else if has_any(&[&entry.audiobook_title, &entry.audiobook_uri]) {
        ContentKind::Audiobook
    } else {
        ContentKind::Music
    };
    Some(PlayRecord {
        artist,
        track,
        album: non_empty(entry.master_metadata_album_album_name.as_deref()),
        end_time,
        ms_played: entry.ms_played.unwrap_or(0).max(0),
        offline_timestamp: entry.offline_timestamp.and_then(normalize_offline_timestamp),
        kind,
        private: entry.incognito_mode.unwrap_or(false)
            || entry.is_private_session.unwrap_or(false),
        chosen_by_user: entry.reason_start.as_deref() != Some("autoplay"),
    })
}

/// Loads every history entry below the given files and directories.
pub fn load_history(inputs: &[PathBuf]) -> Vec<RawEntry> {
    let mut entries = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for file in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|item| item.ok())
                .filter(|item| item.file_type().is_file())
                .map(walkdir::DirEntry::into_path)
                .filter(|path| is_history_file(path))
            {
                read_file_lenient(&file, &mut entries);
            }
        } else if input.is_file() {
            if is_history_file(input) {
                read_file_lenient(input, &mut entries);
            } else {
                warn!("Skipping unsupported input {}", input.display());
            }
        } else {
            warn!("Input {} not found, skipped", input.display());
        }
    }
    entries
}

/// Reads one history file. Records that do not match the expected shape are
/// skipped individually, only an unreadable file is an error.
pub fn read_history_file(path: &Path) -> Result<Vec<RawEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading history file {}", path.display()))?;
    let values: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing history file {}", path.display()))?;
    let mut entries = Vec::with_capacity(values.len());
    let mut skipped = 0usize;
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<RawEntry>(value) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                debug!("Skipping record {index} of {}: {err}", path.display());
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(
            "Skipped {skipped} malformed records in {}",
            path.display()
        );
    }
    Ok(entries)
}

fn read_file_lenient(path: &Path, entries: &mut Vec<RawEntry>) {
    match read_history_file(path) {
        Ok(mut loaded) => {
            debug!("Read {} entries from {}", loaded.len(), path.display());
            entries.append(&mut loaded);
        }
        Err(err) => warn!("{err:#}"),
    }
}

fn is_history_file(path: &Path) -> bool {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let is_video = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(VIDEO_HISTORY_MARKER));
    is_json && !is_video
}

fn parse_end_time(value: &Value) -> Option<i64> {
    if let Some(seconds) = value.as_i64() {
        return Some(seconds);
    }
    let raw = value.as_str()?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp());
    }
    raw.parse::<i64>().ok()
}

fn normalize_offline_timestamp(value: i64) -> Option<i64> {
    match value {
        value if value <= 0 => None,
        value if value >= OFFLINE_MILLIS_THRESHOLD => Some(value / 1000),
        value => Some(value),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn has_any(fields: &[&Option<String>]) -> bool {
    fields
        .iter()
        .any(|field| field.as_deref().is_some_and(|value| !value.trim().is_empty()))
}

fn deserialize_opt_i64_string_or_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Integer(i64),
        Float(f64),
    }
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrNumber::String(value)) => Ok(value.trim().parse::<i64>().ok()),
        Some(StringOrNumber::Integer(value)) => Ok(Some(value)),
        Some(StringOrNumber::Float(value)) => Ok(Some(value as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(json: &str) -> RawEntry {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn normalizes_spotify_entry() {
        let raw = entry(
            r#"{
                "ts": "2023-11-14T22:13:20Z",
                "ms_played": 200000,
                "master_metadata_track_name": " Teardrop ",
                "master_metadata_album_artist_name": "Massive Attack",
                "master_metadata_album_album_name": "",
                "offline_timestamp": 1699999800123,
                "incognito_mode": false,
                "reason_start": "clickrow"
            }"#,
        );
        let record = normalize(&raw).unwrap();
        assert_eq!(record.artist, "Massive Attack");
        assert_eq!(record.track, "Teardrop");
        assert_eq!(record.album, None);
        assert_eq!(record.end_time, 1_700_000_000);
        assert_eq!(record.ms_played, 200_000);
        assert_eq!(record.offline_timestamp, Some(1_699_999_800));
        assert_eq!(record.kind, ContentKind::Music);
        assert!(!record.private);
        assert!(record.chosen_by_user);
    }

    #[test]
    fn drops_entries_missing_identity_or_time() {
        assert!(normalize(&entry(r#"{"ts": "2023-11-14T22:13:20Z", "master_metadata_track_name": "x"}"#)).is_none());
        assert!(normalize(&entry(r#"{"ts": "garbage", "master_metadata_track_name": "x", "master_metadata_album_artist_name": "y"}"#)).is_none());
        assert!(normalize(&entry(r#"{"master_metadata_track_name": "x", "master_metadata_album_artist_name": "y"}"#)).is_none());
    }

    #[test]
    fn detects_content_kind_and_privacy() {
        let podcast = entry(
            r#"{"ts": 1700000000, "master_metadata_track_name": "x", "master_metadata_album_artist_name": "y", "episode_name": "Ep 1"}"#,
        );
        assert_eq!(normalize(&podcast).unwrap().kind, ContentKind::Podcast);
        let book = entry(
            r#"{"ts": 1700000000, "master_metadata_track_name": "x", "master_metadata_album_artist_name": "y", "audiobook_uri": "spotify:audiobook:1", "is_private_session": true}"#,
        );
        let record = normalize(&book).unwrap();
        assert_eq!(record.kind, ContentKind::Audiobook);
        assert!(record.private);
    }

    #[test]
    fn accepts_numeric_strings_and_autoplay() {
        let raw = entry(
            r#"{"ts": "1700000000", "ms_played": "45000", "offline_timestamp": "0", "master_metadata_track_name": "x", "master_metadata_album_artist_name": "y", "reason_start": "autoplay"}"#,
        );
        let record = normalize(&raw).unwrap();
        assert_eq!(record.end_time, 1_700_000_000);
        assert_eq!(record.ms_played, 45_000);
        assert_eq!(record.offline_timestamp, None);
        assert!(!record.chosen_by_user);
    }

    #[test]
    fn loads_directories_and_skips_video_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("Spotify Extended Streaming History");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            nested.join("Streaming_History_Audio_2023.json"),
            r#"[{"ts": 1700000000}, {"ts": 1700000100}]"#,
        )
        .unwrap();
        fs::write(
            nested.join("Streaming_History_Video_2023.json"),
            r#"[{"ts": 1700000000}]"#,
        )
        .unwrap();
        fs::write(nested.join("broken.json"), "{not json").unwrap();
        fs::write(nested.join("notes.txt"), "[]").unwrap();

        let entries = load_history(&[dir.path().to_path_buf()]);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn malformed_record_does_not_discard_its_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Streaming_History_Audio_2024.json");
        fs::write(
            &path,
            r#"[
                {"ts": "2024-01-01T10:00:00Z", "master_metadata_track_name": "x", "master_metadata_album_artist_name": "y"},
                {"ts": "2024-01-01T10:05:00Z", "incognito_mode": "false"},
                {"ts": "2024-01-01T10:10:00Z", "master_metadata_track_name": 42},
                "not a record"
            ]"#,
        )
        .unwrap();

        let entries = load_history(&[path]);
        assert_eq!(entries.len(), 1);
        assert_eq!(normalize(&entries[0]).unwrap().track, "x");
    }
}
