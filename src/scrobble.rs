use std::collections::HashSet;
use std::fmt;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::info;

use crate::batch::RequestOptions;
use crate::history::{ContentKind, PlayRecord, RawEntry, normalize};

pub const MIN_PLAYED_MS: i64 = 30_000;
pub const OFFLINE_TOLERANCE_SECONDS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrobbleCandidate {
    pub record: PlayRecord,
    /// Start of playback, UTC seconds.
    pub timestamp: i64,
}

impl ScrobbleCandidate {
    pub fn new(record: PlayRecord) -> Self {
        let timestamp = resolve_start(&record);
        Self { record, timestamp }
    }

    pub fn identity_key(&self) -> (&str, &str, i64) {
        (&self.record.artist, &self.record.track, self.timestamp)
    }
}

/// Mirrors the service's own rule for what counts as a scrobble.
pub fn is_eligible(record: &PlayRecord) -> bool {
    record.kind == ContentKind::Music
        && !record.private
        && !record.artist.trim().is_empty()
        && !record.track.trim().is_empty()
        && record.ms_played >= MIN_PLAYED_MS
}

/// Start of playback: end time minus the played duration, unless the device
/// reported an offline timestamp that lies within a week of it.
pub fn resolve_start(record: &PlayRecord) -> i64 {
    let start = record
        .end_time
        .saturating_sub(record.ms_played.div_euclid(1000));
    match record.offline_timestamp {
        Some(offline) if offline.abs_diff(start) <= OFFLINE_TOLERANCE_SECONDS.unsigned_abs() => {
            offline
        }
        _ => start,
    }
}

/// Keeps the first candidate for each `(artist, track, timestamp)` key.
pub fn deduplicate(candidates: Vec<ScrobbleCandidate>) -> Vec<ScrobbleCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| {
            let (artist, track, timestamp) = candidate.identity_key();
            seen.insert((artist.to_string(), track.to_string(), timestamp))
        })
        .collect()
}

/// Rewrites timestamps so the last candidate lands on `finish_at` and each
/// earlier one `gap_seconds` before its successor.
pub fn redate(candidates: &mut [ScrobbleCandidate], finish_at: i64, gap_seconds: i64) {
    let gap = gap_seconds.max(1);
    let last = candidates.len();
    for (index, candidate) in candidates.iter_mut().enumerate() {
        let steps_back = i64::try_from(last - 1 - index).unwrap_or(i64::MAX);
        candidate.timestamp = finish_at.saturating_sub(steps_back.saturating_mul(gap));
    }
}

/// Half-open UTC date range, applied to resolved start times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, timestamp: i64) -> bool {
        if let Some(since) = self.since {
            if timestamp < day_start(since) {
                return false;
            }
        }
        if let Some(until) = self.until {
            if timestamp >= day_start(until) {
                return false;
            }
        }
        true
    }
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map_or(0, |midnight| midnight.and_utc().timestamp())
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date {value:?}, expected YYYY-MM-DD"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAt {
    Now,
    At(i64),
}

impl FinishAt {
    /// Accepts `now`, a date, or an ISO datetime. Values without an offset
    /// are taken as UTC.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("now") {
            return Ok(FinishAt::Now);
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Ok(FinishAt::At(parsed.timestamp()));
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
                return Ok(FinishAt::At(parsed.and_utc().timestamp()));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Ok(FinishAt::At(day_start(date)));
        }
        bail!("Invalid finish time {value:?}, expected \"now\", a date or an ISO datetime");
    }

    pub fn resolve(self, now: DateTime<Utc>) -> i64 {
        match self {
            FinishAt::Now => now.timestamp(),
            FinishAt::At(timestamp) => timestamp,
        }
    }
}

impl fmt::Display for FinishAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishAt::Now => f.write_str("now"),
            FinishAt::At(timestamp) => write!(f, "{timestamp}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportMode {
    pub finish_at: FinishAt,
    pub gap_seconds: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub range: DateRange,
    pub request: RequestOptions,
    pub import_mode: Option<ImportMode>,
    pub limit: Option<usize>,
}

impl PipelineOptions {
    /// Hash over every setting that changes which candidates are produced,
    /// in which order, or what gets sent for them.
    pub fn fingerprint(&self) -> String {
        let date = |value: Option<NaiveDate>| value.map(|date| date.to_string()).unwrap_or_default();
        let mut canonical = format!(
            "since={};until={};duration={};chosen={};",
            date(self.range.since),
            date(self.range.until),
            self.request.include_duration,
            self.request.send_chosen_by_user,
        );
        match &self.import_mode {
            Some(mode) => canonical.push_str(&format!(
                "import=true;finish={};gap={};",
                mode.finish_at,
                mode.gap_seconds.max(1)
            )),
            None => canonical.push_str("import=false;"),
        }
        if let Some(limit) = self.limit {
            canonical.push_str(&format!("limit={limit};"));
        }
        format!("{:x}", md5::compute(canonical))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub loaded: usize,
    pub normalized: usize,
    pub eligible: usize,
    pub out_of_range: usize,
    pub duplicates: usize,
    pub candidates: usize,
}

/// Runs every stage between raw history entries and the ordered candidate
/// sequence handed to the batcher. The result is deterministic for a given
/// input, options and `now`.
pub fn build_candidates(
    entries: &[RawEntry],
    options: &PipelineOptions,
    now: DateTime<Utc>,
) -> (Vec<ScrobbleCandidate>, PipelineReport) {
    let mut report = PipelineReport {
        loaded: entries.len(),
        ..PipelineReport::default()
    };
    let records: Vec<PlayRecord> = entries.iter().filter_map(normalize).collect();
    report.normalized = records.len();

    let mut candidates: Vec<ScrobbleCandidate> = records
        .into_iter()
        .filter(is_eligible)
        .map(ScrobbleCandidate::new)
        .collect();
    report.eligible = candidates.len();

    candidates.retain(|candidate| options.range.contains(candidate.timestamp));
    report.out_of_range = report.eligible - candidates.len();

    candidates.sort_by_key(|candidate| candidate.record.end_time);
    let before_dedup = candidates.len();
    let mut candidates = deduplicate(candidates);
    report.duplicates = before_dedup - candidates.len();

    candidates.sort_by_key(|candidate| candidate.timestamp);
    if let Some(limit) = options.limit {
        candidates.truncate(limit);
    }
    if let Some(mode) = &options.import_mode {
        redate(&mut candidates, mode.finish_at.resolve(now), mode.gap_seconds);
    }
    report.candidates = candidates.len();

    info!(
        "Loaded {} entries: {} valid, {} eligible, {} out of range, {} duplicates, {} to scrobble",
        report.loaded,
        report.normalized,
        report.eligible,
        report.out_of_range,
        report.duplicates,
        report.candidates
    );
    (candidates, report)
}
