use crate::scrobble::ScrobbleCandidate;

/// Per-request submission limit of `track.scrobble`.
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub include_duration: bool,
    pub send_chosen_by_user: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            include_duration: false,
            send_chosen_by_user: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    /// Index of the first candidate within the full run.
    pub start: usize,
    pub items: &'a [ScrobbleCandidate],
}

impl Batch<'_> {
    /// Offset to persist once this batch is acknowledged.
    pub fn end(&self) -> usize {
        self.start + self.items.len()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.items.last().map(|candidate| candidate.timestamp)
    }

    /// Indexed `track.scrobble` parameters, without auth or signature.
    pub fn params(&self, options: RequestOptions) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(self.items.len() * 6);
        for (index, candidate) in self.items.iter().enumerate() {
            let record = &candidate.record;
            params.push((format!("artist[{index}]"), record.artist.clone()));
            params.push((format!("track[{index}]"), record.track.clone()));
            params.push((format!("timestamp[{index}]"), candidate.timestamp.to_string()));
            if let Some(album) = &record.album {
                params.push((format!("album[{index}]"), album.clone()));
                params.push((format!("albumArtist[{index}]"), record.artist.clone()));
            }
            if options.include_duration {
                let duration = record.ms_played / 1000;
                if duration > 0 {
                    params.push((format!("duration[{index}]"), duration.to_string()));
                }
            }
            if options.send_chosen_by_user {
                let chosen = if record.chosen_by_user { "1" } else { "0" };
                params.push((format!("chosenByUser[{index}]"), chosen.to_string()));
            }
        }
        params
    }
}

/// Splits the candidates after `offset` into consecutive batches of at most
/// `size` items.
pub fn batches(
    candidates: &[ScrobbleCandidate],
    offset: usize,
    size: usize,
) -> impl Iterator<Item = Batch<'_>> {
    let size = size.clamp(1, MAX_BATCH_SIZE);
    let offset = offset.min(candidates.len());
    candidates[offset..]
        .chunks(size)
        .enumerate()
        .map(move |(index, items)| Batch {
            start: offset + index * size,
            items,
        })
}
