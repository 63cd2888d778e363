//! Read-side statistics over a group's chunks.
//!
//! Durations are reported in seconds with microsecond precision. A duration is
//! `None` whenever a timestamp it needs is missing; nothing is estimated.

use std::collections::BTreeMap;

use serde::Serialize;

use chunkflow_core::{Chunk, ChunkId, ChunkStatus, GroupName, SyncResult};

use crate::chunks::ChunkStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkSummary {
    pub id: ChunkId,
    pub status: ChunkStatus,
    pub records: usize,
    pub duration_secs: Option<f64>,
}

impl From<&Chunk> for ChunkSummary {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id,
            status: chunk.status,
            records: chunk.payload.len(),
            duration_secs: chunk.duration_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    pub group: GroupName,
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    /// Chunk count per status, every status listed.
    pub by_status: BTreeMap<String, usize>,
    pub average_duration_secs: Option<f64>,
    pub min_duration_secs: Option<f64>,
    pub max_duration_secs: Option<f64>,
    /// `max(end) - min(start)` over the group; `None` unless every chunk has both.
    pub group_duration_secs: Option<f64>,
    pub failed_chunks: Vec<ChunkSummary>,
    pub fastest: Option<ChunkSummary>,
    pub slowest: Option<ChunkSummary>,
}

impl GroupStats {
    pub fn from_chunks(group: GroupName, chunks: &[Chunk]) -> Self {
        let mut by_status: BTreeMap<String, usize> =
            ChunkStatus::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect();
        for chunk in chunks {
            *by_status.entry(chunk.status.as_str().to_string()).or_default() += 1;
        }

        let timed: Vec<(&Chunk, f64)> = chunks
            .iter()
            .filter_map(|chunk| chunk.duration_secs().map(|secs| (chunk, secs)))
            .collect();
        let fastest = timed
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(chunk, _)| ChunkSummary::from(*chunk));
        let slowest = timed
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(chunk, _)| ChunkSummary::from(*chunk));
        let average_duration_secs = if timed.is_empty() {
            None
        } else {
            Some(round_micros(
                timed.iter().map(|(_, secs)| secs).sum::<f64>() / timed.len() as f64,
            ))
        };

        Self {
            total: chunks.len(),
            finished: count(chunks, ChunkStatus::Finished),
            failed: count(chunks, ChunkStatus::Failed),
            by_status,
            average_duration_secs,
            min_duration_secs: fastest.as_ref().and_then(|c| c.duration_secs),
            max_duration_secs: slowest.as_ref().and_then(|c| c.duration_secs),
            group_duration_secs: group_duration(chunks),
            failed_chunks: chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Failed)
                .map(ChunkSummary::from)
                .collect(),
            fastest,
            slowest,
            group,
        }
    }

    pub fn to_json(&self) -> SyncResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn count(chunks: &[Chunk], status: ChunkStatus) -> usize {
    chunks.iter().filter(|c| c.status == status).count()
}

fn group_duration(chunks: &[Chunk]) -> Option<f64> {
    if chunks.is_empty() {
        return None;
    }
    let mut first_start = None;
    let mut last_end = None;
    for chunk in chunks {
        let (start, end) = (chunk.start?, chunk.end?);
        first_start = Some(first_start.map_or(start, |s: chrono::DateTime<chrono::Utc>| s.min(start)));
        last_end = Some(last_end.map_or(end, |e: chrono::DateTime<chrono::Utc>| e.max(end)));
    }
    let micros = (last_end? - first_start?).num_microseconds()?;
    Some(micros as f64 / 1_000_000.0)
}

fn round_micros(secs: f64) -> f64 {
    (secs * 1_000_000.0).round() / 1_000_000.0
}

/// Queries over the chunk store.
#[derive(Clone)]
pub struct StatsAggregator {
    chunks: ChunkStore,
}

impl StatsAggregator {
    pub fn new(chunks: ChunkStore) -> Self {
        Self { chunks }
    }

    pub fn group_stats(&self, group: &GroupName) -> SyncResult<GroupStats> {
        let chunks = self.chunks.list_group(group)?;
        Ok(GroupStats::from_chunks(group.clone(), &chunks))
    }

    /// Duration of one chunk; `None` until it has both timestamps.
    pub fn chunk_duration(&self, id: ChunkId) -> SyncResult<Option<f64>> {
        Ok(self.chunks.get(id)?.duration_secs())
    }

    pub fn failed_chunks(&self, group: &GroupName) -> SyncResult<Vec<ChunkSummary>> {
        Ok(self.group_stats(group)?.failed_chunks)
    }

    pub fn fastest(&self, group: &GroupName) -> SyncResult<Option<ChunkSummary>> {
        Ok(self.group_stats(group)?.fastest)
    }

    pub fn slowest(&self, group: &GroupName) -> SyncResult<Option<ChunkSummary>> {
        Ok(self.group_stats(group)?.slowest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryChunkPersistence;
    use chunkflow_core::{ChunkPayload, JobId, ManualClock, SyncName};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        stats: StatsAggregator,
        chunks: ChunkStore,
        clock: Arc<ManualClock>,
        group: GroupName,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let chunks = ChunkStore::new(InMemoryChunkPersistence::arc(), clock.clone());
        Fixture {
            stats: StatsAggregator::new(chunks.clone()),
            chunks,
            clock,
            group: GroupName::new("orders_1").unwrap(),
        }
    }

    impl Fixture {
        fn chunk(&self) -> ChunkId {
            let payload = ChunkPayload::encode(&[json!({"n": 1})]).unwrap();
            self.chunks
                .create(&SyncName::new("orders").unwrap(), &self.group, payload)
                .unwrap()
                .id
        }

        /// Start a chunk, let `millis` pass, then finish or fail it.
        fn run(&self, millis: u64, fail: bool) -> ChunkId {
            let id = self.chunk();
            self.chunks.mark_started(id, JobId::new()).unwrap();
            self.chunks.mark_running(id).unwrap();
            self.clock.advance(Duration::from_millis(millis));
            if fail {
                self.chunks.mark_failed(id).unwrap();
            } else {
                self.chunks.mark_finished(id).unwrap();
            }
            id
        }
    }

    #[test]
    fn summarises_a_finished_group() {
        let f = fixture();
        let fast = f.run(500, false);
        let slow = f.run(2_000, false);
        let failed = f.run(1_000, true);

        let stats = f.stats.group_stats(&f.group).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_status["scheduled"], 0);
        assert_eq!(stats.min_duration_secs, Some(0.5));
        assert_eq!(stats.max_duration_secs, Some(2.0));
        assert_eq!(stats.average_duration_secs, Some(round_micros(3.5 / 3.0)));
        assert_eq!(stats.group_duration_secs, Some(3.5));
        assert_eq!(stats.fastest.unwrap().id, fast);
        assert_eq!(stats.slowest.unwrap().id, slow);
        assert_eq!(stats.failed_chunks.len(), 1);
        assert_eq!(stats.failed_chunks[0].id, failed);
        assert_eq!(f.stats.chunk_duration(slow).unwrap(), Some(2.0));
    }

    #[test]
    fn missing_timestamps_yield_no_duration() {
        let f = fixture();
        f.run(1_000, false);
        let pending = f.chunk();

        let stats = f.stats.group_stats(&f.group).unwrap();
        assert_eq!(stats.group_duration_secs, None);
        assert_eq!(f.stats.chunk_duration(pending).unwrap(), None);
        // The finished chunk still reports its own duration.
        assert_eq!(stats.max_duration_secs, Some(1.0));
    }

    #[test]
    fn empty_group_has_no_durations() {
        let f = fixture();
        let stats = f.stats.group_stats(&f.group).unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_duration_secs, None);
        assert!(f.stats.fastest(&f.group).unwrap().is_none());
    }

    #[test]
    fn serializes_to_json() {
        let f = fixture();
        f.run(250, false);
        let json = f.stats.group_stats(&f.group).unwrap().to_json().unwrap();
        assert_eq!(json["group"], "orders_1");
        assert_eq!(json["finished"], 1);
        assert_eq!(json["fastest"]["duration_secs"], 0.25);
    }
}
