//! Bounded, multi-stream time series store.
//!
//! Each interface (sensor or controller) owns one [`Stream`] and is the only
//! writer to it, through the [`StreamWriter`] handed out by
//! [`SharedBuffer::claim`]. Any number of consumers may query concurrently.
//!
//! # Memory bound
//!
//! Every stream gets a byte quota when it is created: the explicit
//! `stream_quotas[interface]` from configuration, or an equal share
//! `max_memory_bytes / max_streams`. Creation fails with
//! [`DaqError::StreamLimit`] if the quotas of all streams would exceed the
//! total budget, so the budget holds without any cross-stream eviction. When a
//! stream is over its quota the oldest readings are dropped first.
//!
//! # Locking
//!
//! The interface map is behind an `RwLock` that is only held long enough to
//! look up (or insert) a stream. Each stream has its own mutex, so unrelated
//! interfaces never contend. Readings are stored behind `Arc`, so a query
//! only copies pointers while it holds the stream mutex and never observes a
//! half-finished append.

use crate::config::BufferConfig;
use crate::core::Reading;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lower bound of a [`SharedBuffer::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStart {
    /// Start after the saved cursor, or at the first retained reading if none was saved.
    Unspecified,
    /// Start at the first retained reading.
    Earliest,
    /// Start at the first reading with `timestamp >= t`.
    At(DateTime<Utc>),
}

/// Upper bound of a [`SharedBuffer::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    /// Up to the most recent reading.
    Latest,
    /// Up to the last reading with `timestamp <= t`.
    At(DateTime<Utc>),
}

/// A reading as retained by a stream, with its per-stream sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    /// Monotonic per-stream sequence number, starting at 0.
    pub seq: u64,
    /// The reading.
    pub reading: Reading,
}

struct Entry {
    stored: Arc<StoredReading>,
    footprint: usize,
}

#[derive(Default)]
struct StreamData {
    entries: VecDeque<Entry>,
    bytes: usize,
    next_seq: u64,
    saved: Option<u64>,
    evicted: u64,
}

/// One interface's retained history.
struct Stream {
    interface: String,
    quota: usize,
    max_records: Option<usize>,
    data: Mutex<StreamData>,
    claimed: AtomicBool,
}

impl Stream {
    fn append(&self, reading: Reading) -> bool {
        let footprint = reading.footprint();
        if footprint > self.quota {
            warn!(
                interface = %self.interface,
                footprint,
                quota = self.quota,
                "Reading larger than stream quota, dropped"
            );
            return false;
        }

        let mut data = self.data.lock();
        let seq = data.next_seq;
        data.next_seq += 1;
        data.bytes += footprint;
        data.entries.push_back(Entry {
            stored: Arc::new(StoredReading { seq, reading }),
            footprint,
        });

        while data.bytes > self.quota
            || self
                .max_records
                .is_some_and(|max| data.entries.len() > max)
        {
            let Some(oldest) = data.entries.pop_front() else {
                break;
            };
            data.bytes -= oldest.footprint;
            data.evicted += 1;
        }
        true
    }

    fn range(
        &self,
        start: RangeStart,
        end: RangeEnd,
        count: Option<usize>,
        max_len: Option<usize>,
    ) -> Vec<Arc<StoredReading>> {
        let data = self.data.lock();
        let entries = &data.entries;

        // Entries are in append order, which is time order for one writer
        let end_idx = match end {
            RangeEnd::Latest => entries.len(),
            RangeEnd::At(t) => entries.partition_point(|e| e.stored.reading.timestamp <= t),
        };

        let start_idx = match (count, start) {
            (Some(n), _) => end_idx.saturating_sub(n),
            (None, RangeStart::Earliest) => 0,
            (None, RangeStart::At(t)) => {
                entries.partition_point(|e| e.stored.reading.timestamp < t)
            }
            (None, RangeStart::Unspecified) => match data.saved {
                Some(saved) => entries.partition_point(|e| e.stored.seq <= saved),
                None => 0,
            },
        };

        let selected = end_idx.saturating_sub(start_idx);
        if selected == 0 || max_len == Some(0) {
            return Vec::new();
        }
        let step = match max_len {
            Some(max) if selected > max => selected / max,
            _ => 1,
        };
        entries
            .range(start_idx..end_idx)
            .step_by(step)
            .map(|e| Arc::clone(&e.stored))
            .collect()
    }
}

/// Exclusive append handle for one stream.
///
/// Dropping the writer releases the stream so it can be claimed again.
pub struct StreamWriter {
    stream: Arc<Stream>,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("interface", &self.stream.interface)
            .finish()
    }
}

impl StreamWriter {
    /// Interface this writer appends to.
    pub fn interface(&self) -> &str {
        &self.stream.interface
    }

    /// Appends a reading, evicting the oldest ones if the stream is over quota.
    ///
    /// Returns `false` only if the reading alone is larger than the quota.
    pub fn append(&self, reading: Reading) -> bool {
        self.stream.append(reading)
    }

    /// Appends several readings in order.
    pub fn extend(&self, readings: impl IntoIterator<Item = Reading>) {
        for reading in readings {
            self.stream.append(reading);
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.stream.claimed.store(false, Ordering::Release);
    }
}

/// Per-stream statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Interface id.
    pub interface: String,
    /// Retained readings.
    pub len: usize,
    /// Bytes accounted to retained readings.
    pub bytes: usize,
    /// Byte quota.
    pub quota: usize,
    /// Readings dropped by eviction so far.
    pub evicted: u64,
}

/// Central store shared by all sensors, controllers and consumers.
pub struct SharedBuffer {
    config: BufferConfig,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Buffer configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Creates (or re-acquires) the stream for `interface` and returns its only writer.
    ///
    /// Fails with [`DaqError::StreamOwned`] while another writer is alive and
    /// with [`DaqError::StreamLimit`] if the stream's quota does not fit in
    /// the remaining budget.
    pub fn claim(&self, interface: &str) -> AppResult<StreamWriter> {
        let mut streams = self.streams.write();

        if let Some(stream) = streams.get(interface) {
            if stream.claimed.swap(true, Ordering::AcqRel) {
                return Err(DaqError::StreamOwned(interface.to_string()));
            }
            return Ok(StreamWriter {
                stream: Arc::clone(stream),
            });
        }

        let quota = self.config.quota_for(interface);
        if quota == 0 {
            return Err(DaqError::StreamLimit {
                interface: interface.to_string(),
                reason: "stream quota is zero".into(),
            });
        }
        let reserved: usize = streams.values().map(|s| s.quota).sum();
        if reserved + quota > self.config.max_memory_bytes {
            return Err(DaqError::StreamLimit {
                interface: interface.to_string(),
                reason: format!(
                    "quota of {} bytes exceeds remaining budget of {} bytes",
                    quota,
                    self.config.max_memory_bytes.saturating_sub(reserved)
                ),
            });
        }

        let stream = Arc::new(Stream {
            interface: interface.to_string(),
            quota,
            max_records: self.config.max_records,
            data: Mutex::new(StreamData::default()),
            claimed: AtomicBool::new(true),
        });
        streams.insert(interface.to_string(), Arc::clone(&stream));
        debug!(interface, quota, "Stream created");
        Ok(StreamWriter { stream })
    }

    fn stream(&self, interface: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(interface).cloned()
    }

    /// Range read over one stream; an unknown interface yields an empty result.
    ///
    /// `count` takes precedence over `start` and selects the last `count`
    /// readings ending at `end`.
    pub fn query(
        &self,
        interface: &str,
        start: RangeStart,
        end: RangeEnd,
        count: Option<usize>,
    ) -> Vec<Arc<StoredReading>> {
        self.stream(interface)
            .map(|stream| stream.range(start, end, count, None))
            .unwrap_or_default()
    }

    /// Like [`query`](Self::query), thinned out for display.
    ///
    /// When the range holds more than `max_len` readings, every
    /// `len / max_len`-th one is returned, starting with the first. The result
    /// can therefore be slightly longer than `max_len`.
    pub fn query_decimated(
        &self,
        interface: &str,
        start: RangeStart,
        end: RangeEnd,
        count: Option<usize>,
        max_len: usize,
    ) -> Vec<Arc<StoredReading>> {
        self.stream(interface)
            .map(|stream| stream.range(start, end, count, Some(max_len)))
            .unwrap_or_default()
    }

    /// Most recent reading of a stream.
    pub fn latest(&self, interface: &str) -> Option<Arc<StoredReading>> {
        self.query(interface, RangeStart::Earliest, RangeEnd::Latest, Some(1))
            .pop()
    }

    /// Moves the saved cursor; `RangeStart::Unspecified` queries begin after `seq`.
    pub fn mark_saved(&self, interface: &str, seq: u64) -> AppResult<()> {
        let stream = self
            .stream(interface)
            .ok_or_else(|| DaqError::UnknownInterface(interface.to_string()))?;
        stream.data.lock().saved = Some(seq);
        Ok(())
    }

    /// Drops all retained readings of a stream and clears its saved cursor.
    ///
    /// Sequence numbers keep counting up.
    pub fn reset(&self, interface: &str) -> AppResult<()> {
        let stream = self
            .stream(interface)
            .ok_or_else(|| DaqError::UnknownInterface(interface.to_string()))?;
        let mut data = stream.data.lock();
        data.entries.clear();
        data.bytes = 0;
        data.saved = None;
        Ok(())
    }

    /// All known interfaces, sorted.
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of retained readings in a stream (0 if unknown).
    pub fn len(&self, interface: &str) -> usize {
        self.stream(interface)
            .map(|s| s.data.lock().entries.len())
            .unwrap_or(0)
    }

    /// True if no stream holds any reading.
    pub fn is_empty(&self) -> bool {
        self.memory_usage() == 0
    }

    /// Bytes accounted across all streams.
    pub fn memory_usage(&self) -> usize {
        let streams: Vec<Arc<Stream>> = self.streams.read().values().cloned().collect();
        streams.iter().map(|s| s.data.lock().bytes).sum()
    }

    /// Statistics for one stream.
    pub fn stats(&self, interface: &str) -> Option<StreamStats> {
        self.stream(interface).map(|stream| {
            let data = stream.data.lock();
            StreamStats {
                interface: stream.interface.clone(),
                len: data.entries.len(),
                bytes: data.bytes,
                quota: stream.quota,
                evicted: data.evicted,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn buffer(max_memory_bytes: usize, max_streams: usize) -> SharedBuffer {
        SharedBuffer::new(BufferConfig {
            max_memory_bytes,
            max_streams,
            stream_quotas: BTreeMap::new(),
            max_records: None,
        })
    }

    fn reading(interface: &str, value: i64, ts: DateTime<Utc>) -> Reading {
        Reading::new(interface, "v", value, ts)
    }

    #[test]
    fn test_count_overrides_start() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        let t0 = Utc::now();
        for i in 0..5 {
            writer.append(reading("a", i, t0 + Duration::seconds(i)));
        }

        let result = buffer.query("a", RangeStart::At(t0), RangeEnd::Latest, Some(2));
        let values: Vec<u64> = result.iter().map(|r| r.seq).collect();
        assert_eq!(values, vec![3, 4]);
    }

    #[test]
    fn test_time_range() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        let t0 = Utc::now();
        for i in 0..5 {
            writer.append(reading("a", i, t0 + Duration::seconds(i)));
        }

        let result = buffer.query(
            "a",
            RangeStart::At(t0 + Duration::seconds(1)),
            RangeEnd::At(t0 + Duration::seconds(3)),
            None,
        );
        let seqs: Vec<u64> = result.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let result = buffer.query(
            "a",
            RangeStart::Earliest,
            RangeEnd::At(t0 + Duration::seconds(1)),
            Some(5),
        );
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_decimated_query() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        let t0 = Utc::now();
        for i in 0..10 {
            writer.append(reading("a", i, t0 + Duration::seconds(i)));
        }

        let seqs = |max_len| -> Vec<u64> {
            buffer
                .query_decimated("a", RangeStart::Earliest, RangeEnd::Latest, None, max_len)
                .iter()
                .map(|r| r.seq)
                .collect()
        };
        assert_eq!(seqs(5), vec![0, 2, 4, 6, 8]);
        assert_eq!(seqs(3), vec![0, 3, 6, 9]);
        assert_eq!(seqs(20).len(), 10);
        assert!(seqs(0).is_empty());

        let tail: Vec<u64> = buffer
            .query_decimated("a", RangeStart::Earliest, RangeEnd::Latest, Some(4), 2)
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(tail, vec![6, 8]);
    }

    #[test]
    fn test_queries_share_stored_readings() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        writer.append(reading("a", 1, Utc::now()));

        let first = buffer.latest("a").unwrap();
        let second = buffer.latest("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unspecified_start_follows_saved_cursor() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        let now = Utc::now();
        for i in 0..4 {
            writer.append(reading("a", i, now));
        }

        assert_eq!(
            buffer
                .query("a", RangeStart::Unspecified, RangeEnd::Latest, None)
                .len(),
            4
        );

        buffer.mark_saved("a", 1).unwrap();
        let seqs: Vec<u64> = buffer
            .query("a", RangeStart::Unspecified, RangeEnd::Latest, None)
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(seqs, vec![2, 3]);

        // Earliest ignores the cursor
        assert_eq!(
            buffer
                .query("a", RangeStart::Earliest, RangeEnd::Latest, None)
                .len(),
            4
        );
    }

    #[test]
    fn test_second_writer_rejected_until_first_dropped() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        assert!(matches!(buffer.claim("a"), Err(DaqError::StreamOwned(_))));
        drop(writer);
        assert!(buffer.claim("a").is_ok());
    }

    #[test]
    fn test_stream_limit() {
        let buffer = buffer(1_000, 2);
        let _a = buffer.claim("a").unwrap();
        let _b = buffer.claim("b").unwrap();
        assert!(matches!(
            buffer.claim("c"),
            Err(DaqError::StreamLimit { .. })
        ));
    }

    #[test]
    fn test_explicit_quota() {
        let mut quotas = BTreeMap::new();
        quotas.insert("big".to_string(), 900);
        let buffer = SharedBuffer::new(BufferConfig {
            max_memory_bytes: 1_000,
            max_streams: 10,
            stream_quotas: quotas,
            max_records: None,
        });
        let _big = buffer.claim("big").unwrap();
        let _small = buffer.claim("small").unwrap();
        assert_eq!(buffer.stats("big").unwrap().quota, 900);
        assert_eq!(buffer.stats("small").unwrap().quota, 100);
        assert!(buffer.claim("another").is_err());
    }

    #[test]
    fn test_max_records() {
        let buffer = SharedBuffer::new(BufferConfig {
            max_memory_bytes: 1_000_000,
            max_streams: 1,
            stream_quotas: BTreeMap::new(),
            max_records: Some(3),
        });
        let writer = buffer.claim("a").unwrap();
        let now = Utc::now();
        for i in 0..10 {
            writer.append(reading("a", i, now));
        }
        assert_eq!(buffer.len("a"), 3);
        assert_eq!(buffer.latest("a").unwrap().seq, 9);
        assert_eq!(buffer.stats("a").unwrap().evicted, 7);
    }

    #[test]
    fn test_reset_keeps_sequence() {
        let buffer = buffer(1_000_000, 4);
        let writer = buffer.claim("a").unwrap();
        let now = Utc::now();
        writer.append(reading("a", 1, now));
        buffer.reset("a").unwrap();
        assert_eq!(buffer.len("a"), 0);
        assert_eq!(buffer.memory_usage(), 0);

        writer.append(reading("a", 2, now));
        assert_eq!(buffer.latest("a").unwrap().seq, 1);
    }

    #[test]
    fn test_unknown_interface() {
        let buffer = buffer(1_000_000, 4);
        assert!(buffer
            .query("nope", RangeStart::Earliest, RangeEnd::Latest, None)
            .is_empty());
        assert!(buffer.latest("nope").is_none());
        assert!(matches!(
            buffer.mark_saved("nope", 0),
            Err(DaqError::UnknownInterface(_))
        ));
    }

    #[test]
    fn test_oversized_reading_dropped() {
        let buffer = buffer(200, 2);
        let writer = buffer.claim("a").unwrap();
        let huge = Reading::new("a", "v", crate::core::ReadingValue::Text("x".repeat(500)), Utc::now());
        assert!(!writer.append(huge));
        assert_eq!(buffer.len("a"), 0);
    }
}
