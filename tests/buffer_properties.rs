//! Integration tests for SharedBuffer retention and query semantics.

use chrono::{Duration, TimeZone, Utc};
use rec_daq::config::BufferConfig;
use rec_daq::{RangeEnd, RangeStart, Reading, SharedBuffer};
use std::collections::BTreeMap;
use std::sync::Arc;

fn reading(interface: &str, i: i64) -> Reading {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Reading::new(interface, "v", i, t0 + Duration::milliseconds(i))
}

/// Buffer whose streams each hold exactly `records_per_stream` readings of a
/// five-letter interface.
fn buffer_for(records_per_stream: usize, streams: usize) -> SharedBuffer {
    let per_stream = reading("abcde", 0).footprint() * records_per_stream;
    SharedBuffer::new(BufferConfig {
        max_memory_bytes: per_stream * streams,
        max_streams: streams,
        stream_quotas: BTreeMap::new(),
        max_records: None,
    })
}

#[test]
fn test_count_one_returns_most_recent_append() {
    let buffer = buffer_for(50, 2);
    let writer = buffer.claim("alpha").unwrap();

    for i in [3, 17, 42, 5, 99] {
        writer.append(reading("alpha", i));
        let latest = buffer.query("alpha", RangeStart::Earliest, RangeEnd::Latest, Some(1));
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].reading, reading("alpha", i));
    }
}

#[test]
fn test_eviction_keeps_newest_per_interface() {
    let buffer = buffer_for(10, 2);
    let noisy = buffer.claim("noisy").unwrap();
    let quiet = buffer.claim("quiet").unwrap();

    for i in 0..3 {
        quiet.append(reading("quiet", i));
    }
    for i in 0..1000 {
        noisy.append(reading("noisy", i));
    }

    let kept = buffer.query("noisy", RangeStart::Earliest, RangeEnd::Latest, None);
    let values: Vec<_> = kept
        .iter()
        .map(|r| r.reading.value.as_f64().unwrap() as i64)
        .collect();
    assert_eq!(values, (990..1000).collect::<Vec<_>>());

    // The quiet stream is untouched by the noisy one
    assert_eq!(buffer.len("quiet"), 3);
    assert_eq!(buffer.stats("quiet").unwrap().evicted, 0);
    assert_eq!(buffer.stats("noisy").unwrap().evicted, 990);
    assert!(buffer.memory_usage() <= buffer.config().max_memory_bytes);
}

#[test]
fn test_count_ends_at_range_end() {
    let buffer = buffer_for(100, 1);
    let writer = buffer.claim("alpha").unwrap();
    for i in 0..10 {
        writer.append(reading("alpha", i));
    }

    let end = reading("alpha", 6).timestamp;
    let window = buffer.query("alpha", RangeStart::Earliest, RangeEnd::At(end), Some(3));
    let seqs: Vec<_> = window.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, [4, 5, 6]);
}

#[test]
fn test_saved_cursor_and_earliest_differ() {
    let buffer = buffer_for(100, 1);
    let writer = buffer.claim("alpha").unwrap();
    for i in 0..5 {
        writer.append(reading("alpha", i));
    }
    buffer.mark_saved("alpha", 2).unwrap();

    let unsaved = buffer.query("alpha", RangeStart::Unspecified, RangeEnd::Latest, None);
    assert_eq!(unsaved.iter().map(|r| r.seq).collect::<Vec<_>>(), [3, 4]);

    let all = buffer.query("alpha", RangeStart::Earliest, RangeEnd::Latest, None);
    assert_eq!(all.len(), 5);
}

#[test]
fn test_concurrent_queries_see_whole_appends() {
    let buffer = Arc::new(buffer_for(64, 1));
    let writer = buffer.claim("alpha").unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = buffer.query("alpha", RangeStart::Earliest, RangeEnd::Latest, None);
                    // Consecutive sequence numbers: no gap from a half-done append or eviction
                    for pair in snapshot.windows(2) {
                        assert_eq!(pair[1].seq, pair[0].seq + 1);
                    }
                    assert!(snapshot.len() <= 64);
                }
            })
        })
        .collect();

    for i in 0..5000 {
        writer.append(reading("alpha", i));
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(buffer.latest("alpha").unwrap().seq, 4999);
}

#[test]
fn test_single_writer_per_stream() {
    let buffer = buffer_for(10, 2);
    let writer = buffer.claim("alpha").unwrap();
    assert!(buffer.claim("alpha").is_err());
    drop(writer);
    assert!(buffer.claim("alpha").is_ok());
}
