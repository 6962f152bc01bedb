//! Time-series accumulator behind the per-counter charts.
//!
//! Every reset of a [`TopicCounter`](crate::counter::TopicCounter) pushes the
//! window that is about to be cleared into its [`ChartAccumulator`]. The
//! accumulator keeps those snapshots for the lifetime of the process and can
//! turn them into a [`SeriesDataset`]: one row of timestamps plus one column of
//! values per label, aligned on the timestamps.
//!
//! # Gaps
//!
//! Snapshots are sparse. A topic that had no events in a window is simply
//! missing from that window's map, and a topic that appeared later is missing
//! from all earlier maps. Materialization reports those positions as `None`,
//! never as `0`, so a renderer can draw a gap instead of a dip.
//!
//! ```rust
//! use std::collections::HashMap;
//! use tally::chart::ChartAccumulator;
//!
//! let chart = ChartAccumulator::new();
//! chart.push(&HashMap::from([("a".to_string(), 1)]));
//! chart.push(&HashMap::from([("b".to_string(), 2)]));
//!
//! let dataset = chart.materialize_series();
//! assert_eq!(dataset.series("a"), Some(&[Some(1), None][..]));
//! assert_eq!(dataset.series("b"), Some(&[None, Some(2)][..]));
//! ```
//!
//! # Ordering
//!
//! Snapshots are keyed by a sequence number assigned at push time, with the
//! wall-clock time stored next to the counts. Two pushes inside one clock tick
//! therefore both survive, and materialization is always in push order.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::labels::LabelSet;

/// A copy of a counter window captured at push time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Push order, starting at 0.
    pub sequence: u64,
    /// Wall-clock time of the push.
    pub taken_at: DateTime<Utc>,
    /// Label → count, as it was when pushed.
    pub counts: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct ChartState {
    snapshots: BTreeMap<u64, Snapshot>,
    known_labels: LabelSet,
    next_sequence: u64,
}

/// Ordered store of window snapshots with label tracking.
///
/// # Thread Safety
///
/// The accumulator has its own lock, taken only inside [`push`](Self::push)
/// and the read methods. A counter pushes while holding its own lock, so the
/// lock order is always counter → chart.
#[derive(Debug, Default)]
pub struct ChartAccumulator {
    state: Mutex<ChartState>,
}

impl ChartAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `window` into a new snapshot stamped with the current time.
    ///
    /// Returns the sequence number of the snapshot.
    pub fn push(&self, window: &HashMap<String, u64>) -> u64 {
        self.push_at(window, Utc::now())
    }

    /// Copies `window` into a new snapshot stamped with `taken_at`.
    ///
    /// Ordering follows push order, not `taken_at`.
    pub fn push_at(&self, window: &HashMap<String, u64>, taken_at: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        state.known_labels.extend(window.keys().map(String::as_str));
        state.snapshots.insert(
            sequence,
            Snapshot {
                sequence,
                taken_at,
                counts: window.clone(),
            },
        );
        sequence
    }

    /// Builds the aligned series for every label ever pushed.
    ///
    /// Labels come out in lexicographic order and positions in push order.
    /// A label missing from a snapshot yields `None` at that position.
    pub fn materialize_series(&self) -> SeriesDataset {
        let state = self.state.lock();

        let timestamps = state.snapshots.values().map(|s| s.taken_at).collect();
        let series = state
            .known_labels
            .iter()
            .map(|label| {
                let values = state
                    .snapshots
                    .values()
                    .map(|s| s.counts.get(label).copied())
                    .collect();
                (label.to_string(), values)
            })
            .collect();

        SeriesDataset { timestamps, series }
    }

    /// Returns a copy of the snapshot with the given sequence number.
    pub fn snapshot(&self, sequence: u64) -> Option<Snapshot> {
        self.state.lock().snapshots.get(&sequence).cloned()
    }

    /// Returns copies of all snapshots in push order.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.state.lock().snapshots.values().cloned().collect()
    }

    /// Returns every label seen so far, sorted.
    pub fn known_labels(&self) -> Vec<String> {
        self.state.lock().known_labels.to_sorted_vec()
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Returns `true` if nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.state.lock().snapshots.is_empty()
    }
}

/// Aligned multi-series view over a chart's snapshots.
///
/// `timestamps[i]` is the push time of the i-th snapshot; every vector in
/// `series` has the same length as `timestamps`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeriesDataset {
    /// Push times in chronological (push) order.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Label → value per timestamp, `None` where the label was absent.
    pub series: BTreeMap<String, Vec<Option<u64>>>,
}

impl SeriesDataset {
    /// Returns the values for one label.
    pub fn series(&self, label: &str) -> Option<&[Option<u64>]> {
        self.series.get(label).map(Vec::as_slice)
    }

    /// Iterates the labels in lexicographic order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Number of points per series.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns `true` if there are no points.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}
