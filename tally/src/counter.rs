//! Per-topic frequency counter.
//!
//! A [`TopicCounter`] belongs to one subscribed topic filter. Every event the
//! transport delivers for that filter increments two maps keyed by the raw
//! topic: the *window* (counts since the last reset) and the *lifetime*
//! (counts since start). Scheduled actions read, export and reset the window
//! while events keep arriving.
//!
//! # Locking
//!
//! Both maps sit behind one mutex, so a reader never sees them out of step.
//! [`reset_and_snapshot`](TopicCounter::reset_and_snapshot) pushes the window
//! into the chart and clears it inside the same critical section: an
//! increment lands either in the pushed snapshot or in the new window, never
//! in both and never in neither.
//!
//! Exports copy what they need under the lock and do all I/O after releasing
//! it.
//!
//! # Example
//!
//! ```rust
//! use tally::config::TopicConfig;
//! use tally::counter::{Outputs, TopicCounter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut entry = TopicConfig::new("zigbee2mqtt/+");
//! entry.exclude = vec!["/set".to_string()];
//! let counter = TopicCounter::from_config(&entry, Outputs::memory())?;
//!
//! counter.increment("zigbee2mqtt/lamp");
//! counter.increment("zigbee2mqtt/lamp/set"); // excluded
//! assert_eq!(counter.window_count("zigbee2mqtt/lamp"), Some(1));
//!
//! counter.reset_and_snapshot();
//! assert_eq!(counter.window_count("zigbee2mqtt/lamp"), None);
//! assert_eq!(counter.lifetime_count("zigbee2mqtt/lamp"), Some(1));
//! assert_eq!(counter.chart().len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;

use crate::chart::ChartAccumulator;
use crate::config::TopicConfig;
use crate::error::{ConfigError, ExportError};
use crate::export::{ArtifactKind, ArtifactSink, DirectorySink, MemorySink, artifact_name};
use crate::render::{ChartRenderer, EchartsRenderer};
use crate::schedule::Cadence;

/// Where a counter sends its artifacts.
#[derive(Debug, Clone)]
pub struct Outputs {
    /// Durable storage for statistics and charts.
    pub sink: Arc<dyn ArtifactSink>,
    /// Chart renderer.
    pub renderer: Arc<dyn ChartRenderer>,
}

impl Outputs {
    /// Creates outputs from a sink and a renderer.
    pub fn new(sink: Arc<dyn ArtifactSink>, renderer: Arc<dyn ChartRenderer>) -> Self {
        Self { sink, renderer }
    }

    /// Files in the configured output directory, charts rendered with ECharts.
    pub fn directory(path: &str) -> Self {
        Self::new(
            Arc::new(DirectorySink::from_setting(path)),
            Arc::new(EchartsRenderer::new()),
        )
    }

    /// In-memory artifacts, charts rendered with ECharts.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemorySink::new()), Arc::new(EchartsRenderer::new()))
    }
}

/// Cadences of a counter's scheduled actions; `None` disables the action.
#[derive(Debug, Clone, Default)]
pub struct Cadences {
    /// Chart export.
    pub chart: Option<Cadence>,
    /// Statistics printout and window export.
    pub stats: Option<Cadence>,
    /// Window reset.
    pub reset: Option<Cadence>,
}

impl Cadences {
    /// Parses the cadences of a topic entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCadence`] for the first expression that
    /// does not parse.
    pub fn from_config(name: &str, entry: &TopicConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            chart: Cadence::parse_optional(name, &entry.chart_cadence)?,
            stats: Cadence::parse_optional(name, &entry.stats_cadence)?,
            reset: Cadence::parse_optional(name, &entry.reset_cadence)?,
        })
    }
}

#[derive(Debug, Default)]
struct Counts {
    window: HashMap<String, u64>,
    lifetime: HashMap<String, u64>,
}

/// Window and lifetime counters for one topic filter.
#[derive(Debug)]
pub struct TopicCounter {
    base_label: String,
    display_name: String,
    exclude: Vec<String>,
    cadences: Cadences,
    counts: Mutex<Counts>,
    chart: ChartAccumulator,
    outputs: Outputs,
}

impl TopicCounter {
    /// Builds a counter from a topic entry.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingName`] if the entry has neither a friendly name
    ///   nor a topic
    /// - [`ConfigError::InvalidCadence`] if a cadence does not parse
    pub fn from_config(entry: &TopicConfig, outputs: Outputs) -> Result<Self, ConfigError> {
        let display_name = entry.display_name()?.to_string();
        let cadences = Cadences::from_config(&display_name, entry)?;

        Ok(Self {
            base_label: entry.topic.clone(),
            display_name,
            exclude: entry.exclude.clone(),
            cadences,
            counts: Mutex::new(Counts {
                window: HashMap::with_capacity(20),
                lifetime: HashMap::with_capacity(20),
            }),
            chart: ChartAccumulator::new(),
            outputs,
        })
    }

    /// The subscribed topic filter.
    pub fn base_label(&self) -> &str {
        &self.base_label
    }

    /// The name used in artifacts and logs.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Substrings that exclude a topic from counting.
    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// The scheduled action cadences.
    pub fn cadences(&self) -> &Cadences {
        &self.cadences
    }

    /// The chart fed by [`reset_and_snapshot`](Self::reset_and_snapshot).
    pub fn chart(&self) -> &ChartAccumulator {
        &self.chart
    }

    /// Returns whether `raw_label` is ignored by this counter.
    pub fn is_excluded(&self, raw_label: &str) -> bool {
        self.exclude.iter().any(|s| raw_label.contains(s.as_str()))
    }

    /// Counts one event for `raw_label`.
    ///
    /// Excluded labels are accepted without touching any state. Always
    /// returns `true`: the event has been handled.
    pub fn increment(&self, raw_label: &str) -> bool {
        if self.is_excluded(raw_label) {
            return true;
        }

        let mut counts = self.counts.lock();
        bump(&mut counts.window, raw_label);
        bump(&mut counts.lifetime, raw_label);
        true
    }

    /// Pushes the current window into the chart and starts a new one.
    ///
    /// Returns the sequence number of the pushed snapshot.
    pub fn reset_and_snapshot(&self) -> u64 {
        let mut counts = self.counts.lock();
        let sequence = self.chart.push(&counts.window);
        let capacity = counts.window.len();
        counts.window = HashMap::with_capacity(capacity);
        sequence
    }

    /// Count of `raw_label` in the current window.
    pub fn window_count(&self, raw_label: &str) -> Option<u64> {
        self.counts.lock().window.get(raw_label).copied()
    }

    /// Count of `raw_label` since start.
    pub fn lifetime_count(&self, raw_label: &str) -> Option<u64> {
        self.counts.lock().lifetime.get(raw_label).copied()
    }

    /// Copy of the current window.
    pub fn window_counts(&self) -> HashMap<String, u64> {
        self.counts.lock().window.clone()
    }

    /// Copy of the lifetime counts.
    pub fn lifetime_counts(&self) -> HashMap<String, u64> {
        self.counts.lock().lifetime.clone()
    }

    /// The current window sorted ascending by count.
    ///
    /// The sort is stable on the count only; labels with equal counts come
    /// out in no particular order.
    pub fn describe_sorted_by_count(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .counts
            .lock()
            .window
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by_key(|(_, count)| *count);
        entries
    }

    /// Logs the current window, lowest count first.
    pub fn log_stats(&self) {
        let entries = self.describe_sorted_by_count();
        tracing::info!("========= BEGIN {} ========", self.display_name);
        for (label, count) in &entries {
            tracing::info!("{count:3}: {label}");
        }
        tracing::info!("========= END ========");
    }

    /// Writes the window, or the lifetime counts, as JSON to the sink.
    ///
    /// Keys are written in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns an [`ExportError`] if serialization or the sink fails. The
    /// counters are unaffected.
    pub fn export_window(&self, include_lifetime: bool) -> Result<PathBuf, ExportError> {
        let (kind, counts): (ArtifactKind, BTreeMap<String, u64>) = {
            let counts = self.counts.lock();
            if include_lifetime {
                (ArtifactKind::Lifetime, sorted_copy(&counts.lifetime))
            } else {
                (ArtifactKind::Window, sorted_copy(&counts.window))
            }
        };

        let payload = serde_json::to_vec(&counts).map_err(|e| ExportError::Serialize {
            name: self.display_name.clone(),
            source: e,
        })?;
        let name = artifact_name(kind, &self.display_name, &Local::now());
        let path = self.outputs.sink.persist(&name, &payload)?;

        tracing::debug!(counter = %self.display_name, %kind, path = %path.display(), "exported counts");
        Ok(path)
    }

    /// Renders the chart and writes it to the sink.
    ///
    /// # Errors
    ///
    /// Returns an [`ExportError`] if rendering or the sink fails.
    pub fn export_chart(&self) -> Result<PathBuf, ExportError> {
        let dataset = self.chart.materialize_series();
        let now = Local::now();
        let subtitle = now.to_rfc3339_opts(SecondsFormat::Secs, false);

        let page = self
            .outputs
            .renderer
            .render(&dataset, &self.display_name, &subtitle)?;
        let name = artifact_name(ArtifactKind::Chart, &self.display_name, &now);
        let path = self.outputs.sink.persist(&name, &page)?;

        tracing::debug!(
            counter = %self.display_name,
            points = dataset.len(),
            path = %path.display(),
            "exported chart"
        );
        Ok(path)
    }
}

fn bump(map: &mut HashMap<String, u64>, label: &str) {
    if let Some(count) = map.get_mut(label) {
        *count += 1;
    } else {
        map.insert(label.to_string(), 1);
    }
}

fn sorted_copy(map: &HashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|(k, v)| (k.clone(), *v)).collect()
}
