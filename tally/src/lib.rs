//! # tally
//!
//! Concurrent per-topic frequency counters with scheduled snapshot, export
//! and reset.
//!
//! tally counts how often each topic under a subscribed topic filter
//! receives a message. Every filter gets a [`TopicCounter`] holding a
//! resettable window and a lifetime total. On configurable cron cadences the
//! window is logged and exported as JSON, pushed into a time-series chart
//! and cleared; the chart is rendered to a self-contained HTML page.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - No lost increments: reset and increment share one lock per counter
//! - Lifetime counts are never cleared
//! - Charts keep every snapshot and show missing topics as gaps, not zeros
//! - No I/O under a lock; exports run on copies, bounded by a timeout
//!
//! ## Quick Start
//!
//! ```rust
//! use tally::{CounterRegistry, Outputs, TopicConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut sensors = TopicConfig::new("sensors/#");
//! sensors.friendly_name = "sensors".to_string();
//!
//! let registry = CounterRegistry::from_topics(&[sensors], &Outputs::memory());
//!
//! // The transport delivers events tagged with the subscription id.
//! registry.dispatch(1, "sensors/temp")?;
//! registry.dispatch(1, "sensors/temp")?;
//! registry.dispatch(1, "sensors/humidity")?;
//!
//! let counter = registry.get(1).ok_or("counter 1 missing")?;
//! counter.reset_and_snapshot();
//!
//! let dataset = counter.chart().materialize_series();
//! assert_eq!(dataset.series("sensors/temp"), Some(&[Some(2)][..]));
//! assert_eq!(counter.lifetime_count("sensors/humidity"), Some(1));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`CounterRegistry`]: Owns the counters and routes events by subscription id
//! - [`TopicCounter`]: Window and lifetime counts for one topic filter
//! - [`ChartAccumulator`]: Snapshots of past windows, materialized as aligned series
//! - [`Scheduler`]: Cron jobs that export, log and reset counters
//!
//! ## Modules
//!
//! - [`config`]: YAML settings and per-topic entries
//! - [`counter`]: The per-topic counter
//! - [`chart`]: Snapshot store and series materialization
//! - [`labels`]: Sorted label set
//! - [`registry`]: Counter registration and dispatch
//! - [`schedule`]: Cadences, counter actions and the job scheduler
//! - [`export`]: Artifact sinks and file naming
//! - [`render`]: HTML chart rendering
//! - [`error`]: Error types

pub mod chart;
pub mod config;
pub mod counter;
pub mod error;
pub mod export;
pub mod labels;
pub mod registry;
pub mod render;
pub mod schedule;

// Re-export primary API types at crate root for convenience.
pub use chart::{ChartAccumulator, SeriesDataset, Snapshot};
pub use config::{Settings, TopicConfig};
pub use counter::{Outputs, TopicCounter};
pub use error::{Result, TallyError};
pub use export::{ArtifactSink, DirectorySink, MemorySink};
pub use registry::{CounterRegistry, SubscriptionId};
pub use render::{ChartRenderer, EchartsRenderer};
pub use schedule::{Cadence, CounterAction, Scheduler};
