//! Error types for the tally topic counters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all tally operations.
///
/// Per-counter failures (dispatch mismatches, export failures) are recovered
/// by the caller and logged; only [`TallyError::Config`] is meant to abort
/// start-up.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Error while loading settings or building a counter from them.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An event could not be routed to a counter.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Error while writing a statistics or chart artifact.
    #[error("export error: {0}")]
    Export(#[from] ExportError),

    /// Error while registering or running a scheduled job.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Errors that can occur while loading settings or building counters.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read settings file '{}': {source}", path.display())]
    Read {
        /// The settings file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid YAML for the settings layout.
    #[error("failed to parse settings file '{}': {source}", path.display())]
    Parse {
        /// The settings file path.
        path: PathBuf,
        /// The underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A topic entry has neither a friendly name nor a topic filter.
    #[error("topic entry has no usable name: both friendly_name and topic are empty")]
    MissingName,

    /// A cadence string is not a valid cron expression.
    #[error("invalid cadence '{expression}' for '{name}': {source}")]
    InvalidCadence {
        /// The counter the cadence belongs to.
        name: String,
        /// The rejected expression.
        expression: String,
        /// The underlying cron parse error.
        #[source]
        source: cron::error::Error,
    },

    /// A required setting is absent after merging all sources.
    #[error("missing required setting: {field}")]
    MissingSetting {
        /// The setting name.
        field: &'static str,
    },
}

/// Errors that can occur while routing an event to its counter.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No registered counter carries the event's subscription identity.
    #[error("'{label}' arrived with subscription id {subscription_id}, which no counter owns")]
    Unmatched {
        /// The subscription identity carried by the event.
        subscription_id: u32,
        /// The raw topic of the event.
        label: String,
    },
}

/// Errors that can occur while exporting statistics or charts.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The output directory could not be created.
    #[error("failed to create output directory '{}': {source}", path.display())]
    CreateDir {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact file could not be written.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// The artifact path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The counter map could not be serialized.
    #[error("failed to serialize counts for '{name}': {source}")]
    Serialize {
        /// Display name of the counter.
        name: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The chart page could not be rendered.
    #[error("failed to render chart for '{name}': {reason}")]
    Render {
        /// Display name of the counter.
        name: String,
        /// Description of the failure.
        reason: String,
    },

    /// The export did not finish within its time bound.
    #[error("export '{operation}' for '{name}' did not finish within {timeout:?}")]
    TimedOut {
        /// Display name of the counter.
        name: String,
        /// Which export was running.
        operation: &'static str,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The blocking export task panicked or was cancelled.
    #[error("export '{operation}' for '{name}' was aborted: {reason}")]
    Aborted {
        /// Display name of the counter.
        name: String,
        /// Which export was running.
        operation: &'static str,
        /// Description of the failure.
        reason: String,
    },
}

/// Errors that can occur while scheduling jobs.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The scheduler has been shut down and accepts no new jobs.
    #[error("scheduler is shut down; cannot register job '{job}'")]
    ShutDown {
        /// The job that was rejected.
        job: String,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;
