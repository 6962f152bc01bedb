//! Cron-driven jobs on top of the tokio runtime.
//!
//! Each counter can have up to three jobs, one per [`CounterAction`]. A job is
//! a task that sleeps until the next tick of its [`Cadence`], runs its action
//! off the runtime with a time bound, logs the next run and goes back to
//! sleep. All jobs share one [`CancellationToken`]; [`Scheduler::shutdown`]
//! cancels it and waits for in-flight firings to finish.
//!
//! Cadences are six-field cron expressions with seconds first:
//!
//! ```text
//! sec  min  hour  day-of-month  month  day-of-week
//! 0    */5  *     *             *      *            <- every five minutes
//! ```
//!
//! Jobs match the expression against the local wall clock, so `0 0 3 * * *`
//! fires at 03:00 host time.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::counter::TopicCounter;
use crate::error::{ConfigError, ExportError, ScheduleError};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct Cadence {
    expression: String,
    schedule: cron::Schedule,
}

impl Cadence {
    /// Parses a six-field cron expression.
    ///
    /// # Errors
    ///
    /// Returns the cron parse error if `expression` is not valid.
    pub fn parse(expression: &str) -> Result<Self, cron::error::Error> {
        let expression = expression.trim();
        Ok(Self {
            expression: expression.to_string(),
            schedule: cron::Schedule::from_str(expression)?,
        })
    }

    /// Parses the cadence of counter `name`; an empty expression yields
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCadence`] if the expression is not empty
    /// and not valid.
    pub fn parse_optional(name: &str, expression: &str) -> Result<Option<Self>, ConfigError> {
        if expression.trim().is_empty() {
            return Ok(None);
        }
        Self::parse(expression)
            .map(Some)
            .map_err(|e| ConfigError::InvalidCadence {
                name: name.to_string(),
                expression: expression.to_string(),
                source: e,
            })
    }

    /// The first tick strictly after `after`.
    ///
    /// Fields are matched against the wall clock of `after`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// The expression as configured.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// What a scheduled job does to its counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterAction {
    /// Render and persist the chart.
    ExportChart,
    /// Log the window and persist it as JSON.
    ExportStats,
    /// Snapshot the window into the chart and clear it.
    Reset,
}

impl CounterAction {
    /// Short name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            CounterAction::ExportChart => "chart",
            CounterAction::ExportStats => "stats",
            CounterAction::Reset => "reset",
        }
    }

    /// Runs the action against `counter`, blocking the calling thread.
    ///
    /// A reset on a counter without a stats cadence logs the window first,
    /// so its numbers are not lost unseen.
    ///
    /// # Errors
    ///
    /// Returns the [`ExportError`] of a failed export. Resets never fail.
    pub fn run(self, counter: &TopicCounter) -> Result<(), ExportError> {
        match self {
            CounterAction::ExportChart => counter.export_chart().map(drop),
            CounterAction::ExportStats => {
                counter.log_stats();
                counter.export_window(false).map(drop)
            }
            CounterAction::Reset => {
                if counter.cadences().stats.is_none() {
                    counter.log_stats();
                }
                counter.reset_and_snapshot();
                Ok(())
            }
        }
    }
}

impl fmt::Display for CounterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs blocking export work on the blocking pool, giving up after `timeout`.
///
/// The blocking task keeps running after a timeout; only the caller stops
/// waiting for it.
///
/// # Errors
///
/// - [`ExportError::TimedOut`] if `work` does not finish within `timeout`
/// - [`ExportError::Aborted`] if `work` panics
/// - whatever `work` itself returns
pub async fn run_bounded<T, F>(
    name: &str,
    operation: &'static str,
    timeout: Duration,
    work: F,
) -> Result<T, ExportError>
where
    F: FnOnce() -> Result<T, ExportError> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(ExportError::Aborted {
            name: name.to_string(),
            operation,
            reason: join_error.to_string(),
        }),
        Err(_) => Err(ExportError::TimedOut {
            name: name.to_string(),
            operation,
            timeout,
        }),
    }
}

/// Owns every scheduled job.
///
/// Cloning yields another handle to the same set of jobs.
#[derive(Debug, Clone)]
pub struct Scheduler {
    cancel: CancellationToken,
    tracker: TaskTracker,
    export_timeout: Duration,
}

impl Scheduler {
    /// Creates a scheduler whose firings are bounded by `export_timeout`.
    pub fn new(export_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            export_timeout,
        }
    }

    /// Bound applied to every firing.
    pub fn export_timeout(&self) -> Duration {
        self.export_timeout
    }

    /// Number of jobs still running.
    pub fn job_count(&self) -> usize {
        self.tracker.len()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Schedules every action of `counter` that has a cadence.
    ///
    /// Returns the number of jobs registered. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::ShutDown`] after shutdown.
    pub fn schedule_counter(&self, counter: &Arc<TopicCounter>) -> Result<usize, ScheduleError> {
        let cadences = counter.cadences().clone();
        let jobs = [
            (CounterAction::ExportChart, cadences.chart),
            (CounterAction::ExportStats, cadences.stats),
            (CounterAction::Reset, cadences.reset),
        ];

        let mut registered = 0;
        for (action, cadence) in jobs {
            if let Some(cadence) = cadence {
                self.schedule(Arc::clone(counter), action, cadence)?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Runs `action` on `counter` at every tick of `cadence`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::ShutDown`] after shutdown.
    pub fn schedule(
        &self,
        counter: Arc<TopicCounter>,
        action: CounterAction,
        cadence: Cadence,
    ) -> Result<(), ScheduleError> {
        if self.is_shut_down() {
            return Err(ScheduleError::ShutDown {
                job: format!("{} {action}", counter.display_name()),
            });
        }

        tracing::info!(
            counter = counter.display_name(),
            job = %action,
            cadence = %cadence,
            "registered job"
        );
        self.tracker.spawn(run_cron_job(
            counter,
            action,
            cadence,
            self.cancel.clone(),
            self.export_timeout,
        ));
        Ok(())
    }

    /// Calls `job` every `period`, first after one full period.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::ShutDown`] after shutdown.
    pub fn schedule_every<F, Fut>(
        &self,
        name: impl Into<String>,
        period: Duration,
        mut job: F,
    ) -> Result<(), ScheduleError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shut_down() {
            return Err(ScheduleError::ShutDown { job: name });
        }

        tracing::info!(job = %name, ?period, "registered periodic job");
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                tracing::debug!(job = %name, "running periodic job");
                job().await;
            }
        });
        Ok(())
    }

    /// Stops all jobs. Firings already running are allowed to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("scheduler stopped");
    }
}

async fn run_cron_job(
    counter: Arc<TopicCounter>,
    action: CounterAction,
    cadence: Cadence,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let name = counter.display_name().to_string();
    // Last tick served; the next one must be strictly later.
    let mut last = Local::now();

    loop {
        let now = Local::now();
        let Some(next) = cadence.next_after(&last.max(now)) else {
            tracing::info!(counter = %name, job = %action, "cadence has no further runs");
            break;
        };
        tracing::info!(
            counter = %name,
            job = %action,
            next_run = %next.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
            "next run"
        );

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        last = next;

        let target = Arc::clone(&counter);
        match run_bounded(&name, action.as_str(), timeout, move || action.run(&target)).await {
            Ok(()) => tracing::debug!(counter = %name, job = %action, "job finished"),
            Err(e) => tracing::error!(counter = %name, job = %action, "job failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike, Utc};

    use crate::config::TopicConfig;
    use crate::counter::Outputs;

    #[test]
    fn test_parse_cadence() {
        let cadence = Cadence::parse("0 */5 * * * *").unwrap();
        assert_eq!(cadence.expression(), "0 */5 * * * *");

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 30).unwrap();
        let next = cadence.next_after(&at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_next_is_strictly_after() {
        let cadence = Cadence::parse("0 * * * * *").unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(&tick).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap()
        );
    }

    #[test]
    fn test_daily_cadence_follows_local_wall_clock() {
        let cadence = Cadence::parse("0 0 3 * * *").unwrap();
        let vienna = FixedOffset::east_opt(2 * 3600).unwrap();
        let at = vienna.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        let next = cadence.next_after(&at).unwrap();

        assert_eq!(next.hour(), 3);
        assert_eq!(next, vienna.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc).hour(), 1);
    }

    #[test]
    fn test_optional_cadence() {
        assert!(Cadence::parse_optional("x", "").unwrap().is_none());
        assert!(Cadence::parse_optional("x", "   ").unwrap().is_none());
        assert!(Cadence::parse_optional("x", "*/10 * * * * *").unwrap().is_some());

        let err = Cadence::parse_optional("x", "not cron").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCadence { .. }));
        assert!(err.to_string().contains("not cron"));
    }

    #[test]
    fn test_reset_action() {
        let counter = TopicCounter::from_config(&TopicConfig::new("a/#"), Outputs::memory()).unwrap();
        counter.increment("a/b");

        CounterAction::Reset.run(&counter).unwrap();

        assert!(counter.window_counts().is_empty());
        assert_eq!(counter.chart().len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let value = run_bounded("c", "stats", Duration::from_secs(5), || Ok(7))
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_bounded_reports_panic() {
        let err = run_bounded::<(), _>("c", "chart", Duration::from_secs(5), || {
            panic!("renderer exploded")
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExportError::Aborted { operation: "chart", .. }));
    }

    #[tokio::test]
    async fn test_rejects_jobs_after_shutdown() {
        let scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.shutdown().await;

        let err = scheduler
            .schedule_every("charts", Duration::from_secs(60), || async {})
            .unwrap_err();
        assert!(matches!(err, ScheduleError::ShutDown { .. }));
    }
}
