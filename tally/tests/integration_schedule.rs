//! Integration tests for scheduled jobs, bounded exports and shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tally::config::TopicConfig;
use tally::counter::{Outputs, TopicCounter};
use tally::error::ExportError;
use tally::export::{ArtifactSink, MemorySink};
use tally::registry::CounterRegistry;
use tally::render::EchartsRenderer;
use tally::schedule::{Cadence, CounterAction, Scheduler, run_bounded};

/// A sink that blocks every write until released.
#[derive(Debug)]
struct HangingSink {
    release: Mutex<Receiver<()>>,
}

impl HangingSink {
    fn new() -> (Self, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                release: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl ArtifactSink for HangingSink {
    fn persist(&self, file_name: &str, _payload: &[u8]) -> Result<PathBuf, ExportError> {
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(30));
        Ok(PathBuf::from(file_name))
    }
}

fn counter(outputs: Outputs, configure: impl FnOnce(&mut TopicConfig)) -> Arc<TopicCounter> {
    let mut entry = TopicConfig::new("sensors/#");
    entry.friendly_name = "sensors".to_string();
    configure(&mut entry);
    Arc::new(TopicCounter::from_config(&entry, outputs).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hanging_export_times_out() {
    let (sink, release) = HangingSink::new();
    let outputs = Outputs::new(Arc::new(sink), Arc::new(EchartsRenderer::new()));
    let counter = counter(outputs, |_| {});
    counter.increment("sensors/temp");

    let bound = Duration::from_millis(200);
    let started = Instant::now();
    let target = Arc::clone(&counter);
    let err = run_bounded("sensors", "window", bound, move || {
        target.export_window(false).map(drop)
    })
    .await
    .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        err,
        ExportError::TimedOut { operation: "window", timeout, .. } if timeout == bound
    ));
    // the counter stays usable while the write is stuck
    counter.increment("sensors/temp");
    assert_eq!(counter.window_count("sensors/temp"), Some(2));

    release.send(()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_flush_is_bounded_per_counter() {
    let (sink, release) = HangingSink::new();
    let outputs = Outputs::new(Arc::new(sink), Arc::new(EchartsRenderer::new()));
    let mut a = TopicConfig::new("a/#");
    a.friendly_name = "a".to_string();
    let mut b = TopicConfig::new("b/#");
    b.friendly_name = "b".to_string();
    let registry = CounterRegistry::from_topics(&[a, b], &outputs);

    let failures = registry
        .flush_all_bounded(true, Duration::from_millis(100))
        .await;

    assert_eq!(failures.len(), 2);
    assert!(
        failures
            .iter()
            .all(|e| matches!(e, ExportError::TimedOut { operation: "lifetime", .. }))
    );

    release.send(()).unwrap();
    release.send(()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cron_job_fires_and_stops() {
    let sink = Arc::new(MemorySink::new());
    let outputs = Outputs::new(sink.clone(), Arc::new(EchartsRenderer::new()));
    let counter = counter(outputs, |entry| {
        entry.reset_cadence = "* * * * * *".to_string();
        entry.stats_cadence = "* * * * * *".to_string();
    });
    counter.increment("sensors/temp");

    let scheduler = Scheduler::new(Duration::from_secs(5));
    assert_eq!(scheduler.schedule_counter(&counter).unwrap(), 2);
    assert_eq!(scheduler.job_count(), 2);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    scheduler.shutdown().await;

    assert_eq!(scheduler.job_count(), 0);
    assert!(!counter.chart().is_empty());
    assert!(sink.names().iter().any(|n| n.starts_with("sensors_")));
    assert_eq!(counter.lifetime_count("sensors/temp"), Some(1));

    let after_shutdown = counter.chart().len();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(counter.chart().len(), after_shutdown);
}

#[tokio::test]
async fn test_scheduling_after_shutdown_is_rejected() {
    let counter = counter(Outputs::memory(), |_| {});
    let scheduler = Scheduler::new(Duration::from_secs(5));
    scheduler.shutdown().await;

    let cadence = Cadence::parse("0 * * * * *").unwrap();
    assert!(
        scheduler
            .schedule(counter, CounterAction::Reset, cadence)
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn test_periodic_job_skips_first_tick() {
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(Duration::from_secs(5));

    let seen = Arc::clone(&runs);
    scheduler
        .schedule_every("charts", Duration::from_secs(60), move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(185)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    scheduler.shutdown().await;
}

#[test]
fn test_reset_without_stats_cadence_still_resets() {
    let counter = counter(Outputs::memory(), |entry| {
        entry.reset_cadence = "0 */5 * * * *".to_string();
    });
    counter.increment("sensors/temp");

    CounterAction::Reset.run(&counter).unwrap();
    CounterAction::ExportStats.run(&counter).unwrap();

    assert_eq!(counter.chart().len(), 1);
    assert!(counter.window_counts().is_empty());
}
