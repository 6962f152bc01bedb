//! The set of counters and their subscription identities.
//!
//! The transport subscribes each counter's topic filter under the counter's
//! subscription id and hands every received event back to
//! [`CounterRegistry::dispatch`] with the id it arrived under. Ids are
//! assigned at registration, sequentially from 1; 0 is reserved for "no
//! subscription".

use std::sync::Arc;
use std::time::Duration;

use crate::config::TopicConfig;
use crate::counter::{Outputs, TopicCounter};
use crate::error::{DispatchError, ExportError, ScheduleError};
use crate::schedule::{Scheduler, run_bounded};

/// Identity a counter's subscription is registered under.
pub type SubscriptionId = u32;

/// Reserved id meaning "no subscription".
pub const NO_SUBSCRIPTION: SubscriptionId = 0;

/// Ordered collection of counters.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: Vec<(SubscriptionId, Arc<TopicCounter>)>,
}

impl CounterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one counter per topic entry.
    ///
    /// Entries that cannot be turned into a counter are logged and skipped;
    /// the remaining ones keep their relative order.
    pub fn from_topics(topics: &[TopicConfig], outputs: &Outputs) -> Self {
        let mut registry = Self::new();
        for (index, entry) in topics.iter().enumerate() {
            match TopicCounter::from_config(entry, outputs.clone()) {
                Ok(counter) => {
                    registry.register(counter);
                }
                Err(e) => {
                    tracing::error!(entry = index, topic = %entry.topic, "skipping topic: {e}");
                }
            }
        }
        tracing::info!(counters = registry.len(), "counter registry ready");
        registry
    }

    /// Adds a counter and returns the subscription id assigned to it.
    pub fn register(&mut self, counter: TopicCounter) -> SubscriptionId {
        let id = self.next_id();
        tracing::info!(
            id,
            name = counter.display_name(),
            topic = counter.base_label(),
            "registered counter"
        );
        self.counters.push((id, Arc::new(counter)));
        id
    }

    fn next_id(&self) -> SubscriptionId {
        self.counters
            .last()
            .map_or(NO_SUBSCRIPTION, |(id, _)| *id)
            .saturating_add(1)
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns `true` if no counter is registered.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns the counter registered under `id`.
    pub fn get(&self, id: SubscriptionId) -> Option<&Arc<TopicCounter>> {
        self.counters
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, counter)| counter)
    }

    /// Iterates counters with their ids in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionId, &Arc<TopicCounter>)> {
        self.counters.iter().map(|(id, counter)| (*id, counter))
    }

    /// Routes one event to the counter subscribed under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Unmatched`] if no counter owns `id`. The
    /// mismatch is also logged; the event is dropped.
    pub fn dispatch(&self, id: SubscriptionId, raw_label: &str) -> Result<(), DispatchError> {
        match self.get(id) {
            Some(counter) => {
                counter.increment(raw_label);
                Ok(())
            }
            None => {
                let err = DispatchError::Unmatched {
                    subscription_id: id,
                    label: raw_label.to_string(),
                };
                tracing::error!("{err}");
                Err(err)
            }
        }
    }

    /// Registers the scheduled jobs of every counter.
    ///
    /// Returns the number of jobs registered.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::ShutDown`] if the scheduler is shut down.
    pub fn schedule_all(&self, scheduler: &Scheduler) -> Result<usize, ScheduleError> {
        let mut jobs = 0;
        for (_, counter) in &self.counters {
            jobs += scheduler.schedule_counter(counter)?;
        }
        Ok(jobs)
    }

    /// Exports the window, or the lifetime counts, of every counter.
    ///
    /// Failures are logged and returned; the loop always visits every
    /// counter.
    pub fn flush_all(&self, include_lifetime: bool) -> Vec<ExportError> {
        self.for_each_export(|counter| counter.export_window(include_lifetime).map(drop))
    }

    /// Exports the chart of every counter.
    ///
    /// Failures are logged and returned.
    pub fn export_all_charts(&self) -> Vec<ExportError> {
        self.for_each_export(|counter| counter.export_chart().map(drop))
    }

    /// Logs the window of every counter.
    pub fn log_all_stats(&self) {
        for (_, counter) in &self.counters {
            counter.log_stats();
        }
    }

    fn for_each_export<F>(&self, mut export: F) -> Vec<ExportError>
    where
        F: FnMut(&TopicCounter) -> Result<(), ExportError>,
    {
        let mut failures = Vec::new();
        for (_, counter) in &self.counters {
            if let Err(e) = export(counter) {
                tracing::error!(counter = counter.display_name(), "export failed: {e}");
                failures.push(e);
            }
        }
        failures
    }

    /// [`flush_all`](Self::flush_all), with every export bounded by
    /// `timeout`.
    pub async fn flush_all_bounded(
        &self,
        include_lifetime: bool,
        timeout: Duration,
    ) -> Vec<ExportError> {
        let operation = if include_lifetime { "lifetime" } else { "window" };
        self.for_each_bounded(operation, timeout, move |counter| {
            counter.export_window(include_lifetime).map(drop)
        })
        .await
    }

    /// [`export_all_charts`](Self::export_all_charts), with every export
    /// bounded by `timeout`.
    pub async fn export_all_charts_bounded(&self, timeout: Duration) -> Vec<ExportError> {
        self.for_each_bounded("chart", timeout, |counter| counter.export_chart().map(drop))
            .await
    }

    /// Writes the window, logs the stats and writes the chart of every
    /// counter, each export bounded by `timeout`.
    pub async fn snapshot_now(&self, timeout: Duration) -> Vec<ExportError> {
        let mut failures = self.flush_all_bounded(false, timeout).await;
        self.log_all_stats();
        failures.extend(self.export_all_charts_bounded(timeout).await);
        failures
    }

    async fn for_each_bounded<F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        export: F,
    ) -> Vec<ExportError>
    where
        F: Fn(&TopicCounter) -> Result<(), ExportError> + Copy + Send + 'static,
    {
        let mut failures = Vec::new();
        for (_, counter) in &self.counters {
            let target = Arc::clone(counter);
            let result =
                run_bounded(counter.display_name(), operation, timeout, move || export(&target))
                    .await;
            if let Err(e) = result {
                tracing::error!(counter = counter.display_name(), "export failed: {e}");
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::MemorySink;
    use crate::render::EchartsRenderer;

    fn entry(name: &str, topic: &str) -> TopicConfig {
        let mut entry = TopicConfig::new(topic);
        entry.friendly_name = name.to_string();
        entry
    }

    #[test]
    fn test_ids_are_sequential_from_one() {
        let topics = vec![entry("a", "a/#"), entry("b", "b/#"), entry("c", "c/#")];
        let registry = CounterRegistry::from_topics(&topics, &Outputs::memory());

        let ids: Vec<SubscriptionId> = registry.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.get(2).unwrap().display_name(), "b");
        assert!(registry.get(NO_SUBSCRIPTION).is_none());
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let mut bad_cadence = entry("bad", "bad/#");
        bad_cadence.chart_cadence = "whenever".to_string();
        let topics = vec![
            entry("a", "a/#"),
            TopicConfig::default(),
            bad_cadence,
            entry("d", "d/#"),
        ];

        let registry = CounterRegistry::from_topics(&topics, &Outputs::memory());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().display_name(), "a");
        assert_eq!(registry.get(2).unwrap().display_name(), "d");
    }

    #[test]
    fn test_dispatch_routes_by_id() {
        let topics = vec![entry("a", "a/#"), entry("b", "b/#")];
        let registry = CounterRegistry::from_topics(&topics, &Outputs::memory());

        registry.dispatch(2, "b/x").unwrap();
        registry.dispatch(2, "b/x").unwrap();
        registry.dispatch(1, "a/y").unwrap();

        assert_eq!(registry.get(1).unwrap().window_count("a/y"), Some(1));
        assert_eq!(registry.get(2).unwrap().window_count("b/x"), Some(2));
        assert_eq!(registry.get(1).unwrap().window_count("b/x"), None);
    }

    #[test]
    fn test_unmatched_dispatch() {
        let registry = CounterRegistry::from_topics(&[entry("a", "a/#")], &Outputs::memory());

        let err = registry.dispatch(9, "a/x").unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Unmatched { subscription_id: 9, .. }
        ));
        assert!(registry.get(1).unwrap().window_counts().is_empty());
    }

    #[test]
    fn test_flush_all_visits_every_counter() {
        let sink = Arc::new(MemorySink::new());
        let outputs = Outputs::new(sink.clone(), Arc::new(EchartsRenderer::new()));
        let registry =
            CounterRegistry::from_topics(&[entry("a", "a/#"), entry("b", "b/#")], &outputs);

        assert!(registry.flush_all(true).is_empty());
        assert!(registry.export_all_charts().is_empty());

        let names = sink.names();
        assert_eq!(names.len(), 4);
        assert!(names[0].starts_with("a_total_"));
        assert!(names[1].starts_with("b_total_"));
        assert!(names[2].starts_with("graph_a_"));
        assert!(names[3].starts_with("graph_b_"));
    }

    #[tokio::test]
    async fn test_snapshot_now() {
        let sink = Arc::new(MemorySink::new());
        let outputs = Outputs::new(sink.clone(), Arc::new(EchartsRenderer::new()));
        let registry = CounterRegistry::from_topics(&[entry("a", "a/#")], &outputs);
        registry.dispatch(1, "a/x").unwrap();

        let failures = registry.snapshot_now(Duration::from_secs(5)).await;

        assert!(failures.is_empty());
        let names = sink.names();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("a_") && !names[0].starts_with("a_total_"));
        assert!(names[1].starts_with("graph_a_"));
        // a snapshot request does not reset the window
        assert_eq!(registry.get(1).unwrap().window_count("a/x"), Some(1));
    }
}
