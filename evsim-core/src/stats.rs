//! Message statistics
//!
//! Counts requests and responses per OCPP action and tracks round-trip
//! durations for the timed actions. Sessions report through the
//! [`StatisticsSink`] trait so tests can swap in a no-op sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

/// Sink for per-action counters and timings
pub trait StatisticsSink: Send + Sync {
    /// Count one outgoing or incoming request for an action.
    fn count_request(&self, action: &str);

    /// Count one response observed for an action.
    fn count_response(&self, action: &str);

    /// Record a request round-trip duration for an action.
    fn record_duration(&self, action: &str, duration: Duration);
}

/// Aggregated figures for one action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandStatistics {
    pub count: u64,
    pub count_response: u64,
    pub time_count: u64,
    pub min_time: Duration,
    pub max_time: Duration,
    pub total_time: Duration,
}

impl CommandStatistics {
    pub fn avg_time(&self) -> Duration {
        if self.time_count == 0 {
            Duration::ZERO
        } else {
            self.total_time / self.time_count as u32
        }
    }
}

/// Fleet-wide statistics store
#[derive(Default)]
pub struct Statistics {
    commands: Mutex<HashMap<String, CommandStatistics>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current per-action figures.
    pub fn snapshot(&self) -> HashMap<String, CommandStatistics> {
        self.commands.lock().clone()
    }

    /// Log one line per action, sorted by action name.
    pub fn display(&self) {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            info!("Statistics: no messages exchanged yet");
            return;
        }
        let mut actions: Vec<_> = snapshot.keys().collect();
        actions.sort();
        for action in actions {
            let stats = &snapshot[action];
            if stats.time_count > 0 {
                info!(
                    "Statistics {}: sent {} recv {} | rtt min {:?} avg {:?} max {:?} over {} calls",
                    action,
                    stats.count,
                    stats.count_response,
                    stats.min_time,
                    stats.avg_time(),
                    stats.max_time,
                    stats.time_count
                );
            } else {
                info!(
                    "Statistics {}: sent {} recv {}",
                    action, stats.count, stats.count_response
                );
            }
        }
    }

    /// Spawn a task that logs the statistics every `period`.
    pub fn start_display_loop(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                self.display();
            }
        })
    }
}

impl StatisticsSink for Statistics {
    fn count_request(&self, action: &str) {
        let mut commands = self.commands.lock();
        commands.entry(action.to_string()).or_default().count += 1;
    }

    fn count_response(&self, action: &str) {
        let mut commands = self.commands.lock();
        commands.entry(action.to_string()).or_default().count_response += 1;
    }

    fn record_duration(&self, action: &str, duration: Duration) {
        let mut commands = self.commands.lock();
        let stats = commands.entry(action.to_string()).or_default();
        if stats.time_count == 0 {
            stats.min_time = duration;
            stats.max_time = duration;
        } else {
            stats.min_time = stats.min_time.min(duration);
            stats.max_time = stats.max_time.max(duration);
        }
        stats.time_count += 1;
        stats.total_time += duration;
    }
}

/// Sink that drops everything, for sessions that do not keep statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatisticsSink for NullSink {
    fn count_request(&self, _action: &str) {}
    fn count_response(&self, _action: &str) {}
    fn record_duration(&self, _action: &str, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_and_response_counted_separately() {
        let stats = Statistics::new();
        stats.count_request("Heartbeat");
        stats.count_request("Heartbeat");
        stats.count_response("Heartbeat");
        stats.count_request("MeterValues");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["Heartbeat"].count, 2);
        assert_eq!(snapshot["Heartbeat"].count_response, 1);
        assert_eq!(snapshot["MeterValues"].count, 1);
        assert_eq!(snapshot["MeterValues"].count_response, 0);
    }

    #[test]
    fn test_duration_aggregates() {
        let stats = Statistics::new();
        stats.record_duration("StartTransaction", Duration::from_millis(30));
        stats.record_duration("StartTransaction", Duration::from_millis(10));
        stats.record_duration("StartTransaction", Duration::from_millis(20));

        let snapshot = stats.snapshot();
        let start = &snapshot["StartTransaction"];
        assert_eq!(start.time_count, 3);
        assert_eq!(start.min_time, Duration::from_millis(10));
        assert_eq!(start.max_time, Duration::from_millis(30));
        assert_eq!(start.total_time, Duration::from_millis(60));
        assert_eq!(start.avg_time(), Duration::from_millis(20));
    }

    #[test]
    fn test_first_sample_sets_min_and_max() {
        let stats = Statistics::new();
        stats.record_duration("StopTransaction", Duration::from_millis(42));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["StopTransaction"].min_time, Duration::from_millis(42));
        assert_eq!(snapshot["StopTransaction"].max_time, Duration::from_millis(42));
    }

    #[test]
    fn test_avg_of_empty_is_zero() {
        assert_eq!(CommandStatistics::default().avg_time(), Duration::ZERO);
    }

    #[test]
    fn test_usable_as_trait_object() {
        let sink: Arc<dyn StatisticsSink> = Arc::new(Statistics::new());
        sink.count_request("BootNotification");
        sink.count_response("BootNotification");

        let null: Arc<dyn StatisticsSink> = Arc::new(NullSink);
        null.count_request("BootNotification");
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_loop_runs() {
        let stats = Arc::new(Statistics::new());
        stats.count_request("Heartbeat");
        let handle = stats.clone().start_display_loop(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(121)).await;
        handle.abort();
    }
}
