//! Periodic gauge reporting

use crate::invoker::CommandInvoker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Background task that calls [`CommandInvoker::report_gauges`] on an interval
#[derive(Debug)]
pub struct GaugeReporter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl GaugeReporter {
    /// Start reporting every `interval`. Must be called from a tokio runtime
    pub fn spawn(invoker: Arc<CommandInvoker>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => invoker.report_gauges(),
                    _ = token.cancelled() => {
                        debug!("Gauge reporter shutting down");
                        break;
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stop reporting and wait for the task to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::MemoryConfig;
    use crate::events::testing::RecordingEvents;
    use crate::key::Key;

    #[tokio::test]
    async fn test_reports_until_shutdown() {
        let events = Arc::new(RecordingEvents::default());
        let invoker = Arc::new(
            CommandInvoker::builder()
                .config(Arc::new(MemoryConfig::new()))
                .metric_events(events.clone())
                .build(),
        );

        let command = Command::new(Key::new("search").unwrap(), "Query", Duration::from_secs(1))
            .unwrap();
        invoker
            .invoke(&command, |_| Ok::<_, std::io::Error>(()))
            .unwrap();

        let reporter = GaugeReporter::spawn(invoker.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(45)).await;
        reporter.shutdown().await;

        let reported = events.count("bulkhead_gauge search");
        assert!(reported >= 2, "expected repeated gauges, got {reported}");
        assert_eq!(events.count("breaker_gauge search"), reported);

        // Nothing more after shutdown
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(events.count("bulkhead_gauge search"), reported);
    }
}
