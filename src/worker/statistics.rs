use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::Message;

const DEFAULT_WINDOW: usize = 256;
/// Item duration that maps to a cost scale of 1.0.
pub const DEFAULT_REFERENCE_INVOCATION: Duration = Duration::from_millis(100);
const MIN_COST_SCALE: f64 = 0.01;
const MAX_COST_SCALE: f64 = 100.0;

/// Rolling window of recent item invocation times on this node.
///
/// The cost scale is the mean recent duration relative to a reference
/// duration: a node that runs items twice as slowly reports 2.0 and is
/// offered proportionally less work.
#[derive(Debug)]
pub struct InvocationStatistics {
    samples: Mutex<VecDeque<Duration>>,
    window: usize,
    reference: Duration,
}

impl Default for InvocationStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_INVOCATION, DEFAULT_WINDOW)
    }
}

impl InvocationStatistics {
    pub fn new(reference: Duration, window: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
            reference,
        }
    }

    pub fn record(&self, function_id: &str, duration: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(duration);
        tracing::trace!(function_id, duration_us = duration.as_micros() as u64, "Invocation recorded");
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// `None` until anything has been invoked.
    pub fn cost_scale(&self) -> Option<f64> {
        let samples = self.samples.lock();
        if samples.is_empty() || self.reference.is_zero() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        let mean = total.as_secs_f64() / samples.len() as f64;
        Some((mean / self.reference.as_secs_f64()).clamp(MIN_COST_SCALE, MAX_COST_SCALE))
    }
}

/// Periodically reports the node's cost scale to the coordinator.
pub struct ScalingReporter {
    interval: Duration,
}

impl ScalingReporter {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Run the reporter, sending Scaling on `tx` whenever a scale is known.
    pub async fn run(&self, statistics: &InvocationStatistics, tx: mpsc::UnboundedSender<Message>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; there is nothing to report yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(invocation_cost_scale) = statistics.cost_scale() else {
                continue;
            };
            if tx
                .send(Message::Scaling {
                    invocation_cost_scale,
                })
                .is_err()
            {
                // Connection gone, stop reporting
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_no_scale() {
        let stats = InvocationStatistics::default();
        assert_eq!(stats.cost_scale(), None);
    }

    #[test]
    fn scale_is_mean_over_reference() {
        let stats = InvocationStatistics::new(Duration::from_millis(100), 8);
        stats.record("f", Duration::from_millis(100));
        stats.record("f", Duration::from_millis(300));
        let scale = stats.cost_scale().unwrap();
        assert!((scale - 2.0).abs() < 1e-9);
    }

    #[test]
    fn window_drops_oldest_samples() {
        let stats = InvocationStatistics::new(Duration::from_millis(10), 2);
        stats.record("f", Duration::from_secs(10));
        stats.record("f", Duration::from_millis(10));
        stats.record("f", Duration::from_millis(10));
        assert_eq!(stats.sample_count(), 2);
        let scale = stats.cost_scale().unwrap();
        assert!((scale - 1.0).abs() < 1e-9);
    }

    #[test]
    fn scale_is_clamped() {
        let stats = InvocationStatistics::new(Duration::from_millis(1), 4);
        stats.record("slow", Duration::from_secs(60));
        assert_eq!(stats.cost_scale(), Some(100.0));
    }
}
