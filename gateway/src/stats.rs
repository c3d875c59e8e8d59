use std::time::Instant;

use metrics::{counter, histogram};

pub const WRITE_KEY_REQUESTS: &str = "gateway_write_key_requests";
pub const WRITE_KEY_SUCCESSFUL_REQUESTS: &str = "gateway_write_key_successful_requests";
pub const WRITE_KEY_FAILED_REQUESTS: &str = "gateway_write_key_failed_requests";
pub const WRITE_KEY_EVENTS: &str = "gateway_write_key_events";
pub const WRITE_KEY_SUCCESSFUL_EVENTS: &str = "gateway_write_key_successful_events";
pub const WRITE_KEY_FAILED_EVENTS: &str = "gateway_write_key_failed_events";
pub const WORKSPACE_DROPPED_REQUESTS: &str = "gateway_workspace_dropped_requests";
pub const BATCH_SIZE: &str = "gateway_batch_size";
pub const BATCH_TIME: &str = "gateway_batch_time_seconds";
pub const RESPONSE_TIME: &str = "gateway_response_time_seconds";

/// Key used for failed requests that carried no write key at all.
pub const NO_WRITE_KEY_TAG: &str = "noWriteKey";

/// A running timer, handed back to `Stats::timer_end`.
#[derive(Debug)]
pub struct Timer {
    pub name: &'static str,
    started: Instant,
}

impl Timer {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Counters and timers recorded by the admission pipeline.
///
/// Implementations must not reorder calls: the pipeline relies on a `timer_end` or `count`
/// being observable after everything the same request did before it.
pub trait Stats: Send + Sync {
    /// Adds `value` to the counter `name` for one write key or workspace.
    fn tagged_count(&self, name: &'static str, tag: &str, value: u64);

    fn count(&self, name: &'static str, value: u64);

    fn timer_start(&self, name: &'static str) -> Timer {
        Timer::start(name)
    }

    fn timer_end(&self, timer: Timer);
}

/// Records through the `metrics` facade, rendered by the Prometheus exporter when installed.
#[derive(Clone, Default)]
pub struct MetricsStats {}

impl Stats for MetricsStats {
    fn tagged_count(&self, name: &'static str, tag: &str, value: u64) {
        counter!(name, "key" => tag.to_string()).increment(value);
    }

    fn count(&self, name: &'static str, value: u64) {
        counter!(name).increment(value);
    }

    fn timer_end(&self, timer: Timer) {
        histogram!(timer.name).record(timer.elapsed_secs());
    }
}
