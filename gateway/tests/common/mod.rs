#![allow(dead_code)]
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use gateway::backend_config::{Source, SourceRegistry, StaticBackendConfig};
use gateway::extractors::RequestBody;
use gateway::gateway::{Gateway, IncomingRequest};
use gateway::limiters::RateLimiter;
use gateway::sinks::{Job, JobStore};
use gateway::stats::{Stats, Timer};
use gateway::time::TimeSource;

pub const ENABLED_WRITE_KEY: &str = "enabled-write-key";
pub const DISABLED_WRITE_KEY: &str = "disabled-write-key";
pub const UNKNOWN_WRITE_KEY: &str = "unknown-write-key";
pub const SOURCE_ID: &str = "enabled-source";
pub const WORKSPACE_ID: &str = "workspace";
pub const FIXED_TIME: &str = "2024-05-01T10:20:30.456Z";
pub const REMOTE_ADDR: &str = "10.1.2.3";
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Everything the collaborators observed, in the order they observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    TimerStart(&'static str),
    TimerEnd(&'static str),
    Count {
        name: &'static str,
        tag: Option<String>,
        value: u64,
    },
    Store(Vec<Job>),
    LimitCheck(String),
}

#[derive(Clone, Default)]
pub struct Timeline {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Timeline {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, wanted: impl Fn(&Call) -> bool) -> usize {
        self.calls()
            .iter()
            .position(wanted)
            .expect("call not recorded")
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Store(jobs) => Some(jobs),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Batches of every stored job payload, in storage order.
    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.jobs()
            .iter()
            .map(|job| {
                let payload: Value = serde_json::from_str(&job.event_payload).unwrap();
                payload["batch"].as_array().unwrap().clone()
            })
            .collect()
    }

    /// Tagged counts recorded for `name`, as (tag, value) pairs.
    pub fn counts(&self, name: &str) -> Vec<(Option<String>, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Count {
                    name: recorded,
                    tag,
                    value,
                } if recorded == name => Some((tag, value)),
                _ => None,
            })
            .collect()
    }

    pub fn total(&self, name: &str) -> u64 {
        self.counts(name).iter().map(|(_, value)| value).sum()
    }
}

pub struct RecordingStats {
    pub timeline: Timeline,
}

impl Stats for RecordingStats {
    fn tagged_count(&self, name: &'static str, tag: &str, value: u64) {
        self.timeline.push(Call::Count {
            name,
            tag: Some(tag.to_string()),
            value,
        });
    }

    fn count(&self, name: &'static str, value: u64) {
        self.timeline.push(Call::Count {
            name,
            tag: None,
            value,
        });
    }

    fn timer_start(&self, name: &'static str) -> Timer {
        self.timeline.push(Call::TimerStart(name));
        Timer::start(name)
    }

    fn timer_end(&self, timer: Timer) {
        self.timeline.push(Call::TimerEnd(timer.name));
    }
}

pub struct MemoryJobStore {
    pub timeline: Timeline,
    pub fail_with: Option<String>,
    /// Time spent before the jobs are recorded, to keep requests in flight
    pub delay: Duration,
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn store(&self, jobs: Vec<Job>) -> HashMap<Uuid, String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = self.fail_with.clone().unwrap_or_default();
        let results = jobs.iter().map(|job| (job.uuid, outcome.clone())).collect();
        self.timeline.push(Call::Store(jobs));
        results
    }
}

pub struct StaticLimiter {
    pub timeline: Timeline,
    pub limited: HashSet<String>,
}

#[async_trait]
impl RateLimiter for StaticLimiter {
    async fn limit_reached(&self, workspace_id: &str) -> bool {
        self.timeline.push(Call::LimitCheck(workspace_id.to_string()));
        self.limited.contains(workspace_id)
    }
}

#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.to_string()
    }
}

pub fn registry() -> SourceRegistry {
    SourceRegistry {
        workspace_id: WORKSPACE_ID.to_string(),
        sources: vec![
            Source {
                id: SOURCE_ID.to_string(),
                write_key: ENABLED_WRITE_KEY.to_string(),
                enabled: true,
                workspace_id: None,
            },
            Source {
                id: "disabled-source".to_string(),
                write_key: DISABLED_WRITE_KEY.to_string(),
                enabled: false,
                workspace_id: None,
            },
        ],
    }
}

pub struct TestGateway {
    pub gateway: Gateway,
    pub timeline: Timeline,
}

pub async fn setup_gateway() -> TestGateway {
    setup_gateway_with(None).await
}

pub async fn setup_gateway_with(store_error: Option<&str>) -> TestGateway {
    build_gateway(store_error, Duration::ZERO).await
}

pub async fn setup_slow_gateway(delay: Duration) -> TestGateway {
    build_gateway(None, delay).await
}

async fn build_gateway(store_error: Option<&str>, delay: Duration) -> TestGateway {
    let timeline = Timeline::default();
    let backend = StaticBackendConfig::new(registry());
    let gateway = Gateway::setup(
        &backend,
        Arc::new(MemoryJobStore {
            timeline: timeline.clone(),
            fail_with: store_error.map(String::from),
            delay,
        }),
        Arc::new(RecordingStats {
            timeline: timeline.clone(),
        }),
        Arc::new(FixedTime {
            time: FIXED_TIME.to_string(),
        }),
        MAX_REQUEST_SIZE,
    )
    .await;
    TestGateway { gateway, timeline }
}

pub fn limiter(timeline: &Timeline, limited: &[&str]) -> Arc<StaticLimiter> {
    Arc::new(StaticLimiter {
        timeline: timeline.clone(),
        limited: limited.iter().map(|w| w.to_string()).collect(),
    })
}

pub fn request(write_key: Option<&str>, body: Option<&str>) -> IncomingRequest {
    IncomingRequest {
        write_key: write_key.map(String::from),
        body: match body {
            Some(body) => RequestBody::Complete(Bytes::from(body.to_string())),
            None => RequestBody::Missing,
        },
        remote_addr: REMOTE_ADDR.to_string(),
    }
}

pub fn basic_auth(write_key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{write_key}:"));
    format!("Basic {encoded}")
}

pub fn is_uuid(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| Uuid::parse_str(s).is_ok())
        .unwrap_or(false)
}
