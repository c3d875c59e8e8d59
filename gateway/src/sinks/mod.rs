use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod kafka;
pub mod print;

/// Marks jobs produced by the gateway for downstream consumers.
pub const CUSTOM_VAL: &str = "GW";

/// One durable queue record: a serialized envelope plus routing parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub custom_val: String,
    pub parameters: Value,
    pub event_payload: String,
}

impl Job {
    pub fn source_id(&self) -> Option<&str> {
        self.parameters.get("source_id").and_then(Value::as_str)
    }
}

/// The durable job queue.
///
/// `store` returns an entry for every job it was handed, keyed by job uuid. An empty
/// string means the job was accepted, anything else describes why it was not.
#[async_trait]
pub trait JobStore {
    async fn store(&self, jobs: Vec<Job>) -> HashMap<Uuid, String>;
}
