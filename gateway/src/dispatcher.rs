use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::event::EventEnvelope;
use crate::sinks::{Job, JobStore, CUSTOM_VAL};

/// Turns one envelope into exactly one job and hands it to the job store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore + Send + Sync>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore + Send + Sync>) -> Self {
        Self { store }
    }

    pub fn build_job(source_id: &str, envelope: &EventEnvelope) -> serde_json::Result<Job> {
        Ok(Job {
            uuid: Uuid::now_v7(),
            custom_val: CUSTOM_VAL.to_string(),
            parameters: json!({ "source_id": source_id }),
            event_payload: serde_json::to_string(envelope)?,
        })
    }

    /// Stores the envelope, including empty ones, and returns the store's per-job outcome.
    /// Failures are logged here and never change how the request was answered.
    pub async fn dispatch(
        &self,
        source_id: &str,
        envelope: &EventEnvelope,
    ) -> HashMap<Uuid, String> {
        let job = match Self::build_job(source_id, envelope) {
            Ok(job) => job,
            Err(e) => {
                error!("failed to serialize envelope for source {}: {}", source_id, e);
                counter!("gateway_dispatch_errors_total", "cause" => "serialization").increment(1);
                return HashMap::from([(Uuid::nil(), e.to_string())]);
            }
        };
        let uuid = job.uuid;

        let results = self.store.store(vec![job]).await;
        match results.get(&uuid) {
            Some(err) if err.is_empty() => {}
            Some(err) => {
                error!(%uuid, source_id, "job store rejected job: {}", err);
                counter!("gateway_dispatch_errors_total", "cause" => "store").increment(1);
            }
            None => {
                error!(%uuid, source_id, "job store returned no outcome for job");
                counter!("gateway_dispatch_errors_total", "cause" => "missing").increment(1);
            }
        }
        results
    }
}
