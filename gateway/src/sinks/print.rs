use std::collections::HashMap;

use async_trait::async_trait;
use metrics::counter;
use tracing::info;
use uuid::Uuid;

use crate::sinks::{Job, JobStore};

/// Logs jobs instead of storing them, for local runs.
pub struct PrintJobStore {}

#[async_trait]
impl JobStore for PrintJobStore {
    async fn store(&self, jobs: Vec<Job>) -> HashMap<Uuid, String> {
        let span = tracing::span!(tracing::Level::INFO, "batch of jobs");
        let _enter = span.enter();

        counter!("gateway_jobs_stored_total").increment(jobs.len() as u64);
        jobs.into_iter()
            .map(|job| {
                info!("job: {job:?}");
                (job.uuid, String::new())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::CUSTOM_VAL;
    use serde_json::json;

    #[tokio::test]
    async fn accepts_every_job() {
        let jobs: Vec<Job> = (0..3)
            .map(|_| Job {
                uuid: Uuid::now_v7(),
                custom_val: CUSTOM_VAL.to_string(),
                parameters: json!({"source_id": "source"}),
                event_payload: "{}".to_string(),
            })
            .collect();
        let uuids: Vec<Uuid> = jobs.iter().map(|job| job.uuid).collect();

        let result = PrintJobStore {}.store(jobs).await;
        assert_eq!(result.len(), 3);
        for uuid in uuids {
            assert_eq!(result.get(&uuid), Some(&String::new()));
        }
    }
}
