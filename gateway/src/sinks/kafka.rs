use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::health::HealthHandle;
use crate::sinks::{Job, JobStore};

const ACK_LOST: &str = "delivery report lost";

struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("gateway_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("gateway_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("gateway_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("gateway_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("gateway_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "gateway_kafka_produce_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => id_string.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "gateway_kafka_produce_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => id_string.clone()
                )
                .set(rtt.p99 as f64);
            }
            counter!(
                "gateway_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

/// Job store backed by a Kafka topic. Each job is produced as one JSON message keyed
/// by its source id, so jobs of one source keep their order within a partition.
#[derive(Clone)]
pub struct KafkaJobStore {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaJobStore {
    pub fn new(config: KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaJobStore> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("partitioner", "murmur2_random")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.max.bytes",
                config.kafka_producer_message_max_bytes.to_string(),
            )
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if !config.kafka_client_id.is_empty() {
            client_config.set("client.id", &config.kafka_client_id);
        }

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaJobStore {
            producer,
            topic: config.kafka_topic,
        })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn kafka_send(&self, job: &Job) -> Result<DeliveryFuture, String> {
        let payload = serde_json::to_string(job).map_err(|e| {
            error!("failed to serialize job {}: {}", job.uuid, e);
            format!("failed to serialize job: {e}")
        })?;
        let key = job.source_id().filter(|id| !id.is_empty());

        match self.producer.send_result(FutureRecord {
            topic: &self.topic,
            payload: Some(&payload),
            partition: None,
            key,
            timestamp: None,
            headers: Some(OwnedHeaders::new().insert(Header {
                key: "custom_val",
                value: Some(&job.custom_val),
            })),
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    Err("job exceeds the maximum message size".to_string())
                }
                _ => {
                    error!("failed to produce job {}: {}", job.uuid, e);
                    Err(format!("failed to produce job: {e}"))
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), String> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                error!("failed to produce to Kafka before write timeout");
                Err("write timeout".to_string())
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                Err("job exceeds the maximum message size".to_string())
            }
            Ok(Err((err, _))) => {
                error!("failed to produce to Kafka: {}", err);
                Err(format!("failed to produce job: {err}"))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for KafkaJobStore {
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    async fn store(&self, jobs: Vec<Job>) -> HashMap<Uuid, String> {
        let mut results: HashMap<Uuid, String> = jobs
            .iter()
            .map(|job| (job.uuid, ACK_LOST.to_string()))
            .collect();

        let mut set = JoinSet::new();
        for job in &jobs {
            // Enqueue sequentially, then wait for the broker ACKs concurrently
            match self.kafka_send(job) {
                Ok(ack) => {
                    let uuid = job.uuid;
                    set.spawn(async move { (uuid, Self::process_ack(ack).await) });
                }
                Err(err) => {
                    results.insert(job.uuid, err);
                }
            }
        }

        async {
            while let Some(res) = set.join_next().await {
                match res {
                    Ok((uuid, outcome)) => {
                        results.insert(uuid, outcome.err().unwrap_or_default());
                    }
                    Err(err) => error!("join error while waiting on Kafka ACK: {:?}", err),
                }
            }
        }
        .instrument(info_span!("ack_wait"))
        .await;

        let failed = results.values().filter(|err| !err.is_empty()).count();
        counter!("gateway_jobs_stored_total").increment((results.len() - failed) as u64);
        counter!("gateway_jobs_failed_total").increment(failed as u64);
        results
    }
}
