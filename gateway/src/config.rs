use std::{net::SocketAddr, num::NonZeroU32};

use envconfig::Envconfig;
use tracing::Level;

use crate::health::HealthStrategy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "gateway")]
    pub otel_service_name: String,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,

    #[envconfig(default = "4096000")]
    pub max_request_size: usize, // Larger bodies are rejected with RequestBodyTooLarge

    #[envconfig(default = "16384000")]
    pub max_body_read_size: usize, // Bytes buffered per request before giving up on the body

    #[envconfig(default = "false")]
    pub enable_rate_limit: bool,

    #[envconfig(default = "1000")]
    pub rate_limit_per_second: NonZeroU32,

    #[envconfig(default = "5000")]
    pub rate_limit_burst: NonZeroU32,

    pub rate_limit_forced_workspaces: Option<String>, // Comma-delimited workspace ids

    #[envconfig(default = "false")]
    pub enable_dedup: bool,

    #[envconfig(default = "3600")]
    pub dedup_window_secs: u64,

    #[envconfig(default = "1000000")]
    pub dedup_max_entries: u64,

    pub config_backend_url: Option<String>,

    #[envconfig(default = "")]
    pub config_backend_token: String,

    #[envconfig(default = "5")]
    pub config_poll_interval_secs: u64,

    pub static_sources: Option<String>, // Source registry as JSON, used without a backend

    #[envconfig(default = "ALL")]
    pub healthcheck_strategy: HealthStrategy,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "1000000")]
    pub kafka_producer_message_max_bytes: u32, // message.max.bytes - max kafka message size we will produce
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "gateway_jobs")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    #[envconfig(default = "")]
    pub kafka_client_id: String,
}
