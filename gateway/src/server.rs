use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpListener;

use crate::backend_config::{BackendConfig, PollingBackendConfig, StaticBackendConfig};
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::gateway::Gateway;
use crate::health::{ComponentStatus, HealthRegistry};
use crate::limiters::WorkspaceLimiter;
use crate::prometheus::setup_metrics_recorder;
use crate::router;
use crate::sinks::kafka::KafkaJobStore;
use crate::sinks::print::PrintJobStore;
use crate::sinks::JobStore;
use crate::stats::MetricsStats;
use crate::time::SystemTime;

fn create_backend(
    config: &Config,
    liveness: &HealthRegistry,
) -> anyhow::Result<Box<dyn BackendConfig + Send + Sync>> {
    if let Some(url) = &config.config_backend_url {
        let poll_interval = Duration::from_secs(config.config_poll_interval_secs);
        let backend_liveness = liveness.register(
            "config_backend",
            std::cmp::max(poll_interval * 3, Duration::from_secs(30)),
        );
        let backend = PollingBackendConfig::new(
            url.clone(),
            config.config_backend_token.clone(),
            poll_interval,
            Some(backend_liveness),
        )?;
        return Ok(Box::new(backend));
    }

    match &config.static_sources {
        Some(raw) => {
            let backend =
                StaticBackendConfig::from_json(raw).context("invalid STATIC_SOURCES registry")?;
            Ok(Box::new(backend))
        }
        None => bail!("one of CONFIG_BACKEND_URL or STATIC_SOURCES must be set"),
    }
}

fn create_store(
    config: &Config,
    liveness: &HealthRegistry,
) -> anyhow::Result<(Arc<dyn JobStore + Send + Sync>, Option<KafkaJobStore>)> {
    if config.print_sink {
        // Print store is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("print_sink", Duration::from_secs(30))
            .report_status(ComponentStatus::Unhealthy);

        let store: Arc<dyn JobStore + Send + Sync> = Arc::new(PrintJobStore {});
        Ok((store, None))
    } else {
        let store_liveness = liveness.register("rdkafka", Duration::from_secs(30));
        let kafka = KafkaJobStore::new(config.kafka.clone(), store_liveness)?;
        let store: Arc<dyn JobStore + Send + Sync> = Arc::new(kafka.clone());
        Ok((store, Some(kafka)))
    }
}

fn create_limiter(config: &Config) -> WorkspaceLimiter {
    let limiter = WorkspaceLimiter::new(
        config.rate_limit_per_second,
        config.rate_limit_burst,
        config.rate_limit_forced_workspaces.clone(),
    );

    let housekeeping = limiter.clone();
    let export_key_count = config.export_prometheus;
    tokio::spawn(async move {
        housekeeping.run_housekeeping(export_key_count).await;
    });

    limiter
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness =
        HealthRegistry::new_with_strategy("liveness", config.healthcheck_strategy.clone());

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let backend = create_backend(&config, &liveness)?;
    let (store, kafka) = create_store(&config, &liveness)?;

    let mut gateway = Gateway::setup(
        backend.as_ref(),
        store,
        Arc::new(MetricsStats::default()),
        Arc::new(SystemTime {}),
        config.max_request_size,
    )
    .await;

    if config.enable_rate_limit {
        gateway = gateway.with_rate_limiter(Arc::new(create_limiter(&config)));
    }
    if config.enable_dedup {
        gateway = gateway.with_dedup(Deduplicator::new(
            config.dedup_max_entries,
            Duration::from_secs(config.dedup_window_secs),
        ));
    }

    let app = router::router(gateway, liveness, metrics, config.max_body_read_size);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    if let Some(kafka) = kafka {
        tracing::info!("flushing pending jobs to Kafka");
        kafka.flush()?;
    }
    Ok(())
}
