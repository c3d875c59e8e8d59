use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::health::HealthHandle;

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A full snapshot of the sources registered upstream. Every update replaces the
/// previous snapshot wholesale.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(rename = "workspaceId", default)]
    pub workspace_id: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(rename = "writeKey")]
    pub write_key: String,
    pub enabled: bool,
    /// Overrides the registry-wide workspace for this source
    #[serde(
        rename = "workspaceId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace_id: Option<String>,
}

impl SourceRegistry {
    pub fn workspace_for<'a>(&'a self, source: &'a Source) -> &'a str {
        source
            .workspace_id
            .as_deref()
            .unwrap_or(self.workspace_id.as_str())
    }
}

/// Delivers source registry snapshots to the gateway.
#[async_trait]
pub trait BackendConfig {
    /// Sends the current snapshot, if any, then every later snapshot to `subscriber`
    /// until the receiving side is dropped.
    async fn subscribe(&self, subscriber: mpsc::Sender<SourceRegistry>);

    /// Returns once a first snapshot has been published.
    async fn wait_for_config(&self);
}

/// Latest-value broadcast shared by the providers below.
#[derive(Clone)]
struct Published {
    latest: Arc<watch::Sender<Option<Arc<SourceRegistry>>>>,
}

impl Published {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            latest: Arc::new(tx),
        }
    }

    fn publish(&self, registry: SourceRegistry) {
        gauge!("gateway_registry_sources").set(registry.sources.len() as f64);
        self.latest.send_replace(Some(Arc::new(registry)));
    }

    fn subscribe(&self, subscriber: mpsc::Sender<SourceRegistry>) {
        let mut updates = self.latest.subscribe();
        tokio::spawn(async move {
            loop {
                let current = updates.borrow_and_update().clone();
                if let Some(registry) = current {
                    if subscriber.send(registry.as_ref().clone()).await.is_err() {
                        debug!("registry subscriber dropped");
                        return;
                    }
                }
                if updates.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    async fn wait(&self) {
        let mut updates = self.latest.subscribe();
        if updates.wait_for(Option::is_some).await.is_err() {
            warn!("registry publisher closed before a first snapshot");
        }
    }
}

/// Serves one fixed registry, for local runs and tests.
#[derive(Clone)]
pub struct StaticBackendConfig {
    published: Published,
}

impl StaticBackendConfig {
    pub fn new(registry: SourceRegistry) -> Self {
        let published = Published::new();
        published.publish(registry);
        Self { published }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let registry: SourceRegistry = serde_json::from_str(raw)?;
        Ok(Self::new(registry))
    }
}

#[async_trait]
impl BackendConfig for StaticBackendConfig {
    async fn subscribe(&self, subscriber: mpsc::Sender<SourceRegistry>) {
        self.published.subscribe(subscriber)
    }

    async fn wait_for_config(&self) {
        self.published.wait().await
    }
}

/// Polls the configuration backend over HTTP and publishes each snapshot it receives.
///
/// A failed poll keeps serving the previous snapshot: a short outage of the backend
/// must not turn every write key invalid.
#[derive(Clone)]
pub struct PollingBackendConfig {
    published: Published,
}

impl PollingBackendConfig {
    pub fn new(
        url: String,
        token: String,
        poll_interval: Duration,
        liveness: Option<HealthHandle>,
    ) -> anyhow::Result<Self> {
        if poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "poll interval {:?} is too short, using {:?}",
                poll_interval, MIN_POLL_INTERVAL
            );
        }
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let published = Published::new();

        let poller = published.clone();
        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                match fetch_registry(&client, &url, &token).await {
                    Ok(registry) => {
                        counter!("gateway_registry_fetches_total", "result" => "ok").increment(1);
                        debug!(sources = registry.sources.len(), "fetched source registry");
                        poller.publish(registry);
                        if let Some(liveness) = &liveness {
                            liveness.report_healthy();
                        }
                    }
                    Err(e) => {
                        counter!("gateway_registry_fetches_total", "result" => "error")
                            .increment(1);
                        warn!("failed to fetch source registry from {}: {:?}", url, e);
                    }
                }
            }
        });

        info!("polling source registry every {:?}", poll_interval);
        Ok(Self { published })
    }
}

async fn fetch_registry(
    client: &reqwest::Client,
    url: &str,
    token: &str,
) -> anyhow::Result<SourceRegistry> {
    let registry = client
        .get(url)
        .basic_auth(token, Some(""))
        .send()
        .await?
        .error_for_status()?
        .json::<SourceRegistry>()
        .await?;
    Ok(registry)
}

#[async_trait]
impl BackendConfig for PollingBackendConfig {
    async fn subscribe(&self, subscriber: mpsc::Sender<SourceRegistry>) {
        self.published.subscribe(subscriber)
    }

    async fn wait_for_config(&self) {
        self.published.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use tokio::time::timeout;

    fn registry(write_key: &str) -> SourceRegistry {
        SourceRegistry {
            workspace_id: "workspace".to_string(),
            sources: vec![Source {
                id: "source".to_string(),
                write_key: write_key.to_string(),
                enabled: true,
                workspace_id: None,
            }],
        }
    }

    #[test]
    fn parses_registry_json() {
        let parsed: SourceRegistry = serde_json::from_value(json!({
            "workspaceId": "ws-1",
            "sources": [
                {"id": "a", "writeKey": "key-a", "enabled": true},
                {"id": "b", "writeKey": "key-b", "enabled": false, "workspaceId": "ws-2"}
            ]
        }))
        .unwrap();

        assert_eq!(parsed.sources.len(), 2);
        assert_eq!(parsed.workspace_for(&parsed.sources[0]), "ws-1");
        assert_eq!(parsed.workspace_for(&parsed.sources[1]), "ws-2");
        assert!(!parsed.sources[1].enabled);
    }

    #[tokio::test]
    async fn static_config_delivers_to_late_subscribers() {
        let backend = StaticBackendConfig::new(registry("key"));
        backend.wait_for_config().await;

        let (tx, mut rx) = mpsc::channel(4);
        backend.subscribe(tx).await;
        let received = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no snapshot delivered");
        assert_eq!(received, Some(registry("key")));
    }

    #[tokio::test]
    async fn subscribers_see_every_new_snapshot() {
        let published = Published::new();
        let (tx, mut rx) = mpsc::channel(4);
        published.subscribe(tx);

        published.publish(registry("first"));
        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(registry("first")));

        published.publish(registry("second"));
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(second, Some(registry("second")));
    }

    #[tokio::test]
    async fn wait_blocks_until_first_publish() {
        let published = Published::new();
        let waiter = published.clone();
        let waiting = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        published.publish(registry("key"));
        timeout(Duration::from_secs(1), waiting)
            .await
            .expect("wait did not return")
            .unwrap();
    }

    #[tokio::test]
    async fn polls_registry_over_http() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sources");
                then.status(200).json_body(json!({
                    "workspaceId": "workspace",
                    "sources": [{"id": "source", "writeKey": "key", "enabled": true}]
                }));
            })
            .await;

        let backend = PollingBackendConfig::new(
            server.url("/sources"),
            "token".to_string(),
            Duration::from_millis(50),
            None,
        )
        .unwrap();
        timeout(Duration::from_secs(5), backend.wait_for_config())
            .await
            .expect("registry never fetched");

        let (tx, mut rx) = mpsc::channel(4);
        backend.subscribe(tx).await;
        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(registry("key")));
    }

    #[tokio::test]
    async fn failed_polls_do_not_publish() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sources");
                then.status(500);
            })
            .await;

        let backend = PollingBackendConfig::new(
            server.url("/sources"),
            "token".to_string(),
            Duration::from_millis(20),
            None,
        )
        .unwrap();

        let waited = timeout(Duration::from_millis(200), backend.wait_for_config()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn zero_poll_interval_still_polls() {
        let server = MockServer::start_async().await;
        let registry_mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/sources");
                then.status(200).json_body(json!({
                    "workspaceId": "workspace",
                    "sources": [{"id": "source", "writeKey": "key", "enabled": true}]
                }));
            })
            .await;

        let backend = PollingBackendConfig::new(
            server.url("/sources"),
            "token".to_string(),
            Duration::ZERO,
            None,
        )
        .unwrap();
        timeout(Duration::from_secs(5), backend.wait_for_config())
            .await
            .expect("registry never fetched");

        // The ticker runs at the minimum interval instead of spinning
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry_mock.hits_async().await, 1);
    }
}
