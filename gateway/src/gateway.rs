use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, Span};
use uuid::Uuid;

use crate::api::{Admission, GatewayError};
use crate::backend_config::BackendConfig;
use crate::dedup::{Deduplicator, Reservation};
use crate::dispatcher::Dispatcher;
use crate::event::{EventEnvelope, EventKind, RawRequest, RequestContext};
use crate::extractors::RequestBody;
use crate::limiters::RateLimiter;
use crate::sinks::JobStore;
use crate::source_cache::SourceCache;
use crate::stats::{
    Stats, BATCH_SIZE, BATCH_TIME, NO_WRITE_KEY_TAG, RESPONSE_TIME, WORKSPACE_DROPPED_REQUESTS,
    WRITE_KEY_EVENTS, WRITE_KEY_FAILED_EVENTS, WRITE_KEY_FAILED_REQUESTS, WRITE_KEY_REQUESTS,
    WRITE_KEY_SUCCESSFUL_EVENTS, WRITE_KEY_SUCCESSFUL_REQUESTS,
};
use crate::time::TimeSource;

const REGISTRY_UPDATES_BUFFER: usize = 8;

/// One HTTP call, as extracted by the router.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Basic auth username, if the header was present and decodable
    pub write_key: Option<String>,
    pub body: RequestBody,
    pub remote_addr: String,
}

/// Result of the validation stages, before anything is dispatched.
enum Verdict {
    Accepted {
        write_key: String,
        source_id: String,
        envelope: EventEnvelope,
        reservation: Option<Reservation>,
    },
    Rejected {
        error: GatewayError,
        source_id: String,
    },
}

/// The admission pipeline: validates requests, normalizes them and hands one job per
/// request to the job store.
///
/// Every field is shared by clones, so one instance serves every connection.
#[derive(Clone)]
pub struct Gateway {
    sources: SourceCache,
    dispatcher: Dispatcher,
    rate_limiter: Option<Arc<dyn RateLimiter + Send + Sync>>,
    dedup: Option<Deduplicator>,
    stats: Arc<dyn Stats>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    max_request_size: usize,
}

impl Gateway {
    pub fn new(
        sources: SourceCache,
        store: Arc<dyn JobStore + Send + Sync>,
        stats: Arc<dyn Stats>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        max_request_size: usize,
    ) -> Self {
        Self {
            sources,
            dispatcher: Dispatcher::new(store),
            rate_limiter: None,
            dedup: None,
            stats,
            timesource,
            max_request_size,
        }
    }

    /// Subscribes to `backend` and returns once the first source registry was applied.
    /// No request is served before that.
    pub async fn setup<B>(
        backend: &B,
        store: Arc<dyn JobStore + Send + Sync>,
        stats: Arc<dyn Stats>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        max_request_size: usize,
    ) -> Self
    where
        B: BackendConfig + Sync + ?Sized,
    {
        let sources = SourceCache::new();
        let (tx, rx) = mpsc::channel(REGISTRY_UPDATES_BUFFER);
        backend.subscribe(tx).await;
        sources.spawn_subscriber(rx);

        info!("waiting for the source registry");
        backend.wait_for_config().await;
        sources.wait_ready().await;

        Self::new(sources, store, stats, timesource, max_request_size)
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter + Send + Sync>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_dedup(mut self, dedup: Deduplicator) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn sources(&self) -> &SourceCache {
        &self.sources
    }

    /// Runs one request through the pipeline.
    ///
    /// Rejected requests still dispatch an empty envelope. The batch timer always
    /// brackets the dispatch call, and the batch size is counted after the timer ends.
    #[instrument(skip_all, fields(kind = %kind, write_key))]
    pub async fn handle(&self, kind: EventKind, request: IncomingRequest) -> Admission {
        let response_timer = self.stats.timer_start(RESPONSE_TIME);
        let batch_timer = self.stats.timer_start(BATCH_TIME);

        let context = RequestContext {
            write_key: request.write_key.clone().unwrap_or_default(),
            request_ip: request.remote_addr.clone(),
            received_at: self.timesource.current_time(),
        };

        let admission = match self.admit(kind, request, &context).await {
            Verdict::Rejected { error, source_id } => {
                debug!(reason = error.reason(), "request rejected");
                let envelope = EventEnvelope::empty(&context);
                self.dispatcher.dispatch(&source_id, &envelope).await;
                self.stats.timer_end(batch_timer);
                self.stats.count(BATCH_SIZE, 1);
                Admission::Rejected(error)
            }
            Verdict::Accepted {
                write_key,
                source_id,
                envelope,
                reservation,
            } => {
                let results = self.dispatcher.dispatch(&source_id, &envelope).await;
                self.stats.timer_end(batch_timer);
                self.stats.count(BATCH_SIZE, 1);

                let events = envelope.len() as u64;
                self.stats.tagged_count(WRITE_KEY_SUCCESSFUL_REQUESTS, &write_key, 1);
                self.stats.tagged_count(WRITE_KEY_EVENTS, &write_key, events);
                self.stats.tagged_count(WRITE_KEY_SUCCESSFUL_EVENTS, &write_key, events);

                if let (Some(dedup), Some(reservation)) = (&self.dedup, reservation) {
                    if !all_stored(&results) {
                        dedup.release(reservation);
                    }
                }
                Admission::Accepted
            }
        };

        self.stats.timer_end(response_timer);
        admission
    }

    /// Validation stages, in order. The first failing stage decides the response.
    async fn admit(
        &self,
        kind: EventKind,
        request: IncomingRequest,
        context: &RequestContext,
    ) -> Verdict {
        let rejected = |error| Verdict::Rejected {
            error,
            source_id: String::new(),
        };

        let write_key = match request.write_key.filter(|key| !key.is_empty()) {
            Some(write_key) => write_key,
            None => {
                self.stats.tagged_count(WRITE_KEY_REQUESTS, "", 1);
                self.stats.tagged_count(WRITE_KEY_FAILED_REQUESTS, NO_WRITE_KEY_TAG, 1);
                return rejected(GatewayError::NoWriteKeyInAuth);
            }
        };
        Span::current().record("write_key", write_key.as_str());
        self.stats.tagged_count(WRITE_KEY_REQUESTS, &write_key, 1);

        // Bodies past the read cap were never buffered, so they skip the JSON check
        let body = match request.body {
            RequestBody::Missing => return rejected(GatewayError::RequestBodyNil),
            RequestBody::Oversized => {
                self.count_failed_with_events(&write_key);
                return rejected(GatewayError::RequestBodyTooLarge);
            }
            RequestBody::Complete(bytes) => bytes,
        };

        let parsed = match RawRequest::parse(kind, &body) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.stats.tagged_count(WRITE_KEY_FAILED_REQUESTS, &write_key, 1);
                return rejected(error);
            }
        };

        if body.len() > self.max_request_size {
            self.count_failed_with_events(&write_key);
            return rejected(GatewayError::RequestBodyTooLarge);
        }

        let Some(source_id) = self.sources.enabled_source_id(&write_key) else {
            self.count_failed_with_events(&write_key);
            return rejected(GatewayError::InvalidWriteKey);
        };

        if let Some(limiter) = &self.rate_limiter {
            let workspace_id = self.sources.workspace_id(&write_key).unwrap_or_default();
            if limiter.limit_reached(&workspace_id).await {
                self.stats.tagged_count(WORKSPACE_DROPPED_REQUESTS, &workspace_id, 1);
                return Verdict::Rejected {
                    error: GatewayError::RateLimitExceeded,
                    source_id,
                };
            }
        }

        // Ids are claimed before normalization, which fills in ids the caller left out
        let mut records = parsed.into_records(kind);
        let reservation = self
            .dedup
            .as_ref()
            .map(|dedup| dedup.reserve(&write_key, &mut records));

        Verdict::Accepted {
            write_key,
            source_id,
            envelope: EventEnvelope::from_records(records, context),
            reservation,
        }
    }

    /// Failure counters for stages that run after the body was read. No event is
    /// admitted, so the event counters are reported as zero.
    fn count_failed_with_events(&self, write_key: &str) {
        self.stats.tagged_count(WRITE_KEY_FAILED_REQUESTS, write_key, 1);
        self.stats.tagged_count(WRITE_KEY_EVENTS, write_key, 0);
        self.stats.tagged_count(WRITE_KEY_FAILED_EVENTS, write_key, 0);
    }
}

fn all_stored(results: &HashMap<Uuid, String>) -> bool {
    !results.is_empty() && results.values().all(String::is_empty)
}
