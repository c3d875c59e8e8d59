use std::future::ready;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method};
use axum::routing::{get, post, MethodRouter};
use axum::Router;
use axum_client_ip::InsecureClientIp;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::Admission;
use crate::auth::write_key_from_headers;
use crate::event::EventKind;
use crate::extractors::read_body;
use crate::gateway::{Gateway, IncomingRequest};
use crate::health::HealthRegistry;
use crate::prometheus::track_metrics;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub max_body_read_size: usize,
}

async fn index() -> &'static str {
    "gateway"
}

async fn event(
    kind: EventKind,
    State(state): State<AppState>,
    ip: Option<InsecureClientIp>,
    headers: HeaderMap,
    body: Body,
) -> Admission {
    // No client address outside of a real connection, e.g. in tests
    let remote_addr = ip
        .map(|InsecureClientIp(addr)| addr.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let request = IncomingRequest {
        write_key: write_key_from_headers(&headers),
        body: read_body(body, state.max_body_read_size).await,
        remote_addr,
    };
    state.gateway.handle(kind, request).await
}

fn event_route(kind: EventKind) -> MethodRouter<AppState> {
    post(
        move |state: State<AppState>,
              ip: Option<InsecureClientIp>,
              headers: HeaderMap,
              body: Body| event(kind, state, ip, headers, body),
    )
}

pub fn router(
    gateway: Gateway,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
    max_body_read_size: usize,
) -> Router {
    let state = AppState {
        gateway,
        max_body_read_size,
    };

    // Very permissive CORS policy, as browser SDKs and reverse proxies
    // might send funky headers.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let mut router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    for kind in EventKind::ALL {
        router = router.route(&format!("/v1/{kind}"), event_route(kind));
    }

    let router = router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is global: it is only installed, and rendered, when asked to
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}
