//! axum server wiring.
//!
//! The aggregator exposes:
//! - `/healthz` and `/readyz`
//! - `GET /aggregation?pricing=..&track=..&shipments=..`, which submits each key list to its
//!   kind's pipeline and answers with the three collected maps

use std::sync::Arc;

use axum::{
    extract::{RawQuery, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http::StatusCode;
use tokio::sync::Semaphore;

use crate::{
    config::AggregatorConfig,
    downstream::HttpDownstream,
    kind::ResourceKind,
    service::{AggregationRequest, AggregationService},
};

#[derive(Clone)]
struct AppState {
    service: AggregationService,
    inflight_requests: Arc<Semaphore>,
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/aggregation", get(handle_aggregation))
        .with_state(state)
}

pub async fn run(cfg: AggregatorConfig) -> anyhow::Result<()> {
    let downstream = Arc::new(HttpDownstream::new(cfg.services_host.clone())?);
    tracing::info!(
        services_host = %downstream.base_url(),
        "initializing aggregation service"
    );
    let service = AggregationService::start(downstream, &cfg.pipelines);

    let state = AppState {
        service,
        inflight_requests: Arc::new(Semaphore::new(cfg.max_inflight_requests)),
    };
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!(listen_addr = %cfg.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}

/// Parse the `/aggregation` query string.
///
/// Each kind accepts comma-separated keys, repeated parameters, or both. A parameter that is
/// present but empty yields an empty list; an absent parameter yields `None`.
fn parse_request(raw_query: &str) -> AggregationRequest {
    let mut req = AggregationRequest::default();
    for (name, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        let slot = match ResourceKind::ALL.into_iter().find(|k| k.as_str() == name) {
            Some(ResourceKind::Pricing) => &mut req.pricing,
            Some(ResourceKind::Track) => &mut req.track,
            Some(ResourceKind::Shipments) => &mut req.shipments,
            None => continue,
        };
        let keys = slot.get_or_insert_with(Vec::new);
        keys.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        );
    }
    req
}

async fn handle_aggregation(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let _permit = match state.inflight_requests.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(
                event = "admission_rejected",
                reason = "too_many_inflight_requests",
                "request rejected"
            );
            return (StatusCode::TOO_MANY_REQUESTS, "too many requests").into_response();
        }
    };

    let req = parse_request(query.as_deref().unwrap_or(""));
    tracing::debug!(
        event = "aggregation_request",
        pricing = req.pricing.as_ref().map_or(0, Vec::len),
        track = req.track.as_ref().map_or(0, Vec::len),
        shipments = req.shipments.as_ref().map_or(0, Vec::len),
        "aggregating"
    );

    Json(state.service.aggregate(&req).await).into_response()
}
