//! The HTTP surface wrapping the provider's query API.
//!
//! Serves cached blocks and states as SSZ for bootstrapping clients, a JSON status view and
//! prometheus metrics. Strictly read-only: a request never triggers an upstream fetch, and a
//! missing artifact is a plain 404.

use crate::eth2::types::{BlockId, FinalityCheckpointsData, StateId};
use crate::provider::{Error as ProviderError, MajorityService, UpstreamStatus};
use crate::types::Slot;
use serde::Serialize;
use slog::{error, info, Logger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::sync::watch;
use warp::http::header::{HeaderValue, CONTENT_TYPE};
use warp::http::{Response, StatusCode};
use warp::hyper::Body;
use warp::Filter;

#[derive(Serialize)]
struct StatusResponse {
    finality: Option<FinalityCheckpointsData>,
    head: Option<FinalityCheckpointsData>,
    upstreams: HashMap<String, UpstreamStatus>,
}

#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
}

/// Bind the server and run it until `shutdown` fires.
pub async fn serve(
    service: MajorityService,
    listen_addr: SocketAddr,
    mut shutdown: watch::Receiver<()>,
    log: Logger,
) {
    let bound = warp::serve(routes(service)).try_bind_with_graceful_shutdown(
        listen_addr,
        async move {
            let _ = shutdown.changed().await;
        },
    );

    match bound {
        Ok((addr, server)) => {
            info!(log, "HTTP server started"; "listen_addr" => %addr);
            server.await;
        }
        Err(e) => {
            error!(
                log,
                "Failed to bind HTTP server";
                "listen_addr" => %listen_addr,
                "error" => %e,
            );
        }
    }
}

fn routes(
    service: MajorityService,
) -> impl Filter<Extract = (Response<Body>,), Error = warp::Rejection> + Clone {
    let blocks_service = service.clone();
    let blocks = warp::path!("eth" / "v2" / "beacon" / "blocks" / String)
        .and(warp::get())
        .map(move |block_id: String| block_response(&blocks_service, &block_id));

    let states_service = service.clone();
    let states = warp::path!("eth" / "v2" / "debug" / "beacon" / "states" / String)
        .and(warp::get())
        .map(move |state_id: String| state_response(&states_service, &state_id));

    let status_service = service;
    let status = warp::path!("harbor" / "v1" / "status")
        .and(warp::get())
        .map(move || status_response(&status_service));

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .map(metrics_response);

    blocks
        .or(states)
        .unify()
        .or(status)
        .unify()
        .or(metrics)
        .unify()
}

fn block_response(service: &MajorityService, block_id: &str) -> Response<Body> {
    let block_id = match BlockId::from_str(block_id) {
        Ok(block_id) => block_id,
        Err(message) => return error_status(StatusCode::BAD_REQUEST, message),
    };

    let result = match block_id {
        BlockId::Genesis => service.get_block_by_slot(Slot::new(0)),
        BlockId::Finalized => service
            .finality()
            .ok_or(ProviderError::BlockNotFound)
            .and_then(|finality| service.get_block_by_root(&finality.finalized.root)),
        BlockId::Slot(slot) => service.get_block_by_slot(slot),
        BlockId::Root(root) => service.get_block_by_root(&root),
        // Only checkpoint-aligned artifacts are served.
        BlockId::Head => Err(ProviderError::BlockNotFound),
    };

    match result {
        Ok(block) => ssz_response(block.as_ssz_bytes().to_vec()),
        Err(e) => provider_error_response(e),
    }
}

fn state_response(service: &MajorityService, state_id: &str) -> Response<Body> {
    let state_id = match StateId::from_str(state_id) {
        Ok(state_id) => state_id,
        Err(message) => return error_status(StatusCode::BAD_REQUEST, message),
    };

    let result = match state_id {
        StateId::Genesis => service.get_beacon_state_by_slot(Slot::new(0)),
        StateId::Finalized => service
            .finality()
            .ok_or(ProviderError::StateNotFound)
            .and_then(|finality| service.get_beacon_state_by_root(&finality.finalized.root)),
        StateId::Slot(slot) => service.get_beacon_state_by_slot(slot),
        StateId::Root(state_root) => service.get_beacon_state_by_state_root(&state_root),
        StateId::Head => Err(ProviderError::StateNotFound),
    };

    match result {
        Ok(state) => ssz_response(state.as_ref().clone()),
        Err(e) => provider_error_response(e),
    }
}

fn status_response(service: &MajorityService) -> Response<Body> {
    let status = StatusResponse {
        finality: service.finality(),
        head: service.head(),
        upstreams: service.upstreams_status(),
    };

    match serde_json::to_vec(&status) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn metrics_response() -> Response<Body> {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(text) => {
            let mut response = Response::new(Body::from(text));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            response
        }
        Err(e) => error_status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn ssz_response(bytes: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Absent artifacts are "not found"; anything else is an internal failure.
fn provider_error_response(e: ProviderError) -> Response<Body> {
    match e {
        ProviderError::BlockNotFound | ProviderError::StateNotFound => {
            error_status(StatusCode::NOT_FOUND, e.to_string())
        }
        other => error_status(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn error_status(status: StatusCode, message: String) -> Response<Body> {
    let error = ErrorResponse {
        code: status.as_u16(),
        message,
    };
    let body = serde_json::to_vec(&error).unwrap_or_default();
    json_response(status, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::service::Config;

    fn test_service() -> MajorityService {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        MajorityService::new(Config::default(), log).expect("should build service")
    }

    #[tokio::test]
    async fn missing_block_is_not_found() {
        let response = warp::test::request()
            .path("/eth/v2/beacon/blocks/finalized")
            .reply(&routes(test_service()))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_block_id_is_rejected() {
        let response = warp::test::request()
            .path("/eth/v2/beacon/blocks/not-a-block")
            .reply(&routes(test_service()))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_is_always_available() {
        let response = warp::test::request()
            .path("/harbor/v1/status")
            .reply(&routes(test_service()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value =
            serde_json::from_slice(response.body()).expect("status body should be json");
        assert!(body.get("finality").is_some());
        assert!(body.get("upstreams").is_some());
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let response = warp::test::request()
            .path("/metrics")
            .reply(&routes(test_service()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
