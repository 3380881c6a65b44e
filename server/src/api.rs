use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use keyindex_core::{ApplyError, Gateway, GatewayError, GatewayRequest, GatewayResponse};
use serde::Deserialize;
use serde_json::{json, Value};

type Reply = (StatusCode, Json<Result<GatewayResponse, GatewayError>>);

const DEFAULT_ENTRIES_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/gateway", post(gateway_request))
        .route("/internal/forward", post(forwarded_request))
        .route("/keys", get(all_keys))
        .route("/keys/:key_id", get(head))
        .route("/keys/:key_id/chain", get(chain))
        .route("/entries", get(entries))
        .route("/attestations", post(propose))
        .route("/health", get(health))
        .with_state(AppState { gateway })
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NoLeader | GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Rejected(ApplyError::MalformedCommand(_)) => StatusCode::BAD_REQUEST,
        GatewayError::Rejected(ApplyError::SignatureInvalid(_)) => StatusCode::FORBIDDEN,
        GatewayError::Rejected(_) => StatusCode::CONFLICT,
    }
}

fn reply(result: Result<GatewayResponse, GatewayError>) -> Reply {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => status_for(e),
    };
    (status, Json(result))
}

async fn gateway_request(State(s): State<AppState>, Json(req): Json<GatewayRequest>) -> Reply {
    reply(s.gateway.handle(req).await)
}

async fn forwarded_request(State(s): State<AppState>, Json(req): Json<GatewayRequest>) -> Reply {
    reply(s.gateway.handle_forwarded(req).await)
}

async fn all_keys(State(s): State<AppState>) -> Reply { reply(s.gateway.handle(GatewayRequest::GetAllKeys).await) }

async fn head(State(s): State<AppState>, Path(key_id): Path<String>) -> Reply {
    reply(s.gateway.handle(GatewayRequest::GetHead { key_id }).await)
}

async fn chain(State(s): State<AppState>, Path(key_id): Path<String>) -> Reply {
    reply(s.gateway.handle(GatewayRequest::GetChain { key_id }).await)
}

#[derive(Deserialize)]
struct EntriesQuery {
    limit: Option<usize>,
}

async fn entries(State(s): State<AppState>, Query(q): Query<EntriesQuery>) -> Reply {
    let limit = q.limit.unwrap_or(DEFAULT_ENTRIES_LIMIT);
    reply(s.gateway.handle(GatewayRequest::GetEntries { limit }).await)
}

/// Body is the JSON command, passed to the log byte-for-byte.
async fn propose(State(s): State<AppState>, command: String) -> Reply {
    reply(s.gateway.handle(GatewayRequest::Propose { command }).await)
}

async fn health(State(s): State<AppState>) -> Json<Value> {
    let machine = s.gateway.machine();
    Json(json!({
        "version": keyindex_core::version(),
        "node_id": s.gateway.node_id(),
        "leader": s.gateway.known_leader(),
        "applied_position": machine.applied_position(),
        "stats": machine.stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_distinct_statuses() {
        assert_eq!(status_for(&GatewayError::NoLeader), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&GatewayError::Timeout { after_ms: 10 }), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&GatewayError::Rejected(ApplyError::MalformedCommand("x".into()))), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&GatewayError::Rejected(ApplyError::SignatureInvalid("x".into()))), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&GatewayError::Rejected(ApplyError::IndexNotMonotonic { recorded: 2, got: 1 })),
            StatusCode::CONFLICT
        );
    }
}
