//! Axum HTTP service for the attestation engine.
//!
//! Routes:
//!   POST /claims                       - submit a claim
//!   GET  /claims                       - list claims (status, team, limit, offset)
//!   GET  /claims/{id}                  - claim with votes and mirror records
//!   POST /claims/{id}/attestations     - attest
//!   POST /claims/{id}/disputes         - dispute
//!   POST /claims/{id}/investigate      - open disputes to INVESTIGATING
//!   POST /claims/{id}/resolve          - close a DISPUTED claim
//!   POST /claims/{id}/reanchor         - retry the chain anchor
//!   GET  /reputation/{identity}        - reputation record
//!   GET  /reputation/{identity}/history
//!   GET  /leaderboard
//!   GET  /health

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::engine::{AttestRequest, DisputeRequest, Engine, ResolveRequest, SubmitClaim};
use crate::error::EngineError;
use crate::store::ClaimFilter;

pub const IDENTITY_HEADER: &str = "X-Caller-Identity";
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_key: Option<String>,
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub ledger: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

/// Body of every non-2xx response, and of 202 "mirroring pending" answers.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum ApiError {
    MissingIdentity,
    BadApiKey,
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

fn classify(err: &EngineError) -> (StatusCode, &'static str) {
    match err {
        EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        EngineError::DuplicateClaim(_) => (StatusCode::CONFLICT, "duplicate_claim"),
        EngineError::DuplicateAttestation { .. } => (StatusCode::CONFLICT, "already_verified"),
        EngineError::DuplicateDispute { .. } => (StatusCode::CONFLICT, "duplicate_dispute"),
        EngineError::ConflictingVote { .. } => (StatusCode::CONFLICT, "conflicting_vote"),
        EngineError::ClaimClosed { .. } => (StatusCode::CONFLICT, "claim_closed"),
        EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        EngineError::SelfVerification { .. } => (StatusCode::FORBIDDEN, "self_verification"),
        EngineError::InsufficientReputation { .. } => {
            (StatusCode::FORBIDDEN, "insufficient_reputation")
        }
        EngineError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        EngineError::ChainUnavailable { .. } => (StatusCode::ACCEPTED, "chain_unavailable"),
        EngineError::ChainTimeout { .. } => (StatusCode::ACCEPTED, "chain_timeout"),
        EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::MissingIdentity => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "missing_identity",
                    message: format!("{IDENTITY_HEADER} header is required"),
                    claim_id: None,
                },
            ),
            ApiError::BadApiKey => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "invalid_api_key",
                    message: format!("{API_KEY_HEADER} header is missing or wrong"),
                    claim_id: None,
                },
            ),
            ApiError::Engine(err) => {
                let (status, code) = classify(&err);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                } else if err.is_mirror_pending() {
                    warn!(error = %err, "Accepted with chain mirroring pending");
                }
                let claim_id = match &err {
                    EngineError::ChainUnavailable { claim_id, .. }
                    | EngineError::ChainTimeout { claim_id, .. } => Some(*claim_id),
                    _ => None,
                };
                (
                    status,
                    ErrorBody {
                        error: code,
                        message: err.to_string(),
                        claim_id,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Build the Axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/claims", post(handle_submit).get(handle_list))
        .route("/claims/{id}", get(handle_claim))
        .route("/claims/{id}/attestations", post(handle_attest))
        .route("/claims/{id}/disputes", post(handle_dispute))
        .route("/claims/{id}/investigate", post(handle_investigate))
        .route("/claims/{id}/resolve", post(handle_resolve))
        .route("/claims/{id}/reanchor", post(handle_reanchor))
        .route("/reputation/{identity}", get(handle_reputation))
        .route("/reputation/{identity}/history", get(handle_history))
        .route("/leaderboard", get(handle_leaderboard))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Authenticate requests using the X-Api-Key header.
fn check_auth(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    if let Some(expected) = &state.api_key {
        match headers.get(API_KEY_HEADER) {
            Some(key) if key.to_str().unwrap_or("") == expected => Ok(()),
            _ => Err(ApiError::BadApiKey),
        }
    } else {
        Ok(()) // No key configured = auth disabled
    }
}

/// Identity asserted by the upstream identity provider.
fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::MissingIdentity)
}

type ApiResult = Result<Response, ApiError>;

fn created<T: Serialize>(body: T) -> ApiResult {
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

fn ok<T: Serialize>(body: T) -> ApiResult {
    Ok(Json(body).into_response())
}

/// POST /claims - submit a claim as the caller.
async fn handle_submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SubmitClaim>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    let submitter = caller(&headers)?;
    created(state.engine.submit(&submitter, req).await?)
}

/// GET /claims - filtered, newest first.
async fn handle_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<ClaimFilter>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    ok(state.engine.list_claims(&filter).await?)
}

/// GET /claims/{id}
async fn handle_claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    ok(state.engine.claim_detail(id).await?)
}

/// POST /claims/{id}/attestations
async fn handle_attest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<AttestRequest>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    let verifier = caller(&headers)?;
    created(state.engine.attest(id, &verifier, req).await?)
}

/// POST /claims/{id}/disputes
async fn handle_dispute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<DisputeRequest>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    let disputer = caller(&headers)?;
    created(state.engine.dispute(id, &disputer, req).await?)
}

/// POST /claims/{id}/investigate - resolvers only.
async fn handle_investigate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    let resolver = caller(&headers)?;
    ok(state.engine.investigate(id, &resolver).await?)
}

/// POST /claims/{id}/resolve - resolvers only.
async fn handle_resolve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    let resolver = caller(&headers)?;
    ok(state.engine.resolve(id, &resolver, req).await?)
}

/// POST /claims/{id}/reanchor
async fn handle_reanchor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    ok(state.engine.reanchor(id).await?)
}

/// GET /reputation/{identity}
async fn handle_reputation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(identity): Path<String>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    ok(state.engine.reputation(&identity).await?)
}

/// GET /reputation/{identity}/history
async fn handle_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(identity): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    ok(state
        .engine
        .reputation_history(&identity, query.limit)
        .await?)
}

/// GET /leaderboard
async fn handle_leaderboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    check_auth(&headers, &state)?;
    ok(state.engine.leaderboard(query.limit).await?)
}

/// GET /health - health check.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger: state.engine.mirror().node_name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::harness;
    use axum::http::HeaderValue;
    use matchproof_core::VerifierRole;

    fn state(api_key: Option<&str>) -> Arc<AppState> {
        Arc::new(AppState {
            engine: Arc::new(harness().engine),
            api_key: api_key.map(str::to_string),
        })
    }

    fn headers(identity: &str, key: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(IDENTITY_HEADER, HeaderValue::from_str(identity).unwrap());
        if let Some(key) = key {
            headers.insert(API_KEY_HEADER, HeaderValue::from_str(key).unwrap());
        }
        headers
    }

    fn submit_body() -> SubmitClaim {
        SubmitClaim {
            home_team: "Red Lions".into(),
            away_team: "Blue Sharks".into(),
            home_score: 4,
            away_score: 0,
            metadata: Some("league round 3".into()),
            external_ref: Some("match-0042".into()),
            played_at: None,
        }
    }

    #[tokio::test]
    async fn test_submit_then_duplicate_is_conflict() {
        let state = state(None);
        let response = handle_submit(State(state.clone()), headers("alice", None), Json(submit_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let err = handle_submit(State(state), headers("bob", None), Json(submit_body()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_api_key_and_identity_are_enforced() {
        let state = state(Some("s3cret"));
        let err = handle_submit(State(state.clone()), headers("alice", None), Json(submit_body()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        let err = handle_submit(State(state.clone()), HeaderMap::new(), Json(submit_body()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        let response = handle_submit(
            State(state),
            headers("alice", Some("s3cret")),
            Json(submit_body()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_self_attestation_is_forbidden_and_unknown_claim_404() {
        let state = state(None);
        let claim = state
            .engine
            .submit("alice", submit_body())
            .await
            .unwrap();
        let player = AttestRequest {
            role: VerifierRole::Player,
        };
        let err = handle_attest(State(state.clone()), headers("alice", None), Path(claim.id), Json(player))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

        let err = handle_claim(State(state), headers("alice", None), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_mirror_pending_maps_to_accepted() {
        let claim_id = Uuid::new_v4();
        let response = ApiError::Engine(EngineError::ChainTimeout {
            claim_id,
            tx_id: "abc".into(),
            rounds: 4,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let response = ApiError::Engine(EngineError::Validation("bad".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
