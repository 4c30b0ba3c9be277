use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::allocator::{allocate, AllocationReport};
use crate::config::Config;
use crate::ledger::{Donation, LedgerStore, ScrapeProgress};

#[derive(Clone)]
struct ApiState {
    config: Config,
    db_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    ok: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorBody {
            ok: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CheckRequest {
    eth_address: Option<String>,
    identity: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    identity: Option<String>,
    total_contributed_eth: Decimal,
    eligible_eth: Decimal,
    eligible: bool,
    budget_exhausted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DonationsQuery {
    /// RFC 3339 lower bound on the donation timestamp.
    after: Option<String>,
}

#[derive(Debug, Serialize)]
struct DonationsResponse {
    donations: Vec<Donation>,
}

#[derive(Debug, Serialize)]
struct RecentTotalResponse {
    window_hours: i64,
    total_eth: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct NoteRequest {
    from_address: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct NoteResponse {
    accepted: bool,
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    progress: Vec<ScrapeProgress>,
}

pub async fn run_server(config: Config, bind: SocketAddr) -> Result<()> {
    let state = ApiState {
        db_path: config.resolved_db_path(),
        config,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/check", post(check))
        .route("/v1/donations", get(donations))
        .route("/v1/donations/recent-total", get(recent_total))
        .route("/v1/note", post(put_note))
        .route("/v1/allocations", get(allocations))
        .route("/v1/progress", get(progress))
        .route("/v1/config", get(show_config))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("REST API listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<ApiResponse<HealthResponse>> {
    ok(HealthResponse { status: "ok" })
}

async fn show_config(State(state): State<ApiState>) -> Json<ApiResponse<Config>> {
    ok(state.config.redacted())
}

/// Eligibility lookup by claimed identity or by donor address. An address
/// resolves to the identity its most recent donation claimed.
async fn check(
    State(state): State<ApiState>,
    Json(request): Json<CheckRequest>,
) -> ApiResult<CheckResponse> {
    let store = open_store(&state)?;
    let identity = match (&request.identity, &request.eth_address) {
        (Some(identity), _) => Some(identity.clone()),
        (None, Some(address)) => store
            .latest_identity_for(address)
            .map_err(ApiError::internal)?,
        (None, None) => {
            return Err(ApiError::bad_request(
                "provide either identity or eth_address",
            ))
        }
    };

    let report = build_report(&state, &store)?;
    let entry = identity
        .as_deref()
        .and_then(|identity| report.entry(identity));
    Ok(ok(CheckResponse {
        identity,
        total_contributed_eth: entry.map(|e| e.total_contributed_eth).unwrap_or_default(),
        eligible_eth: entry.map(|e| e.eligible_eth).unwrap_or_default(),
        eligible: entry.is_some_and(|e| e.eligible_eth > Decimal::ZERO),
        budget_exhausted: report.cutoff.is_some(),
    }))
}

async fn donations(
    State(state): State<ApiState>,
    Query(query): Query<DonationsQuery>,
) -> ApiResult<DonationsResponse> {
    let store = open_store(&state)?;
    let donations = match query.after.as_deref() {
        Some(raw) => {
            let after = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| ApiError::bad_request(format!("invalid after timestamp: {e}")))?
                .with_timezone(&Utc);
            store.donations_after(after).map_err(ApiError::internal)?
        }
        None => store.donations_ordered().map_err(ApiError::internal)?,
    };
    Ok(ok(DonationsResponse { donations }))
}

async fn recent_total(State(state): State<ApiState>) -> ApiResult<RecentTotalResponse> {
    let store = open_store(&state)?;
    let since = Utc::now() - Duration::hours(24);
    let total_eth = store.total_donated_since(since).map_err(ApiError::internal)?;
    Ok(ok(RecentTotalResponse {
        window_hours: 24,
        total_eth,
    }))
}

async fn put_note(
    State(state): State<ApiState>,
    Json(request): Json<NoteRequest>,
) -> ApiResult<NoteResponse> {
    if request.from_address.trim().is_empty() {
        return Err(ApiError::bad_request("from_address is required"));
    }
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }
    let store = open_store(&state)?;
    store
        .put_note(&request.from_address, request.message.trim())
        .map_err(ApiError::internal)?;
    Ok(ok(NoteResponse { accepted: true }))
}

async fn allocations(State(state): State<ApiState>) -> ApiResult<AllocationReport> {
    let store = open_store(&state)?;
    Ok(ok(build_report(&state, &store)?))
}

async fn progress(State(state): State<ApiState>) -> ApiResult<ProgressResponse> {
    let store = open_store(&state)?;
    let progress = store.progress_rows().map_err(ApiError::internal)?;
    Ok(ok(ProgressResponse { progress }))
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse { ok: true, data })
}

fn open_store(state: &ApiState) -> std::result::Result<LedgerStore, ApiError> {
    LedgerStore::open(&state.db_path).map_err(ApiError::internal)
}

fn build_report(
    state: &ApiState,
    store: &LedgerStore,
) -> std::result::Result<AllocationReport, ApiError> {
    let donations = store.donations_ordered().map_err(ApiError::internal)?;
    Ok(allocate(&donations, &state.config.allocation_params()))
}

#[cfg(test)]
mod tests {
    use super::CheckRequest;

    #[test]
    fn check_request_fields_are_optional() {
        let request: CheckRequest =
            serde_json::from_str(r#"{"eth_address": "0xabc"}"#).expect("parse");
        assert_eq!(request.eth_address.as_deref(), Some("0xabc"));
        assert!(request.identity.is_none());
    }
}
