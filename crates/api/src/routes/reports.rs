//! Report access and generation routes
//!
//! Owner authentication lives in the outer platform; when a request has
//! been authenticated upstream the gateway forwards the verified address
//! in `x-authenticated-email`. Anonymous buyers prove access with the
//! email-bound token from their payment confirmation link.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use supplymatch_billing::{MatchReport, ReportPreview};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub token: Option<String>,
}

/// Full detail when access is proven, preview otherwise
#[derive(Debug, Serialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum ReportResponse {
    Full { report: MatchReport },
    Preview { preview: ReportPreview },
}

pub async fn get_report(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Query(query): Query<ReportQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<ReportResponse>> {
    let report = state
        .payments
        .reports
        .find_by_request(&request_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no report for request {request_id}")))?;

    let header_token = headers
        .get("x-access-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let token = query.token.or(header_token);

    let authenticated_email = headers
        .get("x-authenticated-email")
        .and_then(|v| v.to_str().ok());

    let response = if state
        .payments
        .reports
        .verify_access(&report, token.as_deref(), authenticated_email)
    {
        ReportResponse::Full { report }
    } else {
        ReportResponse::Preview {
            preview: report.preview(),
        }
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub email: String,
}

/// Entitled owner triggers matching for their request.
///
/// A pending report costs one credit; an already unlocked report is
/// regenerated for free.
pub async fn generate_report(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Json<MatchReport>> {
    let account = state
        .payments
        .accounts
        .find_by_email(&req.email)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no account for {}", req.email)))?;

    let report = state
        .payments
        .reports
        .generate_for_account(&account, &request_id)
        .await?;

    Ok(Json(report))
}
