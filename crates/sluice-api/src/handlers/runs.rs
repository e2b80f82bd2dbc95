//! Run handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::ids::{PipelineId, RunId};
use sluice_core::pipeline::Params;
use sluice_core::run::{Run, RunFilter, RunStatus, RunTrigger};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListRunsParams {
    pub pipeline_id: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

impl ListRunsParams {
    fn into_filter(self) -> Result<RunFilter, ApiError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<RunStatus>)
            .transpose()?;
        Ok(RunFilter {
            pipeline_id: self.pipeline_id.map(PipelineId::new),
            status,
            since: self.since,
            until: self.until,
            limit: Some(self.limit),
            offset: self.offset,
        })
    }
}

/// Run summary without per-task detail.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub pipeline_id: String,
    pub pipeline_version: u32,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub reason: Option<String>,
}

impl From<&Run> for RunResponse {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.to_string(),
            pipeline_id: run.pipeline_id.to_string(),
            pipeline_version: run.pipeline_version,
            status: run.status,
            trigger: run.trigger.clone(),
            created_at: run.created_at.to_rfc3339(),
            started_at: run.started_at.map(|t| t.to_rfc3339()),
            completed_at: run.completed_at.map(|t| t.to_rfc3339()),
            duration_ms: run.duration_ms,
            reason: run.reason.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunResponse>,
    /// Runs in this page.
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRunRequest {
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", raw)))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<ListRunsResponse>, ApiError> {
    let filter = params.into_filter()?;
    let runs = state.scheduler.list_runs(&filter).await?;
    let responses: Vec<RunResponse> = runs.iter().map(RunResponse::from).collect();

    Ok(Json(ListRunsResponse {
        count: responses.len(),
        runs: responses,
    }))
}

/// Start a manual run. The body is optional.
pub async fn trigger_run(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
    request: Option<Json<TriggerRunRequest>>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let Json(request) = request.unwrap_or_default();
    let run = state
        .scheduler
        .trigger_run(
            &PipelineId::new(pipeline_id),
            request.params,
            request.requested_by,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(RunResponse::from(&run))))
}

/// Full run, task runs included.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run = state.scheduler.get_run(parse_run_id(&run_id)?).await?;
    Ok(Json(run))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    request: Option<Json<CancelRunRequest>>,
) -> Result<Json<Run>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let run = state
        .scheduler
        .cancel_run(parse_run_id(&run_id)?, request.reason)
        .await?;
    Ok(Json(run))
}
