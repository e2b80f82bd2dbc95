//! Pipeline handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use sluice_core::ids::PipelineId;
use sluice_core::pipeline::{Pipeline, PipelineDefinition};
use sluice_scheduler::TriggerInfo;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PipelineResponse {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    pub tasks: usize,
    pub triggers: usize,
    pub registered_at: String,
    pub updated_at: String,
}

impl From<&Pipeline> for PipelineResponse {
    fn from(pipeline: &Pipeline) -> Self {
        let definition = &pipeline.definition;
        Self {
            id: pipeline.id().to_string(),
            name: definition.display_name().to_string(),
            description: definition.description.clone(),
            version: pipeline.version,
            tasks: definition.tasks.len(),
            triggers: definition.triggers.len(),
            registered_at: pipeline.registered_at.to_rfc3339(),
            updated_at: pipeline.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListPipelinesResponse {
    pub pipelines: Vec<PipelineResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ListTriggersResponse {
    pub pipeline_id: String,
    pub triggers: Vec<TriggerInfo>,
}

pub async fn list_pipelines(State(state): State<AppState>) -> Json<ListPipelinesResponse> {
    let pipelines = state.scheduler.list_pipelines().await;
    let responses: Vec<PipelineResponse> = pipelines.iter().map(PipelineResponse::from).collect();

    Json(ListPipelinesResponse {
        total: responses.len(),
        pipelines: responses,
    })
}

pub async fn register_pipeline(
    State(state): State<AppState>,
    Json(definition): Json<PipelineDefinition>,
) -> Result<(StatusCode, Json<PipelineResponse>), ApiError> {
    let pipeline = state.scheduler.register_pipeline(definition).await?;
    Ok((StatusCode::CREATED, Json(PipelineResponse::from(&pipeline))))
}

/// Full pipeline, definition included.
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline = state.scheduler.get_pipeline(&PipelineId::new(id)).await?;
    Ok(Json(pipeline))
}

pub async fn list_triggers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ListTriggersResponse>, ApiError> {
    let pipeline_id = PipelineId::new(id);
    let triggers = state.scheduler.list_triggers(&pipeline_id).await?;
    Ok(Json(ListTriggersResponse {
        pipeline_id: pipeline_id.to_string(),
        triggers,
    }))
}
