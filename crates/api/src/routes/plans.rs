//! Plan catalog routes

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tutorlink_billing::Plan;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PlanListResponse {
    pub plans: Vec<Plan>,
}

/// GET /api/plans - list plans currently offered for purchase
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<PlanListResponse>> {
    let plans = state.billing.catalog.list_active_plans().await?;
    Ok(Json(PlanListResponse { plans }))
}
