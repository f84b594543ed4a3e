//! Subscription routes: current state, change preview, commit, cancel

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tutorlink_billing::{ChangePreview, CommitOutcome, Subscription};

use crate::error::{ApiError, ApiResult};
use crate::routes::SubscriberId;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Option<Subscription>,
}

/// GET /api/subscription - the caller's current active subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    SubscriberId(subscriber_id): SubscriberId,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .changes
        .current_subscription(subscriber_id)
        .await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub target_plan_id: Uuid,
}

/// GET /api/subscription/preview?target_plan_id=... - read-only proration
/// preview. Safe to poll while the subscriber decides.
pub async fn preview_change(
    State(state): State<AppState>,
    SubscriberId(subscriber_id): SubscriberId,
    Query(query): Query<PreviewQuery>,
) -> ApiResult<Json<ChangePreview>> {
    let preview = state
        .billing
        .changes
        .preview_change(subscriber_id, query.target_plan_id)
        .await?;
    Ok(Json(preview))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub target_plan_id: Uuid,
    /// Client-generated key; retries of the same request must reuse it
    pub idempotency_key: String,
    /// Stored payment method reference, required when money is due
    #[serde(default)]
    pub payment_method_ref: String,
}

/// POST /api/subscription/change - commit a plan change.
///
/// The amount charged is recomputed server-side; the request never
/// carries a monetary figure.
pub async fn change_plan(
    State(state): State<AppState>,
    SubscriberId(subscriber_id): SubscriberId,
    Json(request): Json<ChangePlanRequest>,
) -> ApiResult<Json<CommitOutcome>> {
    if request.idempotency_key.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "idempotency_key must not be empty".to_string(),
        ));
    }

    tracing::info!(
        subscriber_id = %subscriber_id,
        target_plan_id = %request.target_plan_id,
        idempotency_key = %request.idempotency_key,
        "Plan change requested"
    );

    let outcome = state
        .billing
        .changes
        .execute_change(
            subscriber_id,
            request.target_plan_id,
            &request.idempotency_key,
            &request.payment_method_ref,
        )
        .await?;

    Ok(Json(outcome))
}

/// POST /api/subscription/cancel - cancel at period end
pub async fn cancel(
    State(state): State<AppState>,
    SubscriberId(subscriber_id): SubscriberId,
) -> ApiResult<Json<SubscriptionResponse>> {
    let cancelled = state.billing.changes.cancel(subscriber_id).await?;
    Ok(Json(SubscriptionResponse {
        subscription: Some(cancelled),
    }))
}
