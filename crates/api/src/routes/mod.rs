//! HTTP route handlers

pub mod admin;
pub mod plans;
pub mod subscription;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/plans", get(plans::list_plans))
        .route("/api/subscription", get(subscription::get_subscription))
        .route(
            "/api/subscription/preview",
            get(subscription::preview_change),
        )
        .route("/api/subscription/change", post(subscription::change_plan))
        .route("/api/subscription/cancel", post(subscription::cancel))
        .route("/api/admin/invariants", get(admin::run_invariants))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Authenticated subscriber identity.
///
/// The identity provider in front of this service resolves the session
/// and forwards the subscriber id in the `x-subscriber-id` header.
pub struct SubscriberId(pub Uuid);

impl<S> FromRequestParts<S> for SubscriberId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-subscriber-id")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let id = Uuid::parse_str(header).map_err(|_| ApiError::Unauthorized)?;
        Ok(SubscriberId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn subscriber_id_requires_valid_uuid_header() {
        let id = Uuid::new_v4();
        let request = Request::builder()
            .header("x-subscriber-id", id.to_string())
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let extracted = SubscriberId::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(extracted.0, id);
    }

    #[tokio::test]
    async fn subscriber_id_rejects_missing_or_garbage_header() {
        let request = Request::builder().body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        assert!(SubscriberId::from_request_parts(&mut parts, &())
            .await
            .is_err());

        let request = Request::builder()
            .header("x-subscriber-id", "not-a-uuid")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        assert!(SubscriberId::from_request_parts(&mut parts, &())
            .await
            .is_err());
    }
}
