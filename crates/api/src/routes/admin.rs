//! Admin routes
//!
//! Protected upstream by the platform's admin gateway; these endpoints
//! are not reachable from the public ingress.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tutorlink_billing::InvariantCheckSummary;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Run a single named check instead of the full suite
    pub check: Option<String>,
}

/// GET /api/admin/invariants - run billing consistency checks
pub async fn run_invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    match query.check {
        Some(name) => {
            let violations = state.billing.invariants.run_check(&name).await?;
            Ok(Json(json!({
                "check": name,
                "violations": violations,
                "healthy": violations.is_empty(),
            })))
        }
        None => {
            let summary: InvariantCheckSummary = state.billing.invariants.run_all_checks().await?;
            if !summary.healthy {
                tracing::warn!(
                    violations = summary.violations.len(),
                    "Billing invariant violations detected"
                );
            }
            Ok(Json(json!(summary)))
        }
    }
}
