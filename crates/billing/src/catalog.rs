//! Plan catalog.
//!
//! Plan definitions are static data: a price in minor currency units and a
//! named capability set. A plan referenced by an active subscription
//! snapshot is treated as immutable; price changes create a new plan row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Capability set attached to a plan.
///
/// `max_children: None` means unlimited and compares greater than any
/// finite value in feature diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    pub max_children: Option<i32>,
    pub includes_paid_resources: bool,
    pub max_resource_downloads: i32,
    pub has_priority_support: bool,
    pub has_advanced_analytics: bool,
}

/// Subscription plan definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Price in minor currency units (cents); never floating point
    pub price_cents: i64,
    pub is_active: bool,
    pub features: PlanFeatures,
}

impl Plan {
    /// Free tier: 1 child, 5 resource downloads/month
    pub fn free() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Free".to_string(),
            price_cents: 0,
            is_active: true,
            features: PlanFeatures {
                max_children: Some(1),
                includes_paid_resources: false,
                max_resource_downloads: 5,
                has_priority_support: false,
                has_advanced_analytics: false,
            },
        }
    }

    /// Family tier: 3 children, paid resources, 50 downloads/month
    pub fn family(price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Family".to_string(),
            price_cents,
            is_active: true,
            features: PlanFeatures {
                max_children: Some(3),
                includes_paid_resources: true,
                max_resource_downloads: 50,
                has_priority_support: false,
                has_advanced_analytics: false,
            },
        }
    }

    /// Premium tier: unlimited children, priority support, analytics
    pub fn premium(price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Premium".to_string(),
            price_cents,
            is_active: true,
            features: PlanFeatures {
                max_children: None,
                includes_paid_resources: true,
                max_resource_downloads: 200,
                has_priority_support: true,
                has_advanced_analytics: true,
            },
        }
    }
}

/// Read-only plan lookup
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan>;

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>>;
}

/// Postgres-backed catalog
pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_plan(
        (id, name, price_cents, is_active, features): (Uuid, String, i64, bool, serde_json::Value),
    ) -> BillingResult<Plan> {
        let features: PlanFeatures = serde_json::from_value(features)?;
        Ok(Plan {
            id,
            name,
            price_cents,
            is_active,
            features,
        })
    }
}

#[async_trait]
impl PlanCatalog for PgPlanCatalog {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let row: Option<(Uuid, String, i64, bool, serde_json::Value)> = sqlx::query_as(
            "SELECT id, name, price_cents, is_active, features FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(BillingError::PlanNotFound(plan_id))?;
        Self::row_to_plan(row)
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<(Uuid, String, i64, bool, serde_json::Value)> = sqlx::query_as(
            "SELECT id, name, price_cents, is_active, features
             FROM plans
             WHERE is_active = TRUE
             ORDER BY price_cents ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_plan).collect()
    }
}

/// Fixed in-memory catalog, useful for tests and seed data
pub struct StaticPlanCatalog {
    plans: Vec<Plan>,
}

impl StaticPlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl PlanCatalog for StaticPlanCatalog {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.plans
            .iter()
            .find(|p| p.id == plan_id)
            .cloned()
            .ok_or(BillingError::PlanNotFound(plan_id))
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(self
            .plans
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }
}
