//! Plan-change proration calculator.
//!
//! One pure, integer-only function shared by the preview and commit
//! paths. Both the read-only preview endpoint and the orchestrator's
//! server-side recompute call `compute_preview` with the same inputs, so
//! the number the subscriber confirmed is the number that gets charged.
//!
//! All money is in minor currency units (cents). A single rounding rule
//! (round-half-up, see [`div_round`]) is used for every conversion;
//! mixing rules between preview and commit would be a correctness bug,
//! not a cosmetic one.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{Plan, PlanFeatures};
use crate::subscription::Subscription;

const SECONDS_PER_DAY: i64 = 86_400;

/// Cap on days granted when converting credit into time on a cheaper
/// plan. Bounds pathological conversions onto near-zero-price plans.
pub const MAX_CREDIT_DAYS: i32 = 365;

/// Result of previewing a plan change. Transient; never persisted except
/// as part of a committed ledger outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePreview {
    pub is_upgrade: bool,
    pub is_downgrade: bool,
    pub current_plan_id: Uuid,
    pub target_plan_id: Uuid,
    pub current_plan_name: String,
    pub target_plan_name: String,
    pub current_plan_price_cents: i64,
    pub target_plan_price_cents: i64,
    /// Ceiling of remaining time in the current cycle, >= 0
    pub days_remaining: i32,
    /// Length of the current cycle in days, >= 1
    pub total_days: i32,
    /// Unused value of the current plan, in cents
    pub credit_cents: i64,
    /// Amount to charge immediately; only nonzero for upgrades
    pub amount_due_cents: i64,
    /// Extra days of the cheaper plan; only nonzero for downgrades
    pub credit_days_granted: i32,
    pub gained_features: Vec<String>,
    pub lost_features: Vec<String>,
}

/// Integer division rounded half-up. Both operands must be non-negative
/// and `denom` nonzero; widened to i128 so cents * days cannot overflow.
fn div_round(numer: i64, denom: i64) -> i64 {
    debug_assert!(numer >= 0 && denom > 0);
    let (n, d) = (numer as i128, denom as i128);
    ((n * 2 + d) / (d * 2)) as i64
}

/// Compute the proration preview for switching `subscription` from
/// `current_plan` to `target_plan` at instant `now`.
///
/// Pure and total: never fails for valid inputs. When `now` is at or
/// past the cycle end there is no unused value to credit and the preview
/// degenerates to a full-price charge for upgrades.
///
/// Policy for downgrades to a zero-price plan: the credit cannot be
/// converted into days of a plan with no per-day value, so it is
/// forfeited (`credit_days_granted = 0`); the preview still reports
/// `credit_cents` so callers can display what is given up. Grants onto
/// nonzero-price plans are capped at [`MAX_CREDIT_DAYS`].
pub fn compute_preview(
    subscription: &Subscription,
    current_plan: &Plan,
    target_plan: &Plan,
    now: OffsetDateTime,
) -> ChangePreview {
    let cycle_seconds = (subscription.expires_at - subscription.started_at).whole_seconds();
    let total_days = div_round(cycle_seconds.max(0), SECONDS_PER_DAY).max(1) as i32;

    let remaining_seconds = (subscription.expires_at - now).whole_seconds().max(0);
    // Ceiling: a partially used day still counts as remaining
    let days_remaining = ((remaining_seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY) as i32;

    // A freshly started odd-length cycle can ceiling one day above the
    // rounded total; clamp so the credit never exceeds the price paid.
    let credited_days = days_remaining.min(total_days) as i64;
    let credit_cents = div_round(
        credited_days * current_plan.price_cents,
        total_days as i64,
    );

    let is_upgrade = target_plan.price_cents > current_plan.price_cents;
    let is_downgrade = target_plan.price_cents < current_plan.price_cents;

    let amount_due_cents = if is_upgrade {
        (target_plan.price_cents - credit_cents).max(0)
    } else {
        0
    };

    let credit_days_granted = if is_downgrade && target_plan.price_cents > 0 {
        let days = div_round(
            credit_cents.saturating_mul(total_days as i64),
            target_plan.price_cents,
        );
        (days as i32).min(MAX_CREDIT_DAYS)
    } else {
        0
    };

    let (gained_features, lost_features) =
        diff_features(&current_plan.features, &target_plan.features);

    ChangePreview {
        is_upgrade,
        is_downgrade,
        current_plan_id: current_plan.id,
        target_plan_id: target_plan.id,
        current_plan_name: current_plan.name.clone(),
        target_plan_name: target_plan.name.clone(),
        current_plan_price_cents: current_plan.price_cents,
        target_plan_price_cents: target_plan.price_cents,
        days_remaining,
        total_days,
        credit_cents,
        amount_due_cents,
        credit_days_granted,
        gained_features,
        lost_features,
    }
}

fn children_label(limit: Option<i32>) -> String {
    match limit {
        None => "Unlimited child profiles".to_string(),
        Some(1) => "1 child profile".to_string(),
        Some(n) => format!("{} child profiles", n),
    }
}

/// `None` means unlimited and is always >= any finite limit
fn limit_increased(current: Option<i32>, target: Option<i32>) -> bool {
    match (current, target) {
        (Some(_), None) => true,
        (None, _) => false,
        (Some(c), Some(t)) => t > c,
    }
}

/// Diff two capability sets into human-readable gained/lost entries.
/// Field order is fixed so the output is deterministic.
pub fn diff_features(current: &PlanFeatures, target: &PlanFeatures) -> (Vec<String>, Vec<String>) {
    let mut gained = Vec::new();
    let mut lost = Vec::new();

    if limit_increased(current.max_children, target.max_children) {
        gained.push(format!(
            "{} (was {})",
            children_label(target.max_children),
            children_label(current.max_children).to_lowercase()
        ));
    } else if limit_increased(target.max_children, current.max_children) {
        lost.push(format!(
            "{} (was {})",
            children_label(target.max_children),
            children_label(current.max_children).to_lowercase()
        ));
    }

    if target.includes_paid_resources && !current.includes_paid_resources {
        gained.push("Paid learning resources included".to_string());
    } else if current.includes_paid_resources && !target.includes_paid_resources {
        lost.push("Paid learning resources included".to_string());
    }

    if target.max_resource_downloads > current.max_resource_downloads {
        gained.push(format!(
            "{} resource downloads per month (was {})",
            target.max_resource_downloads, current.max_resource_downloads
        ));
    } else if target.max_resource_downloads < current.max_resource_downloads {
        lost.push(format!(
            "{} resource downloads per month (was {})",
            target.max_resource_downloads, current.max_resource_downloads
        ));
    }

    if target.has_priority_support && !current.has_priority_support {
        gained.push("Priority support".to_string());
    } else if current.has_priority_support && !target.has_priority_support {
        lost.push("Priority support".to_string());
    }

    if target.has_advanced_analytics && !current.has_advanced_analytics {
        gained.push("Advanced progress analytics".to_string());
    } else if current.has_advanced_analytics && !target.has_advanced_analytics {
        lost.push("Advanced progress analytics".to_string());
    }

    (gained, lost)
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::subscription::{Subscription, SubscriptionStatus};

    fn plan(name: &str, price_cents: i64) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: name.to_string(),
            price_cents,
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

    fn subscription_on(plan_id: Uuid, started_at: OffsetDateTime, days: i64) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            subscriber_id: Uuid::new_v4(),
            plan_id,
            status: SubscriptionStatus::Active,
            started_at,
            expires_at: started_at + Duration::days(days),
            version: 1,
        }
    }

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn div_round_rounds_half_up() {
        assert_eq!(div_round(20_000, 30), 667); // 666.67
        assert_eq!(div_round(10, 4), 3); // 2.5
        assert_eq!(div_round(9, 3), 3);
        assert_eq!(div_round(0, 7), 0);
    }

    // Spec scenario: 1000 cents, 30-day cycle, day 10 -> credit 667;
    // target 2000 -> due 1333
    #[test]
    fn upgrade_at_day_ten() {
        let current = plan("Family", 1000);
        let target = plan("Premium", 2000);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(10));

        assert!(preview.is_upgrade);
        assert!(!preview.is_downgrade);
        assert_eq!(preview.total_days, 30);
        assert_eq!(preview.days_remaining, 20);
        assert_eq!(preview.credit_cents, 667);
        assert_eq!(preview.amount_due_cents, 1333);
        assert_eq!(preview.credit_days_granted, 0);
    }

    // Spec scenario: target 500 (downgrade) -> 40 credit days
    #[test]
    fn downgrade_at_day_ten() {
        let current = plan("Premium", 1000);
        let target = plan("Family", 500);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(10));

        assert!(preview.is_downgrade);
        assert_eq!(preview.credit_cents, 667);
        assert_eq!(preview.credit_days_granted, 40);
        assert_eq!(preview.amount_due_cents, 0);
    }

    // Spec scenario: now == expires_at -> no unused value, full price due
    #[test]
    fn expired_cycle_has_no_credit() {
        let current = plan("Family", 1000);
        let target = plan("Premium", 2000);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, sub.expires_at);

        assert_eq!(preview.days_remaining, 0);
        assert_eq!(preview.credit_cents, 0);
        assert_eq!(preview.amount_due_cents, 2000);
    }

    #[test]
    fn past_expiry_is_degenerate_not_negative() {
        let current = plan("Family", 1000);
        let target = plan("Premium", 2000);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, sub.expires_at + Duration::days(3));

        assert_eq!(preview.days_remaining, 0);
        assert_eq!(preview.credit_cents, 0);
        assert_eq!(preview.amount_due_cents, 2000);
    }

    #[test]
    fn equal_price_is_neither_upgrade_nor_downgrade() {
        let current = plan("Family", 1000);
        let target = plan("Family Annual Promo", 1000);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(10));

        assert!(!preview.is_upgrade);
        assert!(!preview.is_downgrade);
        assert_eq!(preview.amount_due_cents, 0);
        assert_eq!(preview.credit_days_granted, 0);
    }

    #[test]
    fn credit_never_exceeds_target_price() {
        // Large credit fully covers a slightly pricier plan mid-cycle
        let current = plan("Premium", 5000);
        let target = plan("Premium Plus", 5100);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(1));

        assert!(preview.credit_cents <= 5000);
        assert!(preview.amount_due_cents >= 0);
        // Conservation: never undercharge or overcharge past full price
        assert!(preview.credit_cents + preview.amount_due_cents >= 5100);
        assert!(preview.amount_due_cents <= 5100);
    }

    #[test]
    fn conservation_holds_across_the_cycle() {
        let current = plan("Family", 999);
        let target = plan("Premium", 2499);
        let sub = subscription_on(current.id, t0(), 30);

        for day in 0..=30 {
            let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(day));
            assert!(
                preview.credit_cents + preview.amount_due_cents >= 2499,
                "undercharged at day {}",
                day
            );
            assert!(preview.amount_due_cents <= 2499, "overcharged at day {}", day);
        }
    }

    #[test]
    fn downgrade_to_free_plan_forfeits_credit() {
        let current = plan("Premium", 2000);
        let target = plan("Free", 0);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(10));

        assert!(preview.is_downgrade);
        assert!(preview.credit_cents > 0);
        assert_eq!(preview.credit_days_granted, 0);
    }

    #[test]
    fn credit_days_capped_on_near_free_plans() {
        let current = plan("Premium", 10_000);
        let target = plan("Penny", 1);
        let sub = subscription_on(current.id, t0(), 30);

        let preview = compute_preview(&sub, &current, &target, t0() + Duration::days(10));

        assert_eq!(preview.credit_days_granted, MAX_CREDIT_DAYS);
    }

    // Fresh odd-length cycle: the ceiling puts days_remaining one above
    // the rounded total; the credit still tops out at the price paid
    #[test]
    fn fresh_odd_length_cycle_credit_capped_at_full_price() {
        let current = plan("Family", 1000);
        let target = plan("Premium", 2000);
        let mut sub = subscription_on(current.id, t0(), 29);
        sub.expires_at += Duration::hours(9); // 29.375-day cycle

        let preview = compute_preview(&sub, &current, &target, t0());

        assert_eq!(preview.total_days, 29); // 29.375 rounds down
        assert_eq!(preview.days_remaining, 30); // ceiling of 29.375
        assert_eq!(preview.credit_cents, 1000);
        assert_eq!(preview.amount_due_cents, 1000);
    }

    #[test]
    fn preview_is_deterministic() {
        let current = plan("Family", 1234);
        let target = plan("Premium", 5678);
        let sub = subscription_on(current.id, t0(), 31);
        let now = t0() + Duration::days(13) + Duration::hours(7);

        let a = compute_preview(&sub, &current, &target, now);
        let b = compute_preview(&sub, &current, &target, now);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_length_cycle_clamps_to_one_day() {
        let current = plan("Family", 1000);
        let target = plan("Premium", 2000);
        let mut sub = subscription_on(current.id, t0(), 30);
        sub.expires_at = sub.started_at; // degenerate input

        let preview = compute_preview(&sub, &current, &target, t0());
        assert_eq!(preview.total_days, 1);
    }

    #[test]
    fn feature_diff_upgrade_gains() {
        let free = Plan::free();
        let premium = Plan::premium(1999);

        let (gained, lost) = diff_features(&free.features, &premium.features);

        assert!(lost.is_empty());
        assert_eq!(
            gained,
            vec![
                "Unlimited child profiles (was 1 child profile)".to_string(),
                "Paid learning resources included".to_string(),
                "200 resource downloads per month (was 5)".to_string(),
                "Priority support".to_string(),
                "Advanced progress analytics".to_string(),
            ]
        );
    }

    #[test]
    fn feature_diff_downgrade_mirrors() {
        let premium = Plan::premium(1999);
        let family = Plan::family(999);

        let (gained, lost) = diff_features(&premium.features, &family.features);

        assert!(gained.is_empty());
        assert_eq!(lost.len(), 4); // children, downloads, support, analytics
    }
}
