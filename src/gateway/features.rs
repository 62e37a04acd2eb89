//! Subscription-tier feature and quota gates.
//!
//! A static matrix maps `(tier, feature) → bool` and `(tier, limit) → cap`;
//! denials surface as `402 upgrade_required`. The only runtime state is the
//! monthly gateway-call counter in the shared cache, keyed
//! `gateway_calls:{org_id}:{YYYY-MM}` — resets are implicit because the key
//! changes each month.

use chrono::{Datelike, Utc};
use uuid::Uuid;

use crate::{db::models::Organization, error::GatewayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "starter" => Self::Starter,
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// The gateway itself — available on every tier.
    Gateway,
    Routing,
    BudgetAlerts,
    Compliance,
    IacTemplates,
    Sso,
    KnowledgeBase,
}

impl Feature {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Routing => "routing",
            Self::BudgetAlerts => "budget_alerts",
            Self::Compliance => "compliance",
            Self::IacTemplates => "iac_templates",
            Self::Sso => "sso",
            Self::KnowledgeBase => "knowledge_base",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Providers,
    Members,
    GatewayCallsPerMonth,
}

/// `(tier, feature) → allowed`.
pub fn tier_allows(tier: Tier, feature: Feature) -> bool {
    use Feature::*;
    use Tier::*;
    match feature {
        Gateway => true,
        Routing | IacTemplates | KnowledgeBase => tier >= Pro,
        BudgetAlerts => tier >= Starter,
        Compliance | Sso => tier == Enterprise,
    }
}

/// `(tier, limit) → cap`; `None` is unlimited.
pub fn tier_limit(tier: Tier, limit: Limit) -> Option<i64> {
    use Limit::*;
    use Tier::*;
    match (tier, limit) {
        (Free, Providers) => Some(1),
        (Free, Members) => Some(3),
        (Free, GatewayCallsPerMonth) => Some(10_000),
        (Starter, Providers) => Some(3),
        (Starter, Members) => Some(10),
        (Starter, GatewayCallsPerMonth) => Some(100_000),
        (Pro, Providers) => Some(10),
        (Pro, Members) => Some(50),
        (Pro, GatewayCallsPerMonth) => Some(1_000_000),
        (Enterprise, _) => None,
    }
}

/// Cache key for the current month's gateway-call counter.
pub fn monthly_counter_key(org_id: Uuid) -> String {
    let now = Utc::now();
    format!("gateway_calls:{org_id}:{:04}-{:02}", now.year(), now.month())
}

/// Load the org row; 401 if the key's org has vanished.
pub async fn load_org(db: &sqlx::PgPool, org_id: Uuid) -> Result<Organization, GatewayError> {
    crate::db::orgs::find(db, org_id)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("org lookup failed: {e}")))?
        .ok_or_else(|| GatewayError::Auth("organization not found".into()))
}

/// `402 upgrade_required` when the org's tier lacks the feature.
pub fn require_feature(org: &Organization, feature: Feature) -> Result<(), GatewayError> {
    let tier = Tier::parse(&org.subscription_tier);
    if tier_allows(tier, feature) {
        Ok(())
    } else {
        Err(GatewayError::UpgradeRequired(format!(
            "feature `{}` requires a higher subscription tier",
            feature.name()
        )))
    }
}

/// Enforce the monthly gateway-call quota against the cache counter.
pub async fn require_gateway_quota(
    cache: &deadpool_redis::Pool,
    org: &Organization,
) -> Result<(), GatewayError> {
    let Some(cap) = tier_limit(Tier::parse(&org.subscription_tier), Limit::GatewayCallsPerMonth)
    else {
        return Ok(());
    };

    let mut conn = cache
        .get()
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("usage cache unavailable: {e}")))?;
    let current: Option<i64> = redis::cmd("GET")
        .arg(monthly_counter_key(org.id))
        .query_async(&mut conn)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("usage cache unavailable: {e}")))?;

    if current.unwrap_or(0) >= cap {
        return Err(GatewayError::UpgradeRequired(format!(
            "monthly gateway call limit of {cap} reached for the current tier"
        )));
    }
    Ok(())
}

/// Bump the monthly counter. Called by the recorder, off the response path.
/// TTL of 35 days lets stale month keys expire on their own.
pub async fn increment_gateway_counter(cache: &deadpool_redis::Pool, org_id: Uuid) {
    let key = monthly_counter_key(org_id);
    let Ok(mut conn) = cache.get().await else {
        tracing::warn!(%org_id, "usage cache unavailable — monthly counter not incremented");
        return;
    };
    let incremented: Result<i64, _> = redis::cmd("INCR").arg(&key).query_async(&mut conn).await;
    match incremented {
        Ok(1) => {
            let _: Result<(), _> = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(35 * 24 * 3600)
                .query_async(&mut conn)
                .await;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(%org_id, error = %e, "monthly counter increment failed"),
    }
}

/// Admin reset: delete the current month's counter.
pub async fn reset_gateway_counter(
    cache: &deadpool_redis::Pool,
    org_id: Uuid,
) -> Result<(), GatewayError> {
    let mut conn = cache
        .get()
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("usage cache unavailable: {e}")))?;
    redis::cmd("DEL")
        .arg(monthly_counter_key(org_id))
        .query_async::<()>(&mut conn)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("usage cache unavailable: {e}")))?;
    Ok(())
}

/// Managed-inference admission: active managed deployments must stay within
/// the org's agent allowance.
pub async fn require_managed_capacity(
    db: &sqlx::PgPool,
    org: &Organization,
) -> Result<(), GatewayError> {
    let active = crate::db::orgs::active_managed_deployments(db, org.id)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("deployment lookup failed: {e}")))?;
    if active > i64::from(org.bonobot_agent_limit) {
        return Err(GatewayError::UpgradeRequired(format!(
            "managed deployment limit of {} exceeded",
            org.bonobot_agent_limit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_defaults_to_free() {
        assert_eq!(Tier::parse("pro"), Tier::Pro);
        assert_eq!(Tier::parse("enterprise"), Tier::Enterprise);
        assert_eq!(Tier::parse("unknown"), Tier::Free);
        assert_eq!(Tier::parse(""), Tier::Free);
    }

    #[test]
    fn gateway_is_available_on_every_tier() {
        for tier in [Tier::Free, Tier::Starter, Tier::Pro, Tier::Enterprise] {
            assert!(tier_allows(tier, Feature::Gateway));
        }
    }

    #[test]
    fn routing_requires_pro_or_above() {
        assert!(!tier_allows(Tier::Free, Feature::Routing));
        assert!(!tier_allows(Tier::Starter, Feature::Routing));
        assert!(tier_allows(Tier::Pro, Feature::Routing));
        assert!(tier_allows(Tier::Enterprise, Feature::Routing));
    }

    #[test]
    fn compliance_and_sso_are_enterprise_only() {
        assert!(!tier_allows(Tier::Pro, Feature::Compliance));
        assert!(tier_allows(Tier::Enterprise, Feature::Compliance));
        assert!(!tier_allows(Tier::Pro, Feature::Sso));
    }

    #[test]
    fn limits_increase_with_tier_and_enterprise_is_unlimited() {
        assert_eq!(tier_limit(Tier::Free, Limit::Providers), Some(1));
        assert_eq!(tier_limit(Tier::Pro, Limit::Providers), Some(10));
        assert!(tier_limit(Tier::Enterprise, Limit::GatewayCallsPerMonth).is_none());
    }

    #[test]
    fn monthly_counter_key_embeds_org_and_month() {
        let org = Uuid::new_v4();
        let key = monthly_counter_key(org);
        assert!(key.starts_with(&format!("gateway_calls:{org}:")));
        // YYYY-MM suffix
        let suffix = key.rsplit(':').next().unwrap();
        assert_eq!(suffix.len(), 7);
        assert_eq!(&suffix[4..5], "-");
    }

    #[test]
    fn require_feature_denies_with_upgrade_required() {
        let org = Organization {
            id: Uuid::new_v4(),
            name: "acme".into(),
            subscription_tier: "free".into(),
            subscription_status: "active".into(),
            subscription_updated_at: None,
            bonobot_plan: "none".into(),
            bonobot_agent_limit: 0,
            created_at: Utc::now(),
        };
        let err = require_feature(&org, Feature::Routing).unwrap_err();
        assert!(matches!(err, GatewayError::UpgradeRequired(_)));
        assert!(require_feature(&org, Feature::Gateway).is_ok());
    }
}
