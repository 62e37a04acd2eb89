//! Row types for the core tables.
//!
//! Enumerated columns (`tier`, `status`, `strategy`) are stored as text and
//! surfaced as strings on the row structs; the typed views live where the
//! logic needs them ([`crate::gateway::features::Tier`],
//! [`crate::gateway::routing::Strategy`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub subscription_tier: String,
    pub subscription_status: String,
    pub subscription_updated_at: Option<DateTime<Utc>>,
    pub bonobot_plan: String,
    pub bonobot_agent_limit: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CloudProvider {
    pub id: Uuid,
    pub org_id: Uuid,
    pub provider_type: String,
    pub credentials_ciphertext: String,
    pub status: String,
    pub region: Option<String>,
    pub is_managed: bool,
    pub managed_usage_tokens: i64,
    pub managed_usage_cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ModelRow {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub model_id: String,
    pub display_name: String,
    pub capabilities: serde_json::Value,
    pub pricing_info: serde_json::Value,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GatewayKey {
    pub id: Uuid,
    #[serde(skip)]
    pub org_id: Uuid,
    #[serde(skip)]
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub team_id: Option<String>,
    pub rate_limit: i32,
    pub allowed_models: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl GatewayKey {
    /// Parse the `allowed_models` JSON (`{"models": [...]}` or a bare array)
    /// into a list; `None` means the key is unrestricted.
    pub fn allowed_model_list(&self) -> Option<Vec<String>> {
        let value = self.allowed_models.as_ref()?;
        let array = value
            .get("models")
            .and_then(|m| m.as_array())
            .or_else(|| value.as_array())?;
        Some(
            array
                .iter()
                .filter_map(|m| m.as_str().map(str::to_string))
                .collect(),
        )
    }
}

/// Outcome of one gateway request, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Error,
    RateLimited,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// A `gateway_requests` row about to be written.
#[derive(Debug, Clone)]
pub struct NewGatewayRequest {
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub team_id: Option<String>,
    pub key_id: Option<Uuid>,
    pub model_requested: String,
    pub model_used: Option<String>,
    pub provider: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cost: f64,
    pub marked_up_cost: Option<f64>,
    pub latency_ms: i32,
    pub status: RequestStatus,
    pub error_message: Option<String>,
    pub is_managed: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GatewayRequest {
    pub id: Uuid,
    #[serde(skip)]
    pub org_id: Uuid,
    pub key_id: Option<Uuid>,
    pub model_requested: String,
    pub model_used: Option<String>,
    pub provider: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cost: f64,
    pub marked_up_cost: Option<f64>,
    pub latency_ms: i32,
    pub status: String,
    pub error_message: Option<String>,
    pub is_managed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GatewayConfig {
    #[serde(skip)]
    pub id: Uuid,
    #[serde(skip)]
    pub org_id: Uuid,
    pub enabled_providers: serde_json::Value,
    pub routing_strategy: String,
    pub fallback_models: serde_json::Value,
    pub default_rate_limit: i32,
    pub cost_tracking_enabled: bool,
    pub custom_routing_rules: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl GatewayConfig {
    /// Ordered fallback list configured for a requested model, if any.
    pub fn fallbacks_for(&self, model: &str) -> Vec<String> {
        self.fallback_models
            .get(model)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RoutingPolicy {
    pub id: Uuid,
    #[serde(skip)]
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub strategy: String,
    pub models: serde_json::Value,
    pub rules: serde_json::Value,
    pub is_active: bool,
    pub api_key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One `models` entry inside a routing policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyModel {
    pub model_id: String,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default = "default_policy_role")]
    pub role: String,
}

fn default_policy_role() -> String {
    "primary".to_string()
}

impl RoutingPolicy {
    pub fn model_entries(&self) -> Vec<PolicyModel> {
        serde_json::from_value(self.models.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLog {
    pub id: Uuid,
    #[serde(skip)]
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details_json: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key_with_allowed(allowed: Option<serde_json::Value>) -> GatewayKey {
        GatewayKey {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            key_hash: "h".into(),
            key_prefix: "bn-abc123def".into(),
            name: "test".into(),
            team_id: None,
            rate_limit: 60,
            allowed_models: allowed,
            created_at: Utc::now(),
            revoked_at: None,
        }
    }

    #[test]
    fn allowed_models_absent_means_unrestricted() {
        assert!(key_with_allowed(None).allowed_model_list().is_none());
    }

    #[test]
    fn allowed_models_parses_wrapped_object_form() {
        let key = key_with_allowed(Some(json!({ "models": ["gpt-4o", "claude-3-5-sonnet"] })));
        assert_eq!(
            key.allowed_model_list().unwrap(),
            vec!["gpt-4o", "claude-3-5-sonnet"]
        );
    }

    #[test]
    fn allowed_models_parses_bare_array_form() {
        let key = key_with_allowed(Some(json!(["gpt-4o"])));
        assert_eq!(key.allowed_model_list().unwrap(), vec!["gpt-4o"]);
    }

    #[test]
    fn fallbacks_for_returns_configured_chain() {
        let config = GatewayConfig {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            enabled_providers: json!({}),
            routing_strategy: "failover".into(),
            fallback_models: json!({ "gpt-4o": ["claude-3-5-sonnet", "gemini-pro"] }),
            default_rate_limit: 60,
            cost_tracking_enabled: true,
            custom_routing_rules: json!({}),
            updated_at: Utc::now(),
        };
        assert_eq!(
            config.fallbacks_for("gpt-4o"),
            vec!["claude-3-5-sonnet", "gemini-pro"]
        );
        assert!(config.fallbacks_for("unknown").is_empty());
    }

    #[test]
    fn policy_model_role_defaults_to_primary() {
        let entry: PolicyModel = serde_json::from_value(json!({ "model_id": "gpt-4o" })).unwrap();
        assert_eq!(entry.role, "primary");
        assert!(entry.weight.is_none());
    }
}
