//! Routing engine — turns `(org, requested model)` into an ordered list of
//! `(provider, model)` candidates to attempt.
//!
//! Policy lookup order:
//! 1. A [`RoutingPolicy`] bound to the key's prefix (premium, tier-gated).
//! 2. The org's `GatewayConfig` strategy + fallback chain.
//! 3. Identity fallback: any org provider advertising the requested model.
//!
//! Ordering strategies are pure functions over the candidate set; the only
//! I/O is candidate discovery and the latency EWMAs kept in the shared cache.
//!
//! [`RoutingPolicy`]: crate::db::models::RoutingPolicy

use std::collections::HashMap;

use rand::Rng as _;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    db::models::{GatewayKey, Organization, PolicyModel},
    error::GatewayError,
    providers::pricing,
    state::AppState,
};

use super::features::{self, Feature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CostOptimized,
    LatencyOptimized,
    Balanced,
    Failover,
    AbTest,
}

impl Strategy {
    /// Accepts both `cost_optimized` and the legacy `cost-optimized` spelling
    /// found in older org configs.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.replace('-', "_").as_str() {
            "cost_optimized" => Some(Self::CostOptimized),
            "latency_optimized" => Some(Self::LatencyOptimized),
            "balanced" => Some(Self::Balanced),
            "failover" => Some(Self::Failover),
            "ab_test" => Some(Self::AbTest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CostOptimized => "cost_optimized",
            Self::LatencyOptimized => "latency_optimized",
            Self::Balanced => "balanced",
            Self::Failover => "failover",
            Self::AbTest => "ab_test",
        }
    }
}

/// One attemptable `(provider, model)` pair.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: Uuid,
    pub provider_type: String,
    pub model_id: String,
    pub region: Option<String>,
    pub input_price: f64,
    pub output_price: f64,
    pub capabilities: Vec<String>,
    pub is_managed: bool,
    pub role: String,
    pub weight: Option<u32>,
}

impl Candidate {
    fn price_sum(&self) -> f64 {
        self.input_price + self.output_price
    }

    fn region_matches(&self, preference: Option<&str>) -> bool {
        match (preference, self.region.as_deref()) {
            (Some(want), Some(have)) => want == have,
            _ => false,
        }
    }
}

/// Closed rules schema. Unknown keys are rejected at parse time so config
/// typos fail loudly instead of silently not filtering.
#[derive(Debug, Default, Clone)]
pub struct Rules {
    pub max_cost_per_request: Option<f64>,
    pub max_tokens: Option<u64>,
    pub allowed_capabilities: Option<Vec<String>>,
    pub region_preference: Option<String>,
}

impl Rules {
    const KNOWN_KEYS: &'static [&'static str] = &[
        "max_cost_per_request",
        "max_tokens",
        "allowed_capabilities",
        "region_preference",
    ];

    pub fn parse_closed(value: &Value) -> Result<Self, GatewayError> {
        let Some(object) = value.as_object() else {
            if value.is_null() {
                return Ok(Self::default());
            }
            return Err(GatewayError::validation_field(
                "rules must be an object",
                "rules",
            ));
        };
        for key in object.keys() {
            if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                return Err(GatewayError::validation_field(
                    format!("unknown rule key `{key}`"),
                    "rules",
                ));
            }
        }
        Ok(Self {
            max_cost_per_request: object.get("max_cost_per_request").and_then(Value::as_f64),
            max_tokens: object.get("max_tokens").and_then(Value::as_u64),
            allowed_capabilities: object.get("allowed_capabilities").and_then(|v| {
                v.as_array().map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
            }),
            region_preference: object
                .get("region_preference")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Token count assumed when estimating worst-case request cost.
    fn assumed_tokens(&self) -> u64 {
        self.max_tokens.unwrap_or(1_000)
    }
}

/// Drop candidates the rules exclude. Runs before ordering.
pub fn filter_candidates(candidates: Vec<Candidate>, rules: &Rules) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            if let Some(max_cost) = rules.max_cost_per_request {
                let worst_case = rules.assumed_tokens() as f64 * c.price_sum() / 1e6;
                if worst_case > max_cost {
                    return false;
                }
            }
            if let Some(required) = &rules.allowed_capabilities {
                if !required.iter().all(|cap| c.capabilities.contains(cap)) {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Order candidates per strategy. `latencies` maps [`latency_key`] → EWMA ms;
/// candidates without an observation sort after those with one.
pub fn order_candidates(
    strategy: Strategy,
    mut candidates: Vec<Candidate>,
    latencies: &HashMap<String, f64>,
    region_preference: Option<&str>,
    ab_roll: u32,
) -> Vec<Candidate> {
    let latency_of =
        |c: &Candidate| -> f64 { *latencies.get(&latency_key(&c.provider_type, &c.model_id)).unwrap_or(&f64::INFINITY) };
    let tie_break = |a: &Candidate, b: &Candidate| {
        b.region_matches(region_preference)
            .cmp(&a.region_matches(region_preference))
            .then(a.provider_id.cmp(&b.provider_id))
    };

    match strategy {
        Strategy::CostOptimized => {
            candidates.sort_by(|a, b| {
                a.price_sum()
                    .total_cmp(&b.price_sum())
                    .then_with(|| tie_break(a, b))
            });
            candidates
        }
        Strategy::LatencyOptimized => {
            candidates.sort_by(|a, b| {
                latency_of(a)
                    .total_cmp(&latency_of(b))
                    .then_with(|| tie_break(a, b))
            });
            candidates
        }
        Strategy::Balanced => {
            let rank = |sorted: &[&Candidate], c: &Candidate| {
                sorted
                    .iter()
                    .position(|x| x.provider_id == c.provider_id && x.model_id == c.model_id)
                    .unwrap_or(usize::MAX)
            };
            let mut by_cost: Vec<&Candidate> = candidates.iter().collect();
            by_cost.sort_by(|a, b| a.price_sum().total_cmp(&b.price_sum()));
            let mut by_latency: Vec<&Candidate> = candidates.iter().collect();
            by_latency.sort_by(|a, b| latency_of(a).total_cmp(&latency_of(b)));

            let scores: HashMap<(Uuid, String), usize> = candidates
                .iter()
                .map(|c| {
                    (
                        (c.provider_id, c.model_id.clone()),
                        rank(&by_cost, c) + rank(&by_latency, c),
                    )
                })
                .collect();

            let mut ordered = candidates;
            ordered.sort_by(|a, b| {
                scores[&(a.provider_id, a.model_id.clone())]
                    .cmp(&scores[&(b.provider_id, b.model_id.clone())])
                    .then_with(|| tie_break(a, b))
            });
            ordered
        }
        // Declared order is the contract.
        Strategy::Failover => candidates,
        Strategy::AbTest => pick_ab(candidates, ab_roll),
    }
}

/// A/B selection: weighted draw over `role = primary` entries; `role =
/// fallback` entries follow in declared order. `roll` is a random number in
/// `0..total_weight` (weights are validated to sum to 100).
pub fn pick_ab(candidates: Vec<Candidate>, roll: u32) -> Vec<Candidate> {
    let (primaries, fallbacks): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.role != "fallback");

    let total: u32 = primaries.iter().filter_map(|c| c.weight).sum();
    if total == 0 {
        let mut out = primaries;
        out.extend(fallbacks);
        return out;
    }

    let mut cursor = roll % total;
    let mut chosen = None;
    for (idx, candidate) in primaries.iter().enumerate() {
        let weight = candidate.weight.unwrap_or(0);
        if cursor < weight {
            chosen = Some(idx);
            break;
        }
        cursor -= weight;
    }

    let mut out = Vec::with_capacity(primaries.len() + fallbacks.len());
    if let Some(idx) = chosen {
        let mut primaries = primaries;
        out.push(primaries.remove(idx));
    }
    out.extend(fallbacks);
    out
}

/// Cache key for the latency EWMA of one `(provider_type, model)` pair.
pub fn latency_key(provider_type: &str, model: &str) -> String {
    format!("lat:{provider_type}:{model}")
}

/// EWMA smoothing factor: new = α·observed + (1−α)·old.
const EWMA_ALPHA: f64 = 0.3;

/// Fold one observed latency into the EWMA. Plain read-modify-write — a lost
/// update under concurrency is acceptable, the statistic is advisory.
pub async fn observe_latency(
    cache: &deadpool_redis::Pool,
    provider_type: &str,
    model: &str,
    latency_ms: u64,
) {
    let key = latency_key(provider_type, model);
    let Ok(mut conn) = cache.get().await else { return };

    let old: Option<f64> = redis::cmd("GET")
        .arg(&key)
        .query_async(&mut conn)
        .await
        .ok()
        .flatten();
    let updated = match old {
        Some(old) => EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * old,
        None => latency_ms as f64,
    };
    let _: Result<(), _> = redis::cmd("SET")
        .arg(&key)
        .arg(updated)
        .arg("EX")
        .arg(3600)
        .query_async(&mut conn)
        .await;
}

/// Bulk-read EWMAs for candidate ordering. Missing keys simply stay absent.
pub async fn fetch_latencies(
    cache: &deadpool_redis::Pool,
    keys: &[String],
) -> HashMap<String, f64> {
    if keys.is_empty() {
        return HashMap::new();
    }
    let Ok(mut conn) = cache.get().await else {
        return HashMap::new();
    };
    let mut cmd = redis::cmd("MGET");
    for key in keys {
        cmd.arg(key);
    }
    let values: Vec<Option<f64>> = match cmd.query_async(&mut conn).await {
        Ok(v) => v,
        Err(_) => return HashMap::new(),
    };
    keys.iter()
        .zip(values)
        .filter_map(|(k, v)| v.map(|v| (k.clone(), v)))
        .collect()
}

/// The plan a request will execute: ordered candidates plus the strategy that
/// produced them (recorded for observability).
pub struct Plan {
    pub strategy: Strategy,
    pub candidates: Vec<Candidate>,
}

/// Produce the ordered candidate list for one request.
pub async fn plan(
    state: &AppState,
    org: &Organization,
    key: &GatewayKey,
    requested_model: &str,
    stream: bool,
) -> Result<Plan, GatewayError> {
    let catalog = discover_catalog(state, org.id).await?;

    // 1. Key-prefix-bound routing policy.
    let policy = crate::db::policies::find_by_key_prefix(&state.db, org.id, &key.key_prefix)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("policy lookup failed: {e}")))?;

    let (strategy, mut candidates, rules) = if let Some(policy) = policy {
        // Premium path: the policy only applies when the tier includes it.
        features::require_feature(org, Feature::Routing)?;
        let strategy = Strategy::parse(&policy.strategy).ok_or_else(|| {
            GatewayError::validation(format!("policy has unknown strategy `{}`", policy.strategy))
        })?;
        let rules = Rules::parse_closed(&policy.rules)?;
        let candidates = candidates_from_policy(&policy.model_entries(), &catalog);
        (strategy, candidates, rules)
    } else if let Some(config) = crate::db::org_config::find(&state.db, org.id)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("config lookup failed: {e}")))?
    {
        // 2. Org-wide strategy + fallback chain.
        let strategy = Strategy::parse(&config.routing_strategy).unwrap_or(Strategy::CostOptimized);
        let mut chain = vec![requested_model.to_string()];
        chain.extend(config.fallbacks_for(requested_model));
        let candidates = candidates_for_chain(&chain, &catalog);
        (strategy, candidates, Rules::default())
    } else {
        // 3. Identity fallback: whoever advertises the model, cheapest first.
        let candidates = candidates_for_chain(&[requested_model.to_string()], &catalog);
        (Strategy::CostOptimized, candidates, Rules::default())
    };

    if stream {
        candidates.retain(|c| c.provider_type != "aws");
    }

    // Managed-inference admission: over-capacity orgs lose their managed
    // candidates; a plan that was exclusively managed fails the gate.
    if candidates.iter().any(|c| c.is_managed) {
        if let Err(denied) = features::require_managed_capacity(&state.db, org).await {
            let before = candidates.len();
            candidates.retain(|c| !c.is_managed);
            if candidates.is_empty() && before > 0 {
                return Err(denied);
            }
        }
    }

    let candidates = filter_candidates(candidates, &rules);
    if candidates.is_empty() {
        return Err(GatewayError::NotFound(format!(
            "no connected provider advertises model `{requested_model}`"
        )));
    }

    let latencies = match strategy {
        Strategy::LatencyOptimized | Strategy::Balanced => {
            let keys: Vec<String> = candidates
                .iter()
                .map(|c| latency_key(&c.provider_type, &c.model_id))
                .collect();
            fetch_latencies(&state.cache, &keys).await
        }
        _ => HashMap::new(),
    };

    let roll = rand::rng().random_range(0..100u32);
    let ordered = order_candidates(
        strategy,
        candidates,
        &latencies,
        rules.region_preference.as_deref(),
        roll,
    );
    Ok(Plan {
        strategy,
        candidates: ordered,
    })
}

/// Load the org's provider+model catalog and shape it into candidates.
async fn discover_catalog(state: &AppState, org_id: Uuid) -> Result<Vec<Candidate>, GatewayError> {
    let providers = crate::db::providers::list_active(&state.db, org_id)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("provider lookup failed: {e}")))?;
    let rows = crate::db::providers::catalog_for_org(&state.db, org_id)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("catalog lookup failed: {e}")))?;

    let by_id: HashMap<Uuid, &crate::db::models::CloudProvider> =
        providers.iter().map(|p| (p.id, p)).collect();

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let provider = by_id.get(&row.provider_id)?;
            // Catalog pricing wins; the static table covers rows synced
            // before pricing_info was recorded.
            let (static_in, static_out) =
                pricing::price_per_1m(&row.model_id).unwrap_or((0.0, 0.0));
            let input_price = row
                .pricing_info
                .get("input_per_1m")
                .and_then(Value::as_f64)
                .unwrap_or(static_in);
            let output_price = row
                .pricing_info
                .get("output_per_1m")
                .and_then(Value::as_f64)
                .unwrap_or(static_out);
            let capabilities = row
                .capabilities
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(Candidate {
                provider_id: provider.id,
                provider_type: provider.provider_type.clone(),
                model_id: row.model_id,
                region: provider.region.clone(),
                input_price,
                output_price,
                capabilities,
                is_managed: provider.is_managed,
                role: "primary".into(),
                weight: None,
            })
        })
        .collect())
}

/// Expand policy model entries to candidates, keeping declared order. Each
/// entry binds to the first catalog match (lowest provider id).
fn candidates_from_policy(entries: &[PolicyModel], catalog: &[Candidate]) -> Vec<Candidate> {
    entries
        .iter()
        .filter_map(|entry| {
            let mut matches: Vec<&Candidate> = catalog
                .iter()
                .filter(|c| c.model_id == entry.model_id)
                .collect();
            matches.sort_by_key(|c| c.provider_id);
            matches.first().map(|c| {
                let mut candidate = (*c).clone();
                candidate.role = entry.role.clone();
                candidate.weight = entry.weight;
                candidate
            })
        })
        .collect()
}

/// Candidates for an ordered model chain: all providers per model, chain
/// order preserved across models.
fn candidates_for_chain(chain: &[String], catalog: &[Candidate]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for model in chain {
        let mut matches: Vec<Candidate> = catalog
            .iter()
            .filter(|c| &c.model_id == model)
            .cloned()
            .collect();
        matches.sort_by_key(|c| c.provider_id);
        out.extend(matches);
    }
    out
}

/// Validate a policy document the way the CRUD surface requires:
/// failover needs ≥ 2 models; A/B weights must sum to exactly 100.
pub fn validate_policy_models(strategy: Strategy, entries: &[PolicyModel]) -> Result<(), GatewayError> {
    if entries.is_empty() {
        return Err(GatewayError::validation_field(
            "at least one model configuration is required",
            "models",
        ));
    }
    match strategy {
        Strategy::Failover if entries.len() < 2 => Err(GatewayError::validation_field(
            "failover strategy requires at least 2 models",
            "models",
        )),
        Strategy::AbTest => {
            let total: u32 = entries
                .iter()
                .filter(|e| e.role != "fallback")
                .filter_map(|e| e.weight)
                .sum();
            if total != 100 {
                Err(GatewayError::validation_field(
                    "A/B test weights must sum to 100",
                    "models",
                ))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(ptype: &str, model: &str, input: f64, output: f64) -> Candidate {
        Candidate {
            provider_id: Uuid::new_v4(),
            provider_type: ptype.into(),
            model_id: model.into(),
            region: None,
            input_price: input,
            output_price: output,
            capabilities: vec!["chat".into()],
            is_managed: false,
            role: "primary".into(),
            weight: None,
        }
    }

    // -----------------------------------------------------------------------
    // Strategy parsing
    // -----------------------------------------------------------------------

    #[test]
    fn strategy_parses_both_spellings() {
        assert_eq!(Strategy::parse("cost_optimized"), Some(Strategy::CostOptimized));
        assert_eq!(Strategy::parse("cost-optimized"), Some(Strategy::CostOptimized));
        assert_eq!(Strategy::parse("ab_test"), Some(Strategy::AbTest));
        assert_eq!(Strategy::parse("nonsense"), None);
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn cost_optimized_sorts_by_price_sum_ascending() {
        let expensive = candidate("openai", "gpt-4", 30.0, 60.0);
        let cheap = candidate("groq", "llama-3.1-8b", 0.05, 0.08);
        let mid = candidate("openai", "gpt-4o", 2.5, 10.0);

        let ordered = order_candidates(
            Strategy::CostOptimized,
            vec![expensive, cheap.clone(), mid],
            &HashMap::new(),
            None,
            0,
        );
        assert_eq!(ordered[0].model_id, "llama-3.1-8b");
        assert_eq!(ordered[2].model_id, "gpt-4");
    }

    #[test]
    fn latency_optimized_puts_unobserved_candidates_last() {
        let slow = candidate("aws", "claude-a", 3.0, 15.0);
        let fast = candidate("openai", "gpt-4o", 2.5, 10.0);
        let unknown = candidate("anthropic", "claude-b", 3.0, 15.0);

        let mut latencies = HashMap::new();
        latencies.insert(latency_key("aws", "claude-a"), 900.0);
        latencies.insert(latency_key("openai", "gpt-4o"), 120.0);

        let ordered = order_candidates(
            Strategy::LatencyOptimized,
            vec![slow, fast, unknown],
            &latencies,
            None,
            0,
        );
        assert_eq!(ordered[0].model_id, "gpt-4o");
        assert_eq!(ordered[1].model_id, "claude-a");
        assert_eq!(ordered[2].model_id, "claude-b");
    }

    #[test]
    fn balanced_uses_rank_sum_of_both_orderings() {
        // a: cheapest but slowest; b: most expensive but fastest;
        // c: middle on both — rank sums: a=0+2=2, b=2+0=2, c=1+1=2 → tie,
        // broken by provider_id. Use asymmetric setup instead:
        let a = candidate("groq", "cheap-slow", 0.1, 0.1); // cost rank 0, lat rank 2
        let b = candidate("openai", "mid-fast", 1.0, 1.0); // cost rank 1, lat rank 0
        let c = candidate("aws", "dear-mid", 5.0, 5.0); // cost rank 2, lat rank 1

        let mut latencies = HashMap::new();
        latencies.insert(latency_key("groq", "cheap-slow"), 900.0);
        latencies.insert(latency_key("openai", "mid-fast"), 100.0);
        latencies.insert(latency_key("aws", "dear-mid"), 500.0);

        let ordered = order_candidates(
            Strategy::Balanced,
            vec![a, b, c],
            &latencies,
            None,
            0,
        );
        // b has rank sum 1, a and c have 2 and 3
        assert_eq!(ordered[0].model_id, "mid-fast");
    }

    #[test]
    fn failover_preserves_declared_order() {
        let first = candidate("azure", "gpt-4o", 2.5, 10.0);
        let second = candidate("aws", "claude-3-5-sonnet", 3.0, 15.0);
        let ordered = order_candidates(
            Strategy::Failover,
            vec![first.clone(), second],
            &HashMap::new(),
            None,
            0,
        );
        assert_eq!(ordered[0].provider_type, "azure");
        assert_eq!(ordered[1].provider_type, "aws");
    }

    #[test]
    fn region_preference_breaks_price_ties() {
        let mut eu = candidate("openai", "gpt-4o", 2.5, 10.0);
        eu.region = Some("eu-west-1".into());
        let mut us = candidate("azure", "gpt-4o", 2.5, 10.0);
        us.region = Some("us-east-1".into());

        let ordered = order_candidates(
            Strategy::CostOptimized,
            vec![us, eu],
            &HashMap::new(),
            Some("eu-west-1"),
            0,
        );
        assert_eq!(ordered[0].region.as_deref(), Some("eu-west-1"));
    }

    // -----------------------------------------------------------------------
    // A/B selection
    // -----------------------------------------------------------------------

    fn weighted(model: &str, weight: u32, role: &str) -> Candidate {
        let mut c = candidate("openai", model, 1.0, 1.0);
        c.weight = Some(weight);
        c.role = role.into();
        c
    }

    #[test]
    fn ab_roll_selects_by_cumulative_weight() {
        let a = weighted("model-a", 70, "primary");
        let b = weighted("model-b", 30, "primary");

        let low = pick_ab(vec![a.clone(), b.clone()], 0);
        assert_eq!(low[0].model_id, "model-a");
        let high = pick_ab(vec![a.clone(), b.clone()], 69);
        assert_eq!(high[0].model_id, "model-a");
        let tail = pick_ab(vec![a, b], 70);
        assert_eq!(tail[0].model_id, "model-b");
    }

    #[test]
    fn ab_selection_has_no_fallback_unless_declared() {
        let a = weighted("model-a", 50, "primary");
        let b = weighted("model-b", 50, "primary");
        let picked = pick_ab(vec![a, b], 10);
        assert_eq!(picked.len(), 1, "losing primary must not become a fallback");
    }

    #[test]
    fn ab_declared_fallbacks_follow_the_winner() {
        let a = weighted("model-a", 100, "primary");
        let f = weighted("model-f", 0, "fallback");
        let picked = pick_ab(vec![a, f], 42);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].model_id, "model-a");
        assert_eq!(picked[1].model_id, "model-f");
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    #[test]
    fn rules_reject_unknown_keys() {
        let err = Rules::parse_closed(&serde_json::json!({ "max_cost": 1.0 })).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn rules_parse_known_keys_and_null() {
        let rules = Rules::parse_closed(&serde_json::json!({
            "max_cost_per_request": 0.5,
            "max_tokens": 2048,
            "allowed_capabilities": ["chat"],
            "region_preference": "eu-west-1",
        }))
        .unwrap();
        assert_eq!(rules.max_cost_per_request, Some(0.5));
        assert_eq!(rules.max_tokens, Some(2048));
        assert!(Rules::parse_closed(&Value::Null).is_ok());
    }

    #[test]
    fn max_cost_rule_filters_expensive_candidates() {
        let cheap = candidate("groq", "llama-3.1-8b", 0.05, 0.08);
        let dear = candidate("openai", "gpt-4", 30.0, 60.0);
        let rules = Rules {
            max_cost_per_request: Some(0.01),
            max_tokens: Some(1000),
            ..Default::default()
        };
        // worst case for gpt-4: 1000 * 90 / 1e6 = 0.09 > 0.01 → dropped
        let kept = filter_candidates(vec![cheap, dear], &rules);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].model_id, "llama-3.1-8b");
    }

    #[test]
    fn capability_rule_requires_all_listed_capabilities() {
        let mut vision = candidate("openai", "gpt-4o", 2.5, 10.0);
        vision.capabilities = vec!["chat".into(), "vision".into()];
        let plain = candidate("groq", "llama-3.1-8b", 0.05, 0.08);

        let rules = Rules {
            allowed_capabilities: Some(vec!["vision".into()]),
            ..Default::default()
        };
        let kept = filter_candidates(vec![vision, plain], &rules);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].model_id, "gpt-4o");
    }

    // -----------------------------------------------------------------------
    // Policy validation
    // -----------------------------------------------------------------------

    fn entries(specs: &[(&str, Option<u32>, &str)]) -> Vec<PolicyModel> {
        specs
            .iter()
            .map(|(model, weight, role)| PolicyModel {
                model_id: model.to_string(),
                weight: *weight,
                role: role.to_string(),
            })
            .collect()
    }

    #[test]
    fn failover_requires_two_models() {
        let one = entries(&[("gpt-4o", None, "primary")]);
        assert!(validate_policy_models(Strategy::Failover, &one).is_err());
        let two = entries(&[("gpt-4o", None, "primary"), ("claude", None, "fallback")]);
        assert!(validate_policy_models(Strategy::Failover, &two).is_ok());
    }

    #[test]
    fn ab_test_weights_must_sum_to_100() {
        let bad = entries(&[("a", Some(60), "primary"), ("b", Some(30), "primary")]);
        assert!(validate_policy_models(Strategy::AbTest, &bad).is_err());
        let good = entries(&[("a", Some(70), "primary"), ("b", Some(30), "primary")]);
        assert!(validate_policy_models(Strategy::AbTest, &good).is_ok());
    }

    #[test]
    fn empty_model_list_is_rejected_for_any_strategy() {
        assert!(validate_policy_models(Strategy::CostOptimized, &[]).is_err());
    }
}
