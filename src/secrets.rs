//! Secret store — Vault KV v2 reads with an in-process cache.
//!
//! The cache is copy-on-write: a successful fetch replaces the whole map
//! behind an `RwLock<Arc<…>>`, so readers never observe a partially-updated
//! view and the lock is held only for the duration of an `Arc` clone.
//!
//! Resolution order for any secret: Vault → cached value from a previous
//! fetch → environment variable. A Vault outage therefore degrades to the
//! last-known values instead of failing the hot path.
//!
//! Managed-inference master keys resolve from `BONITO_{PROVIDER}_MASTER_KEY`
//! environment variables (e.g. `BONITO_OPENAI_MASTER_KEY`).

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::Context;
use tracing::warn;

/// Providers eligible for managed mode (platform master key + markup billing).
pub const MANAGED_PROVIDERS: &[&str] = &["groq", "openai", "anthropic"];

pub struct SecretStore {
    vault: Option<VaultClient>,
    cache: RwLock<Arc<HashMap<String, String>>>,
}

impl SecretStore {
    /// Build a store from settings. `VAULT_ADDR` unset disables Vault and
    /// every lookup falls through to the environment.
    pub fn new(settings: &crate::config::Settings) -> Self {
        let vault = match (&settings.vault_addr, &settings.vault_token) {
            (Some(addr), Some(token)) => Some(VaultClient::new(
                addr.clone(),
                token.clone(),
                settings.vault_mount.clone(),
            )),
            _ => None,
        };
        Self {
            vault,
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Refresh the cache from Vault's `app` path. Failures are logged and the
    /// previous cache is kept.
    pub async fn refresh(&self) {
        let Some(vault) = &self.vault else { return };
        match vault.read_path("app").await {
            Ok(secrets) => {
                *self.cache.write().expect("secret cache lock poisoned") = Arc::new(secrets);
            }
            Err(e) => {
                warn!(error = %e, "vault refresh failed — keeping cached secrets");
            }
        }
    }

    /// Look up a secret: cache (fed by Vault) first, then the environment.
    pub fn get(&self, name: &str) -> Option<String> {
        let cached = {
            let cache = self.cache.read().expect("secret cache lock poisoned");
            Arc::clone(&cache)
        };
        cached
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name.to_uppercase()).ok().filter(|v| !v.is_empty()))
    }

    /// Master key for a managed provider, or `None` when managed mode is not
    /// configured for it.
    pub fn master_key(&self, provider_type: &str) -> Option<String> {
        if !MANAGED_PROVIDERS.contains(&provider_type) {
            return None;
        }
        let var = format!("BONITO_{}_MASTER_KEY", provider_type.to_uppercase());
        self.get(&var)
    }

    /// Probe Vault for the readiness endpoint. Returns `Ok(())` when Vault is
    /// disabled — a service configured without Vault is not degraded by it.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        match &self.vault {
            Some(vault) => vault.health_check().await,
            None => Ok(()),
        }
    }
}

/// Minimal Vault KV v2 client.
struct VaultClient {
    client: reqwest::Client,
    addr: String,
    token: String,
    mount: String,
}

impl VaultClient {
    fn new(addr: String, token: String, mount: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build vault client");
        Self {
            client,
            addr: addr.trim_end_matches('/').to_string(),
            token,
            mount,
        }
    }

    /// `GET {addr}/v1/{mount}/data/{path}` — returns the inner KV map.
    /// A 404 is an empty map, not an error.
    async fn read_path(&self, path: &str) -> anyhow::Result<HashMap<String, String>> {
        let url = format!("{}/v1/{}/data/{}", self.addr, self.mount, path);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }
        anyhow::ensure!(
            response.status().is_success(),
            "vault returned HTTP {}",
            response.status()
        );

        let body: serde_json::Value = response.json().await.context("parsing vault response")?;
        let data = body
            .pointer("/data/data")
            .and_then(|v| v.as_object())
            .context("vault response missing data.data")?;

        Ok(data
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect())
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/sys/health", self.addr);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "vault health returned HTTP {}",
            response.status()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_with_vault(addr: &str) -> SecretStore {
        SecretStore {
            vault: Some(VaultClient::new(
                addr.to_string(),
                "test-token".into(),
                "secret".into(),
            )),
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn refresh_populates_cache_from_vault() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .and(header("X-Vault-Token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "encryption_key": "from-vault" } }
            })))
            .mount(&server)
            .await;

        let store = store_with_vault(&server.uri());
        store.refresh().await;
        assert_eq!(store.get("encryption_key").as_deref(), Some("from-vault"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "secret_key": "v1" } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_with_vault(&server.uri());
        store.refresh().await;
        assert_eq!(store.get("secret_key").as_deref(), Some("v1"));

        // Replace the mock with a 500 — the cached value must survive.
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        store.refresh().await;
        assert_eq!(store.get("secret_key").as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn vault_404_is_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/app"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_with_vault(&server.uri());
        store.refresh().await;
        assert!(store.get("anything-not-in-env-xyz").is_none());
    }

    #[test]
    fn master_key_rejects_unmanaged_provider_types() {
        let settings = test_settings();
        let store = SecretStore::new(&settings);
        // aws is not in the managed set even if an env var existed
        assert!(store.master_key("aws").is_none());
        assert!(store.master_key("azure").is_none());
    }

    fn test_settings() -> crate::config::Settings {
        crate::config::Settings {
            port: 8080,
            database_url: "postgresql://x".into(),
            redis_url: "redis://x".into(),
            vault_addr: None,
            vault_token: None,
            vault_mount: "secret".into(),
            secret_key: "s".into(),
            encryption_key: "e".into(),
            cors_origins: vec![],
            frontend_url: None,
            environment: crate::config::Environment::Development,
            db_pool_size: 10,
            db_max_overflow: 20,
            redis_pool_size: 20,
            body_limit_bytes: 1024,
            request_deadline_secs: 120,
        }
    }
}
