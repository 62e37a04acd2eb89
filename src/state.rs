//! Shared application state injected into every request handler.

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::{
    config::Settings,
    db::models::CloudProvider,
    error::GatewayError,
    gateway::recorder::RecorderHandle,
    providers::{ProviderClient, ProviderClientCache},
    secrets::SecretStore,
};

/// Everything a request needs, shared behind one `Arc`.
///
/// All fields are either pools (internally synchronised) or immutable after
/// construction; handlers never take locks on `AppState` itself.
pub struct AppState {
    pub settings: Settings,
    pub db: sqlx::PgPool,
    pub cache: deadpool_redis::Pool,
    pub secrets: SecretStore,
    pub clients: ProviderClientCache,
    pub recorder: RecorderHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Build pools and background workers. Connections are established
    /// lazily; readiness is a separate probe (`/api/health/ready`).
    pub async fn connect(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let db = PgPoolOptions::new()
            .max_connections(settings.db_pool_size + settings.db_max_overflow)
            .min_connections(settings.db_pool_size.min(2))
            .connect_lazy(&settings.database_url)
            .context("building postgres pool")?;

        let cache_cfg = deadpool_redis::Config::from_url(&settings.redis_url);
        let cache = cache_cfg
            .builder()
            .context("building redis pool")?
            .max_size(settings.redis_pool_size)
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .context("building redis pool")?;

        let secrets = SecretStore::new(&settings);
        secrets.refresh().await;

        let recorder = crate::gateway::recorder::spawn(db.clone(), cache.clone());

        Ok(Arc::new(Self {
            settings,
            db,
            cache,
            secrets,
            clients: ProviderClientCache::new(),
            recorder,
            started_at: Instant::now(),
        }))
    }

    /// Resolve (or lazily build) the upstream client for a provider row:
    /// decrypt stored credentials, substitute the platform master key for
    /// managed providers, and cache the result per provider ID.
    pub fn provider_client(
        &self,
        provider: &CloudProvider,
    ) -> Result<Arc<ProviderClient>, GatewayError> {
        let master_key = if provider.is_managed {
            let key = self
                .secrets
                .master_key(&provider.provider_type)
                .ok_or_else(|| {
                    GatewayError::ServiceUnavailable(format!(
                        "managed master key for `{}` is not configured",
                        provider.provider_type
                    ))
                })?;
            Some(key)
        } else {
            None
        };

        let credentials = if provider.credentials_ciphertext.is_empty() {
            serde_json::json!({})
        } else {
            crate::crypto::decrypt_credentials(
                &provider.credentials_ciphertext,
                &self.settings.encryption_key,
            )
            .map_err(|e| {
                GatewayError::Internal(anyhow::anyhow!("credential decryption failed: {e}"))
            })?
        };

        self.clients
            .get_or_build(provider.id, || {
                ProviderClient::from_credentials(&provider.provider_type, &credentials, master_key)
            })
            .map_err(|e| GatewayError::UpstreamFailed(e.to_string()))
    }
}
