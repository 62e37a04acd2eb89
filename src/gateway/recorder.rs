//! Usage recorder — persists `gateway_requests` rows off the hot path.
//!
//! `record()` enqueues to a bounded channel drained by a small worker pool.
//! Overflow falls through to a synchronous write so backpressure on the
//! persistence path cannot silently discard billing data; only if that write
//! also fails is the row logged and dropped.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::models::{NewGatewayRequest, RequestStatus};

/// Queue depth before enqueueing falls back to a synchronous write.
const QUEUE_CAPACITY: usize = 1024;

/// Drain workers. Writes are independent row inserts; two keeps the queue
/// moving without competing with the request path for DB connections.
const WORKERS: usize = 2;

/// One unit of recording work.
#[derive(Debug)]
pub struct UsageRecord {
    pub row: NewGatewayRequest,
    /// Set when the request ran on a managed provider; accumulates usage on
    /// the provider row.
    pub managed_provider_id: Option<Uuid>,
    /// Set for rate-limited rejections; mirrored into `gateway_rate_limits`.
    pub rate_window_start: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(row: NewGatewayRequest) -> Self {
        Self {
            row,
            managed_provider_id: None,
            rate_window_start: None,
        }
    }
}

#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<UsageRecord>,
    db: sqlx::PgPool,
    cache: deadpool_redis::Pool,
}

/// Start the worker pool and hand back the enqueue handle.
pub fn spawn(db: sqlx::PgPool, cache: deadpool_redis::Pool) -> RecorderHandle {
    let (tx, rx) = mpsc::channel::<UsageRecord>(QUEUE_CAPACITY);
    let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

    for worker in 0..WORKERS {
        let rx = std::sync::Arc::clone(&rx);
        let db = db.clone();
        let cache = cache.clone();
        tokio::spawn(async move {
            loop {
                let record = { rx.lock().await.recv().await };
                match record {
                    Some(record) => write_record(&db, &cache, record).await,
                    None => {
                        tracing::debug!(worker, "usage recorder channel closed");
                        break;
                    }
                }
            }
        });
    }

    RecorderHandle { tx, db, cache }
}

impl RecorderHandle {
    /// Enqueue a record; on a full queue, write synchronously instead.
    pub async fn record(&self, record: UsageRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record))
            | Err(mpsc::error::TrySendError::Closed(record)) => {
                tracing::warn!("usage queue saturated — writing request row synchronously");
                write_record(&self.db, &self.cache, record).await;
            }
        }
    }
}

async fn write_record(db: &sqlx::PgPool, cache: &deadpool_redis::Pool, record: UsageRecord) {
    let org_id = record.row.org_id;
    let status = record.row.status;

    if let Err(e) = crate::db::requests::insert(db, &record.row).await {
        // Billing data; loss must be rare and visible.
        tracing::error!(%org_id, error = %e, "failed to persist gateway request row — dropping");
        return;
    }

    // Rate-limited rejections do not consume monthly quota.
    if status != RequestStatus::RateLimited {
        super::features::increment_gateway_counter(cache, org_id).await;
    }

    if let Some(provider_id) = record.managed_provider_id {
        let tokens = i64::from(record.row.input_tokens) + i64::from(record.row.output_tokens);
        let billed = record.row.marked_up_cost.unwrap_or(record.row.cost);
        if let Err(e) = crate::db::providers::add_managed_usage(db, provider_id, tokens, billed).await
        {
            tracing::warn!(%provider_id, error = %e, "managed usage accumulation failed");
        }
    }

    if let (Some(window_start), Some(key_id)) = (record.rate_window_start, record.row.key_id) {
        if let Err(e) =
            crate::db::requests::upsert_rate_limit_mirror(db, key_id, window_start).await
        {
            tracing::debug!(%key_id, error = %e, "rate-limit mirror upsert failed");
        }
    }
}
