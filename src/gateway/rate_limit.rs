//! Per-key fixed-window rate limiting backed by the shared cache.
//!
//! The counter lives in Redis so it is correct across horizontal replicas:
//!
//! ```text
//! slot = floor(now_epoch / 60)
//! k    = "rl:{key_id}:{slot}"
//! n    = INCR k                  # atomic, returns post-increment value
//! if n == 1: EXPIRE k 120        # survive clock skew, expire naturally
//! if n > key.rate_limit: reject 429
//! ```
//!
//! The race is provably safe: the winner of the last slot below the cap is
//! whichever `INCR` returns `≤ cap`. A Redis outage fails closed — admitting
//! unbounded traffic is worse than a 503.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::GatewayError;

/// Window length in seconds.
const WINDOW_SECS: u64 = 60;

/// Counter TTL; twice the window so slow clocks never resurrect a counter.
const COUNTER_TTL_SECS: u64 = 120;

#[derive(Debug, PartialEq)]
pub enum Decision {
    Allowed,
    Rejected {
        retry_after_secs: u64,
        window_start: DateTime<Utc>,
    },
}

/// Fixed-window arithmetic, separated for testability.
pub(crate) fn window(now_epoch: u64) -> (u64, u64) {
    let slot = now_epoch / WINDOW_SECS;
    let retry_after = WINDOW_SECS - (now_epoch % WINDOW_SECS);
    (slot, retry_after)
}

/// Atomically consume one slot for `key_id`, enforcing `limit` requests per
/// minute.
pub async fn check(
    cache: &deadpool_redis::Pool,
    key_id: Uuid,
    limit: i32,
) -> Result<Decision, GatewayError> {
    let now_epoch = Utc::now().timestamp() as u64;
    let (slot, retry_after) = window(now_epoch);
    let counter_key = format!("rl:{key_id}:{slot}");

    let mut conn = cache
        .get()
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("rate-limit cache unavailable: {e}")))?;

    let count: i64 = redis::cmd("INCR")
        .arg(&counter_key)
        .query_async(&mut conn)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("rate-limit cache unavailable: {e}")))?;

    if count == 1 {
        // Best-effort TTL; a failed EXPIRE leaves a counter that a later
        // first-increment will re-arm.
        let _: Result<(), _> = redis::cmd("EXPIRE")
            .arg(&counter_key)
            .arg(COUNTER_TTL_SECS)
            .query_async(&mut conn)
            .await;
    }

    if count > i64::from(limit.max(0)) {
        let window_start = Utc
            .timestamp_opt((slot * WINDOW_SECS) as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        return Ok(Decision::Rejected {
            retry_after_secs: retry_after,
            window_start,
        });
    }
    Ok(Decision::Allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_slots_change_every_sixty_seconds() {
        let (slot_a, _) = window(600);
        let (slot_b, _) = window(659);
        let (slot_c, _) = window(660);
        assert_eq!(slot_a, slot_b);
        assert_eq!(slot_c, slot_a + 1);
    }

    #[test]
    fn retry_after_counts_down_to_window_boundary() {
        let (_, retry) = window(600);
        assert_eq!(retry, 60); // exactly on the boundary
        let (_, retry) = window(601);
        assert_eq!(retry, 59);
        let (_, retry) = window(659);
        assert_eq!(retry, 1);
    }

    #[test]
    fn retry_after_never_exceeds_the_window() {
        for now in 0..200 {
            let (_, retry) = window(now);
            assert!(retry >= 1 && retry <= 60, "retry_after out of range at {now}");
        }
    }
}
