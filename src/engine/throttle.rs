use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::engine::cache::Kv;

type DelayLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Per-credential sliding window over Redis.
///
/// The ZSET at `rate_limit:{key_hash}` holds one member per admitted request,
/// scored by wall-clock seconds. Entries older than the window are pruned and
/// the remainder counted in one pipeline; the request is recorded only when
/// admitted. A Redis outage fails open.
pub async fn check_rate_limit(kv: &Kv, key_hash: &str, limit: u32) -> bool {
    let mut conn = match kv.conn().await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "Rate limit backend unavailable, failing open");
            return true;
        }
    };

    let key = format!("rate_limit:{key_hash}");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let cutoff = now - 60.0;

    let counted: Result<(i64, i64), _> = redis::pipe()
        .atomic()
        .cmd("ZREMRANGEBYSCORE")
        .arg(&key)
        .arg("-inf")
        .arg(cutoff)
        .cmd("ZCARD")
        .arg(&key)
        .query_async(&mut conn)
        .await;

    let count = match counted {
        Ok((_, count)) => count,
        Err(e) => {
            tracing::warn!(error = %e, "Rate limit check failed, failing open");
            return true;
        }
    };

    if count >= limit as i64 {
        return false;
    }

    let recorded: Result<(i64, i64), _> = redis::pipe()
        .atomic()
        .cmd("ZADD")
        .arg(&key)
        .arg(now)
        .arg(format!("{now:.6}"))
        .cmd("EXPIRE")
        .arg(&key)
        .arg(60)
        .query_async(&mut conn)
        .await;

    if let Err(e) = recorded {
        tracing::warn!(error = %e, "Rate limit record failed");
    }

    true
}

/// Per-host outbound discipline: a concurrency semaphore plus a minimum
/// inter-request delay, both lazily created per host and kept for the
/// process lifetime.
pub struct DomainThrottle {
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
    delays: RwLock<HashMap<String, Arc<DelayLimiter>>>,
    max_concurrency: usize,
}

impl std::fmt::Debug for DomainThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainThrottle")
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl DomainThrottle {
    pub fn new(max_concurrency: usize) -> Self {
        DomainThrottle {
            semaphores: RwLock::new(HashMap::new()),
            delays: RwLock::new(HashMap::new()),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Acquire a slot against `host`, then wait out the politeness delay.
    /// The returned permit should be held across the whole fetch/render.
    pub async fn acquire(
        &self,
        host: &str,
        concurrency: usize,
        delay_ms: u64,
    ) -> OwnedSemaphorePermit {
        let semaphore = self.semaphore_for(host, concurrency).await;
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("domain semaphore is never closed");

        if delay_ms > 0 {
            let limiter = self.delay_for(host, delay_ms).await;
            limiter.until_ready().await;
        }

        permit
    }

    async fn semaphore_for(&self, host: &str, concurrency: usize) -> Arc<Semaphore> {
        {
            let map = self.semaphores.read().await;
            if let Some(sem) = map.get(host) {
                return sem.clone();
            }
        }

        let capacity = concurrency.clamp(1, self.max_concurrency);
        let mut map = self.semaphores.write().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(capacity)))
            .clone()
    }

    async fn delay_for(&self, host: &str, delay_ms: u64) -> Arc<DelayLimiter> {
        {
            let map = self.delays.read().await;
            if let Some(limiter) = map.get(host) {
                return limiter.clone();
            }
        }

        let mut map = self.delays.write().await;
        map.entry(host.to_string())
            .or_insert_with(|| {
                let quota = Quota::with_period(Duration::from_millis(delay_ms.max(1)))
                    .expect("non-zero politeness period");
                Arc::new(RateLimiter::direct(quota))
            })
            .clone()
    }

    #[cfg(test)]
    async fn tracked_hosts(&self) -> usize {
        self.semaphores.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let throttle = Arc::new(DomainThrottle::new(5));

        let p1 = throttle.acquire("example.com", 2, 0).await;
        let _p2 = throttle.acquire("example.com", 2, 0).await;

        // Third acquisition must block until one permit is returned.
        let t = Arc::clone(&throttle);
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            t.acquire("example.com", 2, 0),
        )
        .await;
        assert!(blocked.is_err());

        drop(p1);
        let unblocked = tokio::time::timeout(
            Duration::from_millis(200),
            throttle.acquire("example.com", 2, 0),
        )
        .await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_clamped_to_max() {
        let throttle = DomainThrottle::new(1);
        let _p1 = throttle.acquire("example.com", 10, 0).await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            throttle.acquire("example.com", 10, 0),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_hosts_tracked_independently() {
        let throttle = DomainThrottle::new(5);
        let _a = throttle.acquire("a.com", 1, 0).await;
        let b = tokio::time::timeout(Duration::from_millis(100), throttle.acquire("b.com", 1, 0))
            .await;
        assert!(b.is_ok());
        assert_eq!(throttle.tracked_hosts().await, 2);
    }

    #[tokio::test]
    async fn test_politeness_delay_enforced() {
        let throttle = DomainThrottle::new(5);
        let start = Instant::now();
        let p1 = throttle.acquire("slow.com", 5, 80).await;
        drop(p1);
        let p2 = throttle.acquire("slow.com", 5, 80).await;
        drop(p2);
        // The second acquisition waits out the inter-request gap.
        assert!(start.elapsed() >= Duration::from_millis(70));
    }
}
