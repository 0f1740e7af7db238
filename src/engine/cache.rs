use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::ScrapeResponse;

/// TTL of the hot (Redis) response tier.
pub const HOT_TTL_SECS: u64 = 600;

/// Thin handle over the Redis client. Connections are multiplexed and
/// acquired per operation; callers treat failures as cache misses.
#[derive(Clone)]
pub struct Kv {
    client: redis::Client,
}

impl std::fmt::Debug for Kv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kv").finish_non_exhaustive()
    }
}

impl Kv {
    pub fn open(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Kv {
            client: redis::Client::open(url)?,
        })
    }

    pub async fn conn(&self) -> redis::RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }
}

pub fn hot_key(url_hash: &str) -> String {
    format!("scrape_cache:{url_hash}")
}

/// Read a serialized response from the hot tier. Any failure is a miss.
pub async fn hot_get(kv: &Kv, url_hash: &str) -> Option<ScrapeResponse> {
    let mut conn = kv.conn().await.ok()?;
    let raw: Option<String> = conn.get(hot_key(url_hash)).await.ok()?;
    serde_json::from_str(&raw?).ok()
}

/// Write a response through to the hot tier. Failures are logged, not
/// surfaced; the durable tier is the source of truth.
pub async fn hot_put(kv: &Kv, url_hash: &str, response: &ScrapeResponse) {
    let payload = match serde_json::to_string(response) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize response for cache");
            return;
        }
    };
    match kv.conn().await {
        Ok(mut conn) => {
            if let Err(e) = conn
                .set_ex::<_, _, ()>(hot_key(url_hash), payload, HOT_TTL_SECS)
                .await
            {
                tracing::debug!(error = %e, "Hot cache write failed");
            }
        }
        Err(e) => tracing::debug!(error = %e, "Hot cache unavailable"),
    }
}

/// Per-key fetch coalescing: at most one in-flight fetch per `url_hash`.
///
/// The winner holds the keyed mutex across its fetch; losers queue on the
/// same mutex and re-check the cache once admitted. Entries are dropped from
/// the table when the last holder releases.
#[derive(Default)]
pub struct SingleFlight {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

impl SingleFlight {
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let entry = {
            let mut locks = self.locks.lock().expect("singleflight table poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let guard = entry.lock_owned().await;

        FlightGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().expect("singleflight table poisoned").len()
    }
}

pub struct FlightGuard {
    key: String,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Release the keyed mutex first, then drop the table entry if nobody
        // else is waiting on it.
        self.guard.take();
        if let Ok(mut locks) = self.locks.lock() {
            let unused = locks
                .get(&self.key)
                .is_some_and(|entry| Arc::strong_count(entry) == 1);
            if unused {
                locks.remove(&self.key);
            }
        }
    }
}
