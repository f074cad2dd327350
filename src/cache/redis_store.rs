//! Redis-backed `RemoteStore`
//!
//! Uses a `ConnectionManager` for KV traffic (auto-reconnecting, cheap to
//! clone) and a dedicated pub/sub connection per subscription. Pattern scans
//! use `SCAN MATCH`, never `KEYS`.
//!
//! The KV connection is opened on first use. Until Redis answers, every call
//! fails with `RemoteError::Unavailable` and the next one tries again, so a
//! store that comes up after the service is picked up by the breaker probe.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;

use super::remote::{MessageStream, RemoteError, RemoteStore};

const SCAN_BATCH: usize = 200;
// Reconnect attempts inside the manager; the circuit breaker retries beyond that
const CONNECT_RETRIES: usize = 1;

pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Validate the URL without connecting.
    pub fn new(url: &str) -> Result<Self, RemoteError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    /// Validate the URL and open the KV connection now.
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        let store = Self::new(url)?;
        store.connection().await?;
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager, RemoteError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new_with_backoff(self.client.clone(), 2, 100, CONNECT_RETRIES)
            .await
            .map_err(map_err)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

fn map_err(e: redis::RedisError) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(Duration::ZERO)
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        RemoteError::Unavailable(e.to_string())
    } else {
        RemoteError::Protocol(e.to_string())
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                let millis = ttl.as_millis().max(1) as u64;
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(map_err)
            }
            None => conn.set::<_, _, ()>(key, value).await.map_err(map_err),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.connection().await?;
        conn.exists(key).await.map_err(map_err)
    }

    async fn scan_pattern(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, i64>(channel, payload)
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RemoteError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_err)?;
        pubsub.subscribe(channel).await.map_err(map_err)?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<Vec<u8>>().ok() });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisStore::new("not a redis url").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_per_call() {
        // Nothing listens on port 1
        let store = RedisStore::new("redis://127.0.0.1:1/").unwrap();
        for _ in 0..2 {
            let result = tokio::time::timeout(Duration::from_secs(10), store.ping())
                .await
                .unwrap();
            assert!(result.is_err());
        }
        assert!(store.conn.lock().await.is_none());
        assert!(RedisStore::connect("redis://127.0.0.1:1/").await.is_err());
    }
}
