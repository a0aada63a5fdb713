use super::QueueBackend;
use crate::error::QueueError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Redis list backend (`RPUSH` / `BLPOP`).
///
/// The connection is opened on first use, so building a backend never touches
/// the network. `BLPOP` holds its connection for the whole block, so consumers
/// should use a backend of their own rather than share one.
pub struct RedisQueueBackend {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    connect_timeout: Duration,
}

impl RedisQueueBackend {
    /// Parses the URL without connecting.
    pub fn open(redis_url: &str, connect_timeout: Duration) -> Result<Self, QueueError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            conn: OnceCell::new(),
            connect_timeout,
        })
    }

    /// Like [`RedisQueueBackend::open`], but connects right away.
    pub async fn connect(redis_url: &str, connect_timeout: Duration) -> Result<Self, QueueError> {
        let backend = Self::open(redis_url, connect_timeout)?;
        backend.connection().await?;
        Ok(backend)
    }

    async fn connection(&self) -> Result<ConnectionManager, QueueError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let connecting = ConnectionManager::new(self.client.clone());
                match tokio::time::timeout(self.connect_timeout, connecting).await {
                    Ok(conn) => conn.map_err(QueueError::from),
                    Err(_) => Err(QueueError::Unavailable("connection timed out".to_string())),
                }
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, list: &str, payload: String) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(list)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection().await?;
        // A zero timeout would block forever.
        let timeout_secs = timeout.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(list)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn len(&self, list: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let len: usize = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn range(&self, list: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
