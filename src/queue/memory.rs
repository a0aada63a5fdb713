use super::QueueBackend;
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// In-process list backend. Pops happen under one lock, so concurrent
/// consumers never see the same entry.
#[derive(Debug)]
pub struct MemoryQueueBackend {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    available: AtomicBool,
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self {
            lists: Mutex::default(),
            pushed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the backend.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("memory queue switched off".into()))
        }
    }

    fn with_lists<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, VecDeque<String>>) -> T,
    ) -> Result<T, QueueError> {
        self.check()?;
        let mut lists = self
            .lists
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue lock poisoned".into()))?;
        Ok(f(&mut lists))
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, list: &str, payload: String) -> Result<(), QueueError> {
        self.with_lists(|lists| {
            lists.entry(list.to_string()).or_default().push_back(payload);
        })?;
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let head = self.with_lists(|lists| lists.get_mut(list).and_then(VecDeque::pop_front))?;
            if head.is_some() {
                return Ok(head);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, list: &str) -> Result<usize, QueueError> {
        self.with_lists(|lists| lists.get(list).map_or(0, VecDeque::len))
    }

    async fn range(&self, list: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        self.with_lists(|lists| {
            lists
                .get(list)
                .map(|entries| entries.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let consumer = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.pop("q", Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        backend.push("q", "job".to_string()).await.unwrap();

        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped, Some("job".to_string()));
    }

    #[tokio::test]
    async fn test_range_does_not_remove() {
        let backend = MemoryQueueBackend::new();
        for n in 0..3 {
            backend.push("q", n.to_string()).await.unwrap();
        }
        assert_eq!(backend.range("q", 2).await.unwrap(), vec!["0", "1"]);
        assert_eq!(backend.len("q").await.unwrap(), 3);
        assert!(backend.range("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let backend = MemoryQueueBackend::new();
        backend.set_available(false);
        assert!(matches!(
            backend.push("q", "x".into()).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(backend.ping().await.is_err());
    }
}
