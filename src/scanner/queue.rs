//! Shared FIFO of URIs waiting to be checked

use flume::{Receiver, Sender};
use std::time::Duration;

/// Multi-producer, multi-consumer check queue
#[derive(Clone)]
pub struct CheckQueue {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl CheckQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, uri: String) {
        // both ends live in self, so the channel is never disconnected
        let _ = self.tx.send(uri);
    }

    pub fn extend<I: IntoIterator<Item = String>>(&self, uris: I) -> usize {
        let mut count = 0;
        for uri in uris {
            self.push(uri);
            count += 1;
        }
        count
    }

    /// Wait up to `wait` for the next URI
    pub async fn next(&self, wait: Duration) -> Option<String> {
        match tokio::time::timeout(wait, self.rx.recv_async()).await {
            Ok(Ok(uri)) => Some(uri),
            _ => None,
        }
    }

    pub fn try_next(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Discard every pending URI, returning how many were dropped
    pub fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}

impl Default for CheckQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = CheckQueue::new();
        queue.extend(["http://a:1".to_string(), "http://b:1".to_string()]);
        assert_eq!(queue.len(), 2);

        assert_eq!(
            queue.next(Duration::from_millis(10)).await.as_deref(),
            Some("http://a:1")
        );
        assert_eq!(queue.try_next().as_deref(), Some("http://b:1"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_times_out_when_empty() {
        let queue = CheckQueue::new();
        assert!(queue.next(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_drain_discards_pending() {
        let queue = CheckQueue::new();
        queue.extend((0..5).map(|i| format!("http://10.0.0.{}:80", i)));
        assert_eq!(queue.drain(), 5);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_many_consumers_each_item_once() {
        let queue = CheckQueue::new();
        queue.extend((0..100).map(|i| format!("http://10.0.1.{}:80", i)));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(uri) = queue.next(Duration::from_millis(20)).await {
                    seen.push(uri);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
    }
}
