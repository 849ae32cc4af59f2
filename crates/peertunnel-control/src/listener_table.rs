//! Local listeners reachable through this node
//!
//! Maps a listener instance number (the port of a tunnel address) to the
//! callback that accepts inbound tunnel streams for it.

use peertunnel_connection::DuplexStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Callback receiving one end of each inbound tunnel
pub type InboundCallback = Arc<dyn Fn(DuplexStream) + Send + Sync>;

/// Table of local listeners keyed by port
#[derive(Clone, Default)]
pub struct ListenerTable {
    listeners: Arc<RwLock<HashMap<u32, InboundCallback>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `port`, replacing any previous listener.
    /// Returns true when a listener was replaced.
    pub async fn register(&self, port: u32, callback: InboundCallback) -> bool {
        let replaced = self.listeners.write().await.insert(port, callback).is_some();
        if replaced {
            tracing::warn!(port, "Replaced existing tunnel listener");
        } else {
            tracing::debug!(port, "Registered tunnel listener");
        }
        replaced
    }

    pub async fn get(&self, port: u32) -> Option<InboundCallback> {
        self.listeners.read().await.get(&port).cloned()
    }

    pub async fn remove(&self, port: u32) -> bool {
        let removed = self.listeners.write().await.remove(&port).is_some();
        if removed {
            tracing::debug!(port, "Removed tunnel listener");
        }
        removed
    }

    pub async fn ports(&self) -> Vec<u32> {
        let mut ports: Vec<u32> = self.listeners.read().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peertunnel_connection::StreamError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> InboundCallback {
        Arc::new(move |_stream| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let table = ListenerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(!table.register(7, counting_callback(hits.clone())).await);
        let callback = table.get(7).await.unwrap();
        callback(DuplexStream::failed(StreamError::Closed));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(table.get(8).await.is_none());
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let table = ListenerTable::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        table.register(0, counting_callback(first.clone())).await;
        assert!(table.register(0, counting_callback(second.clone())).await);

        table.get(0).await.unwrap()(DuplexStream::failed(StreamError::Closed));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_and_ports() {
        let table = ListenerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.register(3, counting_callback(hits.clone())).await;
        table.register(1, counting_callback(hits)).await;

        assert_eq!(table.ports().await, vec![1, 3]);
        assert!(table.remove(3).await);
        assert!(!table.remove(3).await);
        assert_eq!(table.ports().await, vec![1]);
    }
}
