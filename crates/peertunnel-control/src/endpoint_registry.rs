//! Registry of endpoints that announced themselves to this portal
//!
//! Each entry maps the announcing peer's identifier to the live connection
//! the announcement arrived on, so connect requests for that peer can be
//! forwarded over it. The last announcement wins. Entries never expire:
//! a stale connection stays forwardable until the peer announces again.

use chrono::{DateTime, Utc};
use peertunnel_connection::PeerConnection;
use peertunnel_proto::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An announced endpoint with the connection used to reach it
#[derive(Clone)]
pub struct RegisteredEndpoint {
    pub peer_id: PeerId,
    pub connection: Arc<dyn PeerConnection>,
    /// Time of the most recent announcement
    pub announced_at: DateTime<Utc>,
}

impl std::fmt::Debug for RegisteredEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredEndpoint")
            .field("peer_id", &self.peer_id)
            .field("announced_at", &self.announced_at)
            .finish()
    }
}

/// Registry of announced endpoints
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<PeerId, RegisteredEndpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection` as the way to reach `peer_id`.
    ///
    /// Returns the entry that was replaced, if the peer had announced before.
    pub async fn announce(
        &self,
        peer_id: PeerId,
        connection: Arc<dyn PeerConnection>,
    ) -> Option<RegisteredEndpoint> {
        let endpoint = RegisteredEndpoint {
            peer_id: peer_id.clone(),
            connection,
            announced_at: Utc::now(),
        };

        let replaced = self
            .endpoints
            .write()
            .await
            .insert(peer_id.clone(), endpoint);

        if let Some(ref old) = replaced {
            tracing::debug!(
                endpoint = %peer_id,
                previous_announce = %old.announced_at,
                "Endpoint re-announced (replaced previous connection)"
            );
        } else {
            tracing::info!(endpoint = %peer_id, "Registered new endpoint");
        }

        replaced
    }

    /// Connection to forward to for `peer_id`
    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerConnection>> {
        self.endpoints
            .read()
            .await
            .get(peer_id)
            .map(|e| e.connection.clone())
    }

    pub async fn entry(&self, peer_id: &PeerId) -> Option<RegisteredEndpoint> {
        self.endpoints.read().await.get(peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.endpoints.read().await.contains_key(peer_id)
    }

    /// Snapshot of the announced identifiers, sorted
    pub async fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.endpoints.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn count(&self) -> usize {
        self.endpoints.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peertunnel_connection::{MemoryNetwork, PeerDialer};
    use std::time::Duration;

    async fn connection_to(
        network: &MemoryNetwork,
        target: &PeerId,
    ) -> Arc<dyn PeerConnection> {
        let dialer_id = PeerId::generate();
        let dialer = network
            .join(dialer_id.clone(), Arc::new(crate::RelayService::new(dialer_id)))
            .await;
        dialer.dial(target).await.unwrap()
    }

    async fn setup() -> (MemoryNetwork, PeerId) {
        let network = MemoryNetwork::new();
        let portal = PeerId::generate();
        network
            .join(portal.clone(), Arc::new(crate::RelayService::new(portal.clone())))
            .await;
        (network, portal)
    }

    #[tokio::test]
    async fn test_announce_new_endpoint() {
        let (network, portal) = setup().await;
        let registry = EndpointRegistry::new();
        let peer = PeerId::generate();

        let replaced = registry
            .announce(peer.clone(), connection_to(&network, &portal).await)
            .await;

        assert!(replaced.is_none());
        assert_eq!(registry.count().await, 1);
        assert!(registry.contains(&peer).await);
        assert!(registry.get(&peer).await.is_some());
    }

    #[tokio::test]
    async fn test_reannounce_replaces_connection() {
        let (network, portal) = setup().await;
        let registry = EndpointRegistry::new();
        let peer = PeerId::generate();

        registry
            .announce(peer.clone(), connection_to(&network, &portal).await)
            .await;
        let first = registry.entry(&peer).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let replaced = registry
            .announce(peer.clone(), connection_to(&network, &portal).await)
            .await;

        assert_eq!(replaced.unwrap().announced_at, first.announced_at);
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.ids().await, vec![peer.clone()]);

        let second = registry.entry(&peer).await.unwrap();
        assert!(second.announced_at >= first.announced_at);
        assert!(!Arc::ptr_eq(&first.connection, &second.connection));
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let registry = EndpointRegistry::new();
        let peer = PeerId::generate();
        assert!(registry.get(&peer).await.is_none());
        assert!(registry.ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_ids_is_a_snapshot() {
        let (network, portal) = setup().await;
        let registry = EndpointRegistry::new();
        let a = PeerId::generate();
        let b = PeerId::generate();

        registry
            .announce(a.clone(), connection_to(&network, &portal).await)
            .await;
        let snapshot = registry.ids().await;

        registry
            .announce(b.clone(), connection_to(&network, &portal).await)
            .await;

        assert_eq!(snapshot, vec![a.clone()]);
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(registry.ids().await, expected);
    }
}
