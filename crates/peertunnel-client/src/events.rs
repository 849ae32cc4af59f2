//! Observable listener events

use peertunnel_proto::PeerId;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lose the oldest events
const EVENT_CAPACITY: usize = 100;

/// Events emitted by listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Registration with the portal succeeded
    Listening { portal: PeerId },
    /// Connection to the portal went away after registration
    Closed { portal: PeerId },
    /// Dialing the portal failed
    DialFailed { portal: PeerId, error: String },
    /// The portal rejected or failed the announcement
    AnnounceFailed { portal: PeerId, error: String },
    /// A listener was closed locally
    ListenerClosed { port: u32 },
}

/// Fan-out of tunnel events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped when nobody listens
    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
