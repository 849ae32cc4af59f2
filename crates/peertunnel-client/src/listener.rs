//! Listener registration with a portal
//!
//! A [`ReconnectEngine`] keeps one listener announced at its portal:
//!
//! ```text
//! Idle -> Dialing -> Announcing -> Registered
//!   ^        |           |             |
//!   +--------+-----------+-------------+   (random delay, then retry)
//! ```
//!
//! Dial failure, announce failure and loss of the portal connection all lead
//! back to `Idle` after a delay drawn uniformly from `[0, max_jitter)`. The
//! engine runs as a single task, so attempts never overlap. Cancelling its
//! token halts it for good; an in-flight dial or announce is allowed to finish
//! but nothing follows it.

use crate::events::{EventBus, TunnelEvent};
use peertunnel_connection::{JitterBackoff, PeerConnection, PeerDialer, ReconnectConfig};
use peertunnel_proto::PeerId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registration state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Dialing,
    Announcing,
    Registered,
    /// Terminal
    Closed,
}

/// Per-listener registration loop
pub struct ReconnectEngine {
    dialer: Arc<dyn PeerDialer>,
    portal: PeerId,
    backoff: JitterBackoff,
    events: EventBus,
    cancel: CancellationToken,
    state: watch::Sender<EngineState>,
}

impl ReconnectEngine {
    pub fn new(
        dialer: Arc<dyn PeerDialer>,
        portal: PeerId,
        config: ReconnectConfig,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            dialer,
            portal,
            backoff: JitterBackoff::new(config),
            events,
            cancel,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Run the engine on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        // Start on the next scheduling tick, never inside the caller's frame
        tokio::task::yield_now().await;

        while !self.cancel.is_cancelled() {
            let delay_next = match self.attempt().await {
                Some(connection) => self.hold(connection).await,
                None => true,
            };
            if !delay_next || !self.retry().await {
                break;
            }
        }

        self.state.send_replace(EngineState::Closed);
        debug!(portal = %self.portal, "Listener registration stopped");
    }

    /// Dial and announce once. Returns the registered connection on success.
    async fn attempt(&mut self) -> Option<Arc<dyn PeerConnection>> {
        self.state.send_replace(EngineState::Dialing);
        debug!(portal = %self.portal, "Connecting to portal");

        let connection = match self.dialer.dial(&self.portal).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(portal = %self.portal, error = %e, "Failed to connect to portal");
                self.events.emit(TunnelEvent::DialFailed {
                    portal: self.portal.clone(),
                    error: e.to_string(),
                });
                return None;
            }
        };

        if self.cancel.is_cancelled() {
            return None;
        }

        self.state.send_replace(EngineState::Announcing);
        if let Err(e) = connection.announce().await {
            warn!(portal = %self.portal, error = %e, "Error during announcement at portal");
            self.events.emit(TunnelEvent::AnnounceFailed {
                portal: self.portal.clone(),
                error: e.to_string(),
            });
            return None;
        }

        if self.cancel.is_cancelled() {
            return None;
        }

        self.state.send_replace(EngineState::Registered);
        self.backoff.reset();
        info!(portal = %self.portal, "Established portal registration");
        self.events.emit(TunnelEvent::Listening {
            portal: self.portal.clone(),
        });
        Some(connection)
    }

    /// Stay registered until the portal connection closes.
    /// Returns false when the engine was cancelled instead.
    async fn hold(&mut self, connection: Arc<dyn PeerConnection>) -> bool {
        let mut closed = connection.close_signal();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = closed.closed() => {
                info!(portal = %self.portal, "Portal connection closed");
                self.events.emit(TunnelEvent::Closed {
                    portal: self.portal.clone(),
                });
                true
            }
        }
    }

    /// Back to `Idle` and wait out the jitter. Returns false when cancelled.
    async fn retry(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.state.send_replace(EngineState::Idle);
        self.backoff.wait(&self.cancel).await.is_ok()
    }
}

/// Handle to a started listener
#[derive(Debug)]
pub struct ListenerHandle {
    port: u32,
    portal: PeerId,
    cancel: CancellationToken,
    state: watch::Receiver<EngineState>,
    events: EventBus,
}

impl ListenerHandle {
    pub(crate) fn new(
        port: u32,
        portal: PeerId,
        cancel: CancellationToken,
        state: watch::Receiver<EngineState>,
        events: EventBus,
    ) -> Self {
        Self {
            port,
            portal,
            cancel,
            state,
            events,
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn portal(&self) -> &PeerId {
        &self.portal
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Wait until the engine reaches `target`
    pub async fn wait_for(&self, target: EngineState) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == target).await;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop re-registering with the portal. Pending retries are dropped; an
    /// announce already on the wire is left to complete.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!(port = self.port, "Closing tunnel listener");
        self.cancel.cancel();
        self.events.emit(TunnelEvent::ListenerClosed { port: self.port });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use peertunnel_connection::{
        close_signal, CloseSignal, CloseTrigger, DialError, DuplexStream, RpcError, StreamError,
    };
    use peertunnel_proto::ConnectOpts;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    enum Outcome {
        DialFails,
        AnnounceFails,
        Registers(CloseTrigger),
        /// Dial hangs until the gate opens, then registers
        DialBlocks(Arc<Notify>, CloseTrigger),
        /// Announce hangs until the gate opens, then succeeds
        AnnounceBlocks(Arc<Notify>, CloseTrigger),
    }

    struct ScriptedConnection {
        portal: PeerId,
        announce_ok: bool,
        announce_gate: Option<Arc<Notify>>,
        announces: Arc<AtomicUsize>,
        trigger: CloseTrigger,
    }

    #[async_trait]
    impl PeerConnection for ScriptedConnection {
        fn remote_id(&self) -> &PeerId {
            &self.portal
        }

        async fn announce(&self) -> Result<(), RpcError> {
            self.announces.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.announce_gate {
                gate.notified().await;
            }
            if self.announce_ok {
                Ok(())
            } else {
                Err(RpcError::Remote("announce rejected".into()))
            }
        }

        async fn connect(&self, _opts: Option<ConnectOpts>) -> DuplexStream {
            DuplexStream::failed(StreamError::Closed)
        }

        async fn ping(&self) -> Result<u64, RpcError> {
            Ok(0)
        }

        async fn list(&self) -> Result<Vec<PeerId>, RpcError> {
            Ok(Vec::new())
        }

        fn close_signal(&self) -> CloseSignal {
            self.trigger.signal()
        }

        fn close(&self) {
            self.trigger.close();
        }
    }

    /// Dialer that plays back a script and tracks overlapping dials
    struct ScriptedDialer {
        local: PeerId,
        script: Mutex<VecDeque<Outcome>>,
        dials: AtomicUsize,
        announces: Arc<AtomicUsize>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                local: PeerId::generate(),
                script: Mutex::new(script.into()),
                dials: AtomicUsize::new(0),
                announces: Arc::new(AtomicUsize::new(0)),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        fn announces(&self) -> usize {
            self.announces.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerDialer for ScriptedDialer {
        fn local_id(&self) -> &PeerId {
            &self.local
        }

        async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn PeerConnection>, DialError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self.script.lock().unwrap().pop_front();
            let (announce_ok, announce_gate, trigger) = match next {
                Some(Outcome::DialFails) | None => {
                    return Err(DialError::Unreachable(peer.clone()))
                }
                Some(Outcome::AnnounceFails) => (false, None, close_signal().0),
                Some(Outcome::Registers(trigger)) => (true, None, trigger),
                Some(Outcome::DialBlocks(gate, trigger)) => {
                    gate.notified().await;
                    (true, None, trigger)
                }
                Some(Outcome::AnnounceBlocks(gate, trigger)) => (true, Some(gate), trigger),
            };
            Ok(Arc::new(ScriptedConnection {
                portal: peer.clone(),
                announce_ok,
                announce_gate,
                announces: self.announces.clone(),
                trigger,
            }))
        }
    }

    fn engine(
        dialer: Arc<ScriptedDialer>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> ReconnectEngine {
        ReconnectEngine::new(
            dialer,
            PeerId::generate(),
            ReconnectConfig::default(),
            events,
            cancel,
        )
    }

    async fn wait_state(state: &mut watch::Receiver<EngineState>, target: EngineState) {
        state.wait_for(|s| *s == target).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_after_failures_without_overlap() {
        let (trigger, _) = close_signal();
        let dialer = ScriptedDialer::new(vec![
            Outcome::DialFails,
            Outcome::DialFails,
            Outcome::AnnounceFails,
            Outcome::DialFails,
            Outcome::Registers(trigger),
        ]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();

        let engine = engine(dialer.clone(), events, cancel.clone());
        let mut state = engine.state();
        engine.spawn();

        wait_state(&mut state, EngineState::Registered).await;
        assert_eq!(dialer.dials(), 5);
        assert_eq!(dialer.max_in_flight.load(Ordering::SeqCst), 1);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 5);
        assert!(matches!(seen[2], TunnelEvent::AnnounceFailed { .. }));
        assert!(matches!(seen[4], TunnelEvent::Listening { .. }));

        cancel.cancel();
        wait_state(&mut state, EngineState::Closed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_triggers_reregistration() {
        let (first, _) = close_signal();
        let (second, _) = close_signal();
        let dialer = ScriptedDialer::new(vec![
            Outcome::Registers(first.clone()),
            Outcome::Registers(second),
        ]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();

        let engine = engine(dialer.clone(), events, cancel.clone());
        let mut state = engine.state();
        engine.spawn();

        wait_state(&mut state, EngineState::Registered).await;
        assert_eq!(dialer.dials(), 1);

        first.close();
        // Closed event, then a fresh registration
        loop {
            if let TunnelEvent::Closed { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        loop {
            if let TunnelEvent::Listening { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(dialer.dials(), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_halts_retries() {
        let dialer = ScriptedDialer::new(Vec::new());
        let events = EventBus::new();
        let cancel = CancellationToken::new();

        let engine = engine(dialer.clone(), events.clone(), cancel.clone());
        let mut state = engine.state();
        let handle = ListenerHandle::new(0, PeerId::generate(), cancel, engine.state(), events);
        let task = engine.spawn();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let before = dialer.dials();
        assert!(before >= 2);

        handle.close();
        task.await.unwrap();
        assert_eq!(*state.borrow_and_update(), EngineState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(dialer.dials() <= before + 1);
        assert_eq!(handle.state(), EngineState::Closed);
        assert!(handle.is_closed());
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<TunnelEvent>) -> Vec<TunnelEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_announce_never_registers() {
        let gate = Arc::new(Notify::new());
        let (trigger, _) = close_signal();
        let dialer = ScriptedDialer::new(vec![Outcome::AnnounceBlocks(gate.clone(), trigger)]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();

        let engine = engine(dialer.clone(), events.clone(), cancel.clone());
        let mut state = engine.state();
        let handle = ListenerHandle::new(0, PeerId::generate(), cancel, engine.state(), events);
        let task = engine.spawn();

        wait_state(&mut state, EngineState::Announcing).await;
        handle.close();
        // The announce completes successfully after the close
        gate.notify_one();
        task.await.unwrap();
        assert_eq!(handle.state(), EngineState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.dials(), 1);
        assert_eq!(dialer.announces(), 1);

        let seen = drain(&mut rx);
        assert!(!seen
            .iter()
            .any(|event| matches!(event, TunnelEvent::Listening { .. })));
        assert!(seen
            .iter()
            .any(|event| matches!(event, TunnelEvent::ListenerClosed { port: 0 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_dial_never_announces() {
        let gate = Arc::new(Notify::new());
        let (trigger, _) = close_signal();
        let dialer = ScriptedDialer::new(vec![Outcome::DialBlocks(gate.clone(), trigger)]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();

        let engine = engine(dialer.clone(), events.clone(), cancel.clone());
        let mut state = engine.state();
        let handle = ListenerHandle::new(0, PeerId::generate(), cancel, engine.state(), events);
        let task = engine.spawn();

        wait_state(&mut state, EngineState::Dialing).await;
        // Let the dial reach the gate
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dialer.dials(), 1);

        handle.close();
        gate.notify_one();
        task.await.unwrap();
        assert_eq!(handle.state(), EngineState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.dials(), 1);
        assert_eq!(dialer.announces(), 0);
        assert!(!drain(&mut rx)
            .iter()
            .any(|event| matches!(event, TunnelEvent::Listening { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_never_dials() {
        let dialer = ScriptedDialer::new(Vec::new());
        let cancel = CancellationToken::new();
        let engine = engine(dialer.clone(), EventBus::new(), cancel.clone());

        cancel.cancel();
        engine.spawn().await.unwrap();
        assert_eq!(dialer.dials(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_bounded() {
        let (trigger, _) = close_signal();
        let dialer = ScriptedDialer::new(vec![Outcome::DialFails, Outcome::Registers(trigger)]);
        let cancel = CancellationToken::new();
        let engine = engine(dialer, EventBus::new(), cancel.clone());
        let mut state = engine.state();

        let start = tokio::time::Instant::now();
        engine.spawn();
        wait_state(&mut state, EngineState::Registered).await;

        // Two dials of 5ms each plus one delay below one second
        assert!(start.elapsed() < Duration::from_millis(1010));
        cancel.cancel();
    }
}
