//! Listener, portal and dialer nodes on an in-memory network

use bytes::Bytes;
use peertunnel_client::{
    EngineState, TransportInstance, TransportPlugin, TunnelConfig, TunnelError, TunnelEvent,
    TunnelNode,
};
use peertunnel_connection::{DuplexStream, MemoryNetwork, StreamError};
use peertunnel_control::{InboundCallback, RelayService};
use peertunnel_proto::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("peertunnel=debug")
        .try_init();
}

async fn spawn_node(network: &MemoryNetwork) -> TunnelNode {
    let id = PeerId::generate();
    let relay = Arc::new(RelayService::new(id.clone()));
    let dialer = network.join(id, relay.clone()).await;
    TunnelNode::new(Arc::new(dialer), relay).unwrap()
}

fn listener_config(portal: &TunnelNode) -> TunnelConfig {
    TunnelConfig::builder()
        .portal(portal.id().as_str())
        .build()
        .unwrap()
}

/// Callback that echoes every chunk back with a prefix
fn echo_callback() -> InboundCallback {
    Arc::new(|stream: DuplexStream| {
        tokio::spawn(async move {
            let (mut sink, mut source) = stream.split();
            while let Ok(Some(data)) = source.recv().await {
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&data);
                if sink.send(Bytes::from(reply)).await.is_err() {
                    break;
                }
            }
            sink.close();
        });
    })
}

async fn next_listening(events: &mut broadcast::Receiver<TunnelEvent>) -> PeerId {
    loop {
        if let TunnelEvent::Listening { portal } = events.recv().await.unwrap() {
            return portal;
        }
    }
}

#[tokio::test]
async fn test_tunnel_end_to_end() {
    init_tracing();
    let network = MemoryNetwork::new();
    let portal = spawn_node(&network).await;
    let listener = spawn_node(&network).await;
    let dialer = spawn_node(&network).await;

    let mut events = listener.subscribe();
    let instance = listener
        .transport()
        .create(listener_config(&portal), 0);
    assert_eq!(instance.name(), "tunnel");
    assert_eq!(instance.scope(), "public");
    assert_eq!(instance.stringify(), None);

    let handle = instance.server(echo_callback()).await.unwrap();
    assert_eq!(next_listening(&mut events).await, *portal.id());
    assert_eq!(handle.state(), EngineState::Registered);

    let addr = instance.stringify().unwrap();
    assert_eq!(
        addr,
        format!("tunnel:{}:{}:0", portal.id(), listener.id())
    );

    let client = dialer.transport().create(TunnelConfig::default(), 0);
    let tunnel = client.client(&addr).await.unwrap();
    let (mut sink, mut source) = tunnel.split();

    sink.send(Bytes::from("ping")).await.unwrap();
    assert_eq!(source.recv().await.unwrap(), Some(Bytes::from("echo:ping")));

    handle.close();
}

#[tokio::test]
async fn test_client_rejects_non_tunnel_address() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = spawn_node(&network).await;
    let instance = node.transport().create(TunnelConfig::default(), 0);

    let result = instance.client("net:localhost:8008~shs:abc").await;
    assert!(matches!(result, Err(TunnelError::InvalidAddress(_))));
}

#[tokio::test]
async fn test_client_reports_unreachable_portal() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = spawn_node(&network).await;
    let instance = node.transport().create(TunnelConfig::default(), 0);

    let addr = format!("tunnel:{}:{}:0", PeerId::generate(), PeerId::generate());
    let result = instance.client(&addr).await;
    assert!(matches!(result, Err(TunnelError::Dial(_))));
}

#[tokio::test]
async fn test_unknown_target_fails_on_first_use() {
    init_tracing();
    let network = MemoryNetwork::new();
    let portal = spawn_node(&network).await;
    let dialer = spawn_node(&network).await;
    let stranger = PeerId::generate();

    let instance = dialer.transport().create(TunnelConfig::default(), 0);
    let addr = format!("tunnel:{}:{}:3", portal.id(), stranger);
    let mut tunnel = instance.client(&addr).await.unwrap();

    let err = tunnel.source_mut().recv().await.unwrap_err();
    assert_eq!(err, StreamError::could_not_connect(&stranger));
}

#[tokio::test]
async fn test_tunnel_to_portal_itself() {
    init_tracing();
    let network = MemoryNetwork::new();
    let portal = spawn_node(&network).await;
    let dialer = spawn_node(&network).await;

    // The portal listens on instance 7 of its own node, registered with itself
    let instance = portal.transport().create(listener_config(&portal), 7);
    let mut events = portal.subscribe();
    let handle = instance.server(echo_callback()).await.unwrap();
    next_listening(&mut events).await;

    let addr = format!("tunnel:{}:{}:7", portal.id(), portal.id());
    let client = dialer.transport().create(TunnelConfig::default(), 0);
    let (mut sink, mut source) = client.client(&addr).await.unwrap().split();
    sink.send(Bytes::from("self")).await.unwrap();
    assert_eq!(source.recv().await.unwrap(), Some(Bytes::from("echo:self")));

    handle.close();
}

#[tokio::test(start_paused = true)]
async fn test_reregisters_after_portal_restart() {
    init_tracing();
    let network = MemoryNetwork::new();
    let portal = spawn_node(&network).await;
    let listener = spawn_node(&network).await;

    let mut events = listener.subscribe();
    let instance = listener.transport().create(listener_config(&portal), 0);
    let handle = instance.server(echo_callback()).await.unwrap();
    next_listening(&mut events).await;

    // Portal goes down: links drop and new dials fail for a while
    network.set_reachable(portal.id(), false).await;
    network.sever(portal.id()).await;

    let mut dial_failures = 0;
    while dial_failures < 3 {
        match events.recv().await.unwrap() {
            TunnelEvent::DialFailed { .. } => dial_failures += 1,
            TunnelEvent::Closed { portal: closed } => assert_eq!(closed, *portal.id()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    network.set_reachable(portal.id(), true).await;
    assert_eq!(next_listening(&mut events).await, *portal.id());
    assert_eq!(portal.relay().endpoints().ids().await, vec![listener.id().clone()]);

    handle.close();
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_registration() {
    init_tracing();
    let network = MemoryNetwork::new();
    let portal = PeerId::generate();
    let listener = spawn_node(&network).await;

    let config = TunnelConfig::builder()
        .portal(portal.as_str())
        .build()
        .unwrap();
    let mut events = listener.subscribe();
    let handle = listener
        .transport()
        .create(config, 0)
        .server(echo_callback())
        .await
        .unwrap();

    // Portal never joined: every dial fails
    for _ in 0..3 {
        assert!(matches!(
            events.recv().await.unwrap(),
            TunnelEvent::DialFailed { .. }
        ));
    }

    handle.close();
    handle.wait_for(EngineState::Closed).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let mut closed_seen = false;
    let mut failures_after_close = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TunnelEvent::ListenerClosed { port } => {
                assert_eq!(port, 0);
                closed_seen = true;
            }
            TunnelEvent::DialFailed { .. } if closed_seen => failures_after_close += 1,
            TunnelEvent::DialFailed { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(closed_seen);
    // At most the attempt that was already in flight
    assert!(failures_after_close <= 1);
}

#[tokio::test(start_paused = true)]
async fn test_node_shutdown_halts_all_listeners() {
    init_tracing();
    let network = MemoryNetwork::new();
    let portal = spawn_node(&network).await;
    let listener = spawn_node(&network).await;

    let transport = listener.transport();
    let mut events = listener.subscribe();
    let first = transport
        .create(listener_config(&portal), 0)
        .server(echo_callback())
        .await
        .unwrap();
    let second = transport
        .create(listener_config(&portal), 1)
        .server(echo_callback())
        .await
        .unwrap();
    next_listening(&mut events).await;
    next_listening(&mut events).await;

    listener.shutdown();
    first.wait_for(EngineState::Closed).await;
    second.wait_for(EngineState::Closed).await;

    let late = transport
        .create(listener_config(&portal), 2)
        .server(echo_callback())
        .await;
    assert!(matches!(late, Err(TunnelError::Shutdown)));
}

#[tokio::test]
async fn test_server_requires_portal() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = spawn_node(&network).await;
    let result = node
        .transport()
        .create(TunnelConfig::default(), 0)
        .server(echo_callback())
        .await;
    assert!(matches!(result, Err(TunnelError::ConfigError(_))));
}
