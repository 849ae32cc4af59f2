//! One authenticated connection between two peers
//!
//! A session owns a reader task and a writer task. Calls started locally use
//! call ids of one parity (odd for the side that dialed, even for the side
//! that accepted), so both sides can start calls without coordinating.
//! When the reader stops, for any reason, the close signal fires, pending
//! calls fail with `Closed` and open streams are aborted.

use crate::error::NetError;
use crate::frame::FrameCodec;
use crate::HANDSHAKE_TIMEOUT;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peertunnel_connection::{
    close_signal, Caller, CloseSignal, CloseTrigger, DuplexStream, PeerConnection, RpcError,
    RpcHandler, StreamError,
};
use peertunnel_proto::{
    is_feed_id, CallId, ConnectOpts, PeerId, RpcCall, RpcMethod, RpcReply, TunnelMessage,
    WireError, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Frames queued for the writer before senders wait
const OUTBOUND_BUFFER: usize = 1024;

/// Which end of the TCP connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

impl Role {
    fn first_call_id(self) -> CallId {
        match self {
            Role::Dialer => 1,
            Role::Acceptor => 2,
        }
    }

    /// Whether `call_id` belongs to calls this side starts
    fn owns(self, call_id: CallId) -> bool {
        call_id % 2 == self.first_call_id() % 2
    }
}

/// Exchange `Hello` frames and return the remote peer's identifier
pub async fn handshake<R, W>(
    reader: &mut FramedRead<R, FrameCodec>,
    writer: &mut FramedWrite<W, FrameCodec>,
    local_id: &PeerId,
) -> Result<PeerId, NetError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange_hello(reader, writer, local_id))
        .await
        .map_err(|_| NetError::Handshake("timed out".into()))?
}

async fn exchange_hello<R, W>(
    reader: &mut FramedRead<R, FrameCodec>,
    writer: &mut FramedWrite<W, FrameCodec>,
    local_id: &PeerId,
) -> Result<PeerId, NetError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .send(TunnelMessage::Hello {
            peer_id: local_id.clone(),
            version: PROTOCOL_VERSION,
        })
        .await?;

    match reader.next().await {
        Some(Ok(TunnelMessage::Hello { peer_id, version })) => {
            if version != PROTOCOL_VERSION {
                return Err(NetError::VersionMismatch(version));
            }
            if !is_feed_id(peer_id.as_str()) {
                return Err(NetError::Handshake(format!("invalid peer id {}", peer_id)));
            }
            Ok(peer_id)
        }
        Some(Ok(other)) => Err(NetError::Handshake(format!(
            "expected Hello, got {}",
            other.message_type()
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(NetError::Closed),
    }
}

enum Inbound {
    Data(Bytes),
    End(Option<StreamError>),
}

type InboundRx = mpsc::UnboundedReceiver<Inbound>;

struct SessionShared {
    local_id: PeerId,
    remote_id: PeerId,
    role: Role,
    handler: Arc<dyn RpcHandler>,
    outbound: mpsc::Sender<TunnelMessage>,
    pending: Mutex<HashMap<CallId, oneshot::Sender<RpcReply>>>,
    streams: Mutex<HashMap<CallId, mpsc::UnboundedSender<Inbound>>>,
    next_call_id: AtomicU32,
    trigger: CloseTrigger,
}

impl SessionShared {
    async fn send(&self, msg: TunnelMessage) -> Result<(), NetError> {
        self.outbound.send(msg).await.map_err(|_| NetError::Closed)
    }

    fn allocate_call_id(&self) -> CallId {
        self.next_call_id.fetch_add(2, Ordering::SeqCst)
    }

    async fn call(&self, call: RpcCall) -> Result<RpcReply, RpcError> {
        if self.trigger.is_closed() {
            return Err(RpcError::Closed);
        }
        let call_id = self.allocate_call_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id, tx);

        // Cleanup closes the trigger before draining `pending`
        if self.trigger.is_closed() {
            self.pending.lock().await.remove(&call_id);
            return Err(RpcError::Closed);
        }

        trace!(call_id, method = call.method().name(), "Sending request");
        if self.send(TunnelMessage::Request { call_id, call }).await.is_err() {
            self.pending.lock().await.remove(&call_id);
            return Err(RpcError::Closed);
        }

        match rx.await {
            Ok(RpcReply::Error(e)) => Err(e.into()),
            Ok(reply) => Ok(reply),
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Start buffering frames for `call_id`
    async fn open_route(&self, call_id: CallId) -> Result<InboundRx, StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.streams.lock().await;
            if streams.contains_key(&call_id) {
                return Err(StreamError::InvalidRequest(format!(
                    "call id {} is already in use",
                    call_id
                )));
            }
            streams.insert(call_id, tx);
        }

        // Cleanup closes the trigger before draining `streams`
        if self.trigger.is_closed() {
            self.streams.lock().await.remove(&call_id);
            return Err(StreamError::Closed);
        }
        Ok(rx)
    }

    /// Feed frames routed to `call_id` into `stream` and its output back out
    fn bridge(self: &Arc<Self>, call_id: CallId, mut rx: InboundRx, stream: DuplexStream) {
        let (mut sink, mut source) = stream.split();

        let shared = self.clone();
        tokio::spawn(async move {
            let mut ended = false;
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Data(data) => {
                        if sink.send(data).await.is_err() {
                            break;
                        }
                    }
                    Inbound::End(None) => {
                        sink.close();
                        ended = true;
                        break;
                    }
                    Inbound::End(Some(e)) => {
                        sink.abort(e).await;
                        ended = true;
                        break;
                    }
                }
            }
            if !ended {
                sink.abort(StreamError::Closed).await;
            }
            shared.streams.lock().await.remove(&call_id);
        });

        let shared = self.clone();
        tokio::spawn(async move {
            let mut closed = shared.trigger.signal();
            loop {
                let next = tokio::select! {
                    next = source.recv() => next,
                    _ = closed.closed() => break,
                };
                let frame = match next {
                    Ok(Some(data)) => TunnelMessage::StreamData {
                        call_id,
                        data: data.to_vec(),
                    },
                    Ok(None) => TunnelMessage::StreamEnd {
                        call_id,
                        error: None,
                    },
                    Err(e) => TunnelMessage::StreamEnd {
                        call_id,
                        error: Some(WireError::from(&e)),
                    },
                };
                let last = matches!(frame, TunnelMessage::StreamEnd { .. });
                if shared.send(frame).await.is_err() || last {
                    break;
                }
            }
        });
    }

    async fn route(&self, call_id: CallId, inbound: Inbound) {
        match self.streams.lock().await.get(&call_id) {
            Some(tx) => {
                let _ = tx.send(inbound);
            }
            None => trace!(call_id, "Frame for unknown stream"),
        }
    }

    /// Answer a request the remote side started
    async fn accept_request(self: &Arc<Self>, call_id: CallId, call: RpcCall) {
        if self.role.owns(call_id) {
            warn!(
                peer = %self.remote_id.short(),
                call_id,
                "Rejecting request with a call id of our own parity"
            );
            let err =
                StreamError::InvalidRequest(format!("call id {} has the wrong parity", call_id));
            self.refuse(call_id, &call, err).await;
            return;
        }

        match call {
            RpcCall::Connect { opts } => {
                // Stream frames can follow the request before the handler answers
                match self.open_route(call_id).await {
                    Ok(inbound) => {
                        tokio::spawn(self.clone().serve_connect(call_id, opts, inbound));
                    }
                    Err(e) => self.refuse(call_id, &RpcCall::Connect { opts }, e).await,
                }
            }
            call => {
                tokio::spawn(self.clone().serve_call(call_id, call));
            }
        }
    }

    async fn refuse(&self, call_id: CallId, call: &RpcCall, err: StreamError) {
        let error = WireError::from(&err);
        let msg = match call {
            RpcCall::Connect { .. } => TunnelMessage::StreamEnd {
                call_id,
                error: Some(error),
            },
            _ => TunnelMessage::Response {
                call_id,
                reply: RpcReply::Error(error),
            },
        };
        let _ = self.send(msg).await;
    }

    async fn serve_connect(
        self: Arc<Self>,
        call_id: CallId,
        opts: Option<ConnectOpts>,
        inbound: InboundRx,
    ) {
        debug!(peer = %self.remote_id.short(), call_id, "Incoming connect");

        let stream = match self.handler.authorize(&self.remote_id, RpcMethod::Connect) {
            Ok(()) => self.handler.connect(&self.remote_id, opts).await,
            Err(e) => DuplexStream::failed(StreamError::from(WireError::from(&e))),
        };
        match stream.failure() {
            Some(e) => {
                self.streams.lock().await.remove(&call_id);
                let end = TunnelMessage::StreamEnd {
                    call_id,
                    error: Some(WireError::from(e)),
                };
                let _ = self.send(end).await;
            }
            None => self.bridge(call_id, inbound, stream),
        }
    }

    async fn serve_call(self: Arc<Self>, call_id: CallId, call: RpcCall) {
        let method = call.method();
        debug!(peer = %self.remote_id.short(), call_id, method = method.name(), "Incoming call");

        let result = match self.handler.authorize(&self.remote_id, method) {
            Ok(()) => self.dispatch(call).await,
            Err(e) => Err(e),
        };
        let reply = result.unwrap_or_else(|e| RpcReply::Error(WireError::from(&e)));
        let _ = self.send(TunnelMessage::Response { call_id, reply }).await;
    }

    async fn dispatch(self: &Arc<Self>, call: RpcCall) -> Result<RpcReply, RpcError> {
        match call {
            RpcCall::Announce => {
                let caller = Caller {
                    id: self.remote_id.clone(),
                    connection: Arc::new(Session {
                        shared: self.clone(),
                    }),
                };
                self.handler.announce(caller).await?;
                Ok(RpcReply::Ack)
            }
            RpcCall::Ping => Ok(RpcReply::Timestamp(self.handler.ping().await?)),
            RpcCall::List => Ok(RpcReply::Peers(self.handler.list().await?)),
            RpcCall::Connect { .. } => Err(RpcError::InvalidRequest(
                "connect is a duplex call".into(),
            )),
        }
    }

    async fn teardown(&self) {
        self.trigger.close();
        self.pending.lock().await.clear();
        self.streams.lock().await.clear();
        debug!(peer = %self.remote_id.short(), "Session closed");
    }
}

/// A live session with a remote peer
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Start the reader and writer tasks for an already handshaken connection
    pub fn start<R, W>(
        local_id: PeerId,
        remote_id: PeerId,
        role: Role,
        reader: FramedRead<R, FrameCodec>,
        writer: FramedWrite<W, FrameCodec>,
        handler: Arc<dyn RpcHandler>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (trigger, _) = close_signal();

        let shared = Arc::new(SessionShared {
            local_id,
            remote_id,
            role,
            handler,
            outbound,
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(role.first_call_id()),
            trigger,
        });

        tokio::spawn(write_loop(shared.trigger.signal(), outbound_rx, writer));
        tokio::spawn(read_loop(shared.clone(), reader));

        debug!(
            local = %shared.local_id.short(),
            peer = %shared.remote_id.short(),
            ?role,
            "Session established"
        );
        Self { shared }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.trigger.is_closed()
    }
}

async fn write_loop<W>(
    mut closed: CloseSignal,
    mut outbound: mpsc::Receiver<TunnelMessage>,
    mut writer: FramedWrite<W, FrameCodec>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = outbound.recv() => msg,
            _ = closed.closed() => None,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = writer.send(msg).await {
            warn!(error = %e, "Failed to write frame");
            break;
        }
    }
    let _ = writer.close().await;
}

async fn read_loop<R>(shared: Arc<SessionShared>, mut reader: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.trigger.signal();
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = closed.closed() => break,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(peer = %shared.remote_id.short(), error = %e, "Dropping session on bad frame");
                break;
            }
            None => break,
        };

        match msg {
            TunnelMessage::Request { call_id, call } => {
                shared.accept_request(call_id, call).await;
            }
            TunnelMessage::Response { call_id, reply } => {
                match shared.pending.lock().await.remove(&call_id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => trace!(call_id, "Response for unknown call"),
                }
            }
            TunnelMessage::StreamData { call_id, data } => {
                shared.route(call_id, Inbound::Data(Bytes::from(data))).await;
            }
            TunnelMessage::StreamEnd { call_id, error } => {
                shared
                    .route(call_id, Inbound::End(error.map(StreamError::from)))
                    .await;
            }
            TunnelMessage::Goodbye { reason } => {
                debug!(peer = %shared.remote_id.short(), %reason, "Peer said goodbye");
                break;
            }
            TunnelMessage::Hello { .. } => {
                warn!(peer = %shared.remote_id.short(), "Ignoring repeated Hello");
            }
        }
    }
    shared.teardown().await;
}

#[async_trait]
impl PeerConnection for Session {
    fn remote_id(&self) -> &PeerId {
        &self.shared.remote_id
    }

    async fn announce(&self) -> Result<(), RpcError> {
        match self.shared.call(RpcCall::Announce).await? {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn connect(&self, opts: Option<ConnectOpts>) -> DuplexStream {
        if self.is_closed() {
            return DuplexStream::failed(StreamError::Closed);
        }
        let call_id = self.shared.allocate_call_id();
        let inbound = match self.shared.open_route(call_id).await {
            Ok(inbound) => inbound,
            Err(e) => return DuplexStream::failed(e),
        };
        let (local, user) = DuplexStream::pair();
        self.shared.bridge(call_id, inbound, local);

        let request = TunnelMessage::Request {
            call_id,
            call: RpcCall::Connect { opts },
        };
        if self.shared.send(request).await.is_err() {
            return DuplexStream::failed(StreamError::Closed);
        }
        user
    }

    async fn ping(&self) -> Result<u64, RpcError> {
        match self.shared.call(RpcCall::Ping).await? {
            RpcReply::Timestamp(ts) => Ok(ts),
            other => Err(unexpected(other)),
        }
    }

    async fn list(&self) -> Result<Vec<PeerId>, RpcError> {
        match self.shared.call(RpcCall::List).await? {
            RpcReply::Peers(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    fn close_signal(&self) -> CloseSignal {
        self.shared.trigger.signal()
    }

    fn close(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _ = shared
                .send(TunnelMessage::Goodbye {
                    reason: "closed".into(),
                })
                .await;
            shared.trigger.close();
        });
    }
}

fn unexpected(reply: RpcReply) -> RpcError {
    RpcError::Remote(format!("unexpected reply {:?}", reply))
}
