//! Pump bytes between a TCP socket and a tunnel stream

use bytes::Bytes;
use peertunnel_connection::{DuplexStream, StreamError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_BUFFER: usize = 16 * 1024;

/// Copy in both directions until each side has ended
pub async fn bridge(socket: TcpStream, stream: DuplexStream) {
    let peer = socket.peer_addr().ok();
    let (mut tcp_read, mut tcp_write) = socket.into_split();
    let (mut sink, mut source) = stream.split();

    let upstream = async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) => {
                    sink.close();
                    break;
                }
                Ok(n) => {
                    if sink.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    sink.abort(StreamError::Remote(e.to_string())).await;
                    break;
                }
            }
        }
    };

    let downstream = async move {
        loop {
            match source.recv().await {
                Ok(Some(data)) => {
                    if tcp_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tcp_write.shutdown().await;
                    break;
                }
                Err(e) => {
                    debug!(?peer, error = %e, "Tunnel stream failed");
                    break;
                }
            }
        }
    };

    tokio::join!(upstream, downstream);
    debug!(?peer, "Bridge finished");
}
