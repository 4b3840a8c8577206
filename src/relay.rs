//! WebSocket ↔ TCP byte relay.
//!
//! Bridges a browser WebSocket (noVNC speaking RFB over binary frames) to the
//! local end of a tunnel. The relay never looks inside the payload and holds
//! no registry state: once the local address is known it runs on its own
//! until either side closes.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::error::BrokerError;

/// WebSocket close code for "internal error" (RFC 6455 §7.4.1).
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Bytes moved in each direction during one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Browser → hypervisor.
    pub to_target: u64,
    /// Hypervisor → browser.
    pub to_browser: u64,
}

/// Connect to the local tunnel endpoint.
///
/// ssh may still be binding its listener right after the health window, so
/// refused connections are retried `connect_attempts` times.
pub async fn connect(addr: SocketAddr, config: &RelayConfig) -> Result<TcpStream, BrokerError> {
    let attempts = config.connect_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| BrokerError::RelayFailure(format!("set TCP_NODELAY: {e}")))?;
                debug!("Relay: connected to {addr} (attempt {attempt})");
                return Ok(stream);
            }
            Err(e) => {
                trace!("Relay: connect to {addr} failed (attempt {attempt}/{attempts}): {e}");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(config.connect_retry_ms)).await;
                }
            }
        }
    }
    Err(BrokerError::RelayFailure(format!(
        "connect to {addr} failed after {attempts} attempt(s): {}",
        last_err.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
    )))
}

/// Copy bytes both ways until either side ends, then close both.
///
/// A clean close from either end is `Ok`; an I/O error mid-session is a
/// [`BrokerError::RelayFailure`], after which the browser gets a 1011 close
/// frame.
pub async fn bridge(
    socket: WebSocket,
    stream: TcpStream,
    buffer_size: usize,
) -> Result<RelayStats, BrokerError> {
    let (tcp_rx, tcp_tx) = stream.into_split();
    let (mut ws_tx, ws_rx) = socket.split();
    let mut stats = RelayStats::default();

    let result = {
        let upstream = browser_to_target(ws_rx, tcp_tx, &mut stats.to_target);
        let downstream = target_to_browser(tcp_rx, &mut ws_tx, &mut stats.to_browser, buffer_size);
        tokio::select! {
            r = upstream => r,
            r = downstream => r,
        }
    };

    let close = match result {
        Ok(()) => Message::Close(None),
        Err(_) => Message::Close(Some(CloseFrame {
            code: CLOSE_INTERNAL_ERROR,
            reason: Utf8Bytes::from_static("session dropped"),
        })),
    };
    let _ = ws_tx.send(close).await;
    let _ = ws_tx.close().await;

    result.map(|()| stats)
}

async fn browser_to_target(
    mut ws_rx: SplitStream<WebSocket>,
    mut tcp_tx: OwnedWriteHalf,
    counter: &mut u64,
) -> Result<(), BrokerError> {
    while let Some(msg) = ws_rx.next().await {
        let data: &[u8] = match msg {
            Ok(Message::Binary(ref data)) => data,
            // Some clients send the RFB version handshake as text.
            Ok(Message::Text(ref text)) => text.as_str().as_bytes(),
            Ok(Message::Close(_)) => {
                debug!("Relay: browser closed");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => return Err(BrokerError::RelayFailure(format!("browser read: {e}"))),
        };
        tcp_tx
            .write_all(data)
            .await
            .map_err(|e| BrokerError::RelayFailure(format!("tunnel write: {e}")))?;
        *counter += data.len() as u64;
    }
    let _ = tcp_tx.shutdown().await;
    Ok(())
}

async fn target_to_browser(
    mut tcp_rx: OwnedReadHalf,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    counter: &mut u64,
    buffer_size: usize,
) -> Result<(), BrokerError> {
    let mut buf = vec![0u8; buffer_size.max(1024)];
    loop {
        let n = tcp_rx
            .read(&mut buf)
            .await
            .map_err(|e| BrokerError::RelayFailure(format!("tunnel read: {e}")))?;
        if n == 0 {
            debug!("Relay: tunnel closed");
            return Ok(());
        }
        if ws_tx
            .send(Message::Binary(buf[..n].to_vec().into()))
            .await
            .is_err()
        {
            // Browser went away; nothing left to relay to.
            return Ok(());
        }
        *counter += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quick() -> RelayConfig {
        RelayConfig {
            connect_attempts: 10,
            connect_retry_ms: 50,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect(addr, &quick()).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_retries_until_listener_appears() {
        // Reserve a port, release it, then bind again after a delay.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let l = TcpListener::bind(addr).await.unwrap();
            let _ = l.accept().await;
        });
        assert!(connect(addr, &quick()).await.is_ok());
        late.abort();
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let config = RelayConfig {
            connect_attempts: 2,
            connect_retry_ms: 10,
            ..RelayConfig::default()
        };
        match connect(addr, &config).await {
            Err(BrokerError::RelayFailure(msg)) => assert!(msg.contains("2 attempt")),
            other => panic!("expected RelayFailure, got {other:?}"),
        }
    }
}
