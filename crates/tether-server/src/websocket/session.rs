//! WebSocket session lifecycle: a single client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::server::Server;
use crate::transport::ChannelTransport;

/// How long the writer gets to flush and send a close frame once the
/// session is over.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session knobs, usually derived from [`ServerConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    /// Outbound frames queued before sends start failing.
    pub outbound_buffer: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// Close the session after this long without any inbound frame.
    pub heartbeat_timeout: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers a [`Connection`](crate::connection::Connection) backed by a
///    [`ChannelTransport`]
/// 2. Feeds text and binary frames to [`Server::handle_message`]
/// 3. Forwards outbound frames and sends periodic Pings
/// 4. Ends when the peer leaves, goes silent, the connection is closed
///    server-side, or `shutdown` fires
#[instrument(skip_all, fields(connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    server: Server,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (transport, mut outbound_rx) = ChannelTransport::new(settings.outbound_buffer);
    let closed = transport.closed_token();
    let conn = server.handle_connect(Arc::new(transport));
    let _ = tracing::Span::current().record("connection_id", tracing::field::display(conn.id()));

    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let writer_closed = closed.clone();
    let writer_seen = last_seen.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(settings.heartbeat_interval);
        // Skip the immediate first tick
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                biased;
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_closed.cancelled() => {
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    let silent = writer_seen.lock().elapsed();
                    if silent > settings.heartbeat_timeout {
                        warn!(silent_ms = silent.as_millis(), "peer unresponsive, disconnecting");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader = async {
        while let Some(frame) = ws_rx.next().await {
            let Ok(frame) = frame else { break };
            *last_seen.lock() = Instant::now();
            match frame {
                Message::Text(text) => server.handle_message(&conn, text.as_str()),
                Message::Binary(data) => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        server.handle_message(&conn, text);
                    } else {
                        debug!(len = data.len(), "non-UTF8 binary frame ignored");
                    }
                }
                Message::Close(_) => {
                    debug!("peer sent close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    };

    tokio::select! {
        () = reader => info!("peer disconnected"),
        () = closed.cancelled() => debug!("connection closed by server"),
        () = shutdown.cancelled() => debug!("server shutting down"),
        _ = &mut writer => debug!("writer stopped"),
    }

    server.handle_disconnect(&conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    // Socket-level behaviour is covered by tests/integration.rs.
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = ServerConfig {
            outbound_buffer: 7,
            heartbeat_interval_secs: 2,
            heartbeat_timeout_secs: 9,
            ..ServerConfig::default()
        };
        let settings = SessionSettings::from(&config);
        assert_eq!(settings.outbound_buffer, 7);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(9));
    }

    #[test]
    fn default_settings_match_default_config() {
        let settings = SessionSettings::default();
        assert_eq!(settings.outbound_buffer, ServerConfig::default().outbound_buffer);
        assert!(settings.heartbeat_timeout >= settings.heartbeat_interval);
    }
}
