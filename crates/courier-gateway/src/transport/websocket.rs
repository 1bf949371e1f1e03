//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the upgrade and hands each socket to
//! the server through a channel. The upgrade request may name the client
//! with a `user` query parameter (`/ws?user=u1`).

use courier_core::{CourierError, CourierResult};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Longest client-supplied identifier accepted from the query string.
const MAX_USER_ID_LEN: usize = 128;

/// An accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Identifier from the `user` query parameter, if valid.
    pub requested_id: Option<String>,
}

/// Bind the listener and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields upgraded connections. The accept loop stops once the receiver
/// is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> CourierResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CourierError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut requested_id = None;
                        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            requested_id = user_param(req.uri().query());
                            Ok(resp)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    requested_id,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!(addr = %local_addr, "WebSocket accept loop stopped");
    });

    Ok((local_addr, rx))
}

/// Extract a usable `user` value from a raw query string.
///
/// Only `[A-Za-z0-9_.:@-]` is accepted; anything else is ignored and the
/// server falls back to a generated id.
pub fn user_param(query: Option<&str>) -> Option<String> {
    let value = query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("user="))?;
    let valid = !value.is_empty()
        && value.len() <= MAX_USER_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '@' | '-'));
    if valid {
        Some(value.to_string())
    } else {
        warn!(len = value.len(), "ignoring invalid user query parameter");
        None
    }
}

/// Send a text message.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: &str) -> CourierResult<()> {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .map_err(|e| CourierError::Transport(format!("WS send failed: {e}")))
}

/// Send a binary message.
pub async fn ws_send_binary(ws: &mut WebSocketStream<TcpStream>, data: &[u8]) -> CourierResult<()> {
    ws.send(Message::Binary(data.to_vec().into()))
        .await
        .map_err(|e| CourierError::Transport(format!("WS send failed: {e}")))
}

/// Send a raw payload: text frame when it is valid UTF-8, binary otherwise.
pub async fn ws_send_payload(ws: &mut WebSocketStream<TcpStream>, payload: Vec<u8>) -> CourierResult<()> {
    match String::from_utf8(payload) {
        Ok(text) => ws_send_text(ws, &text).await,
        Err(e) => ws_send_binary(ws, e.as_bytes()).await,
    }
}

/// Receive the next data frame, text or binary, as bytes.
///
/// Returns `None` once the peer closed. Pings are answered inline.
/// Frames over `max_frame_size` yield [`CourierError::InvalidMessage`];
/// the connection stays usable.
pub async fn ws_recv(
    ws: &mut WebSocketStream<TcpStream>,
    max_frame_size: usize,
) -> CourierResult<Option<Vec<u8>>> {
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(CourierError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        };
        if data.len() > max_frame_size {
            return Err(CourierError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {max_frame_size})",
                data.len()
            )));
        }
        return Ok(Some(data));
    }
}

/// Close the socket, ignoring errors from an already-dead peer.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "WS close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_param_extracted() {
        assert_eq!(user_param(Some("user=u1")), Some("u1".into()));
        assert_eq!(user_param(Some("v=2&user=alice@example")), Some("alice@example".into()));
    }

    #[test]
    fn user_param_missing_or_invalid() {
        assert_eq!(user_param(None), None);
        assert_eq!(user_param(Some("v=2")), None);
        assert_eq!(user_param(Some("user=")), None);
        assert_eq!(user_param(Some("user=a%20b")), None);
        assert_eq!(user_param(Some(&format!("user={}", "x".repeat(129)))), None);
    }

    #[tokio::test]
    async fn accepts_upgrade_and_exchanges_frames() {
        let (addr, mut rx) = start_listener("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let url = format!("ws://{addr}/ws?user=u7");
        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            ws.send(Message::Text("hello".to_string().into())).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0x00].into())).await.unwrap();
            ws.send(Message::Text("x".repeat(64).into())).await.unwrap();
            ws.send(Message::Text("after".to_string().into())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
            reply
        });

        let mut conn = rx.recv().await.unwrap();
        assert_eq!(conn.requested_id.as_deref(), Some("u7"));

        let ws = &mut conn.ws_stream;
        assert_eq!(ws_recv(ws, 32).await.unwrap().unwrap(), b"hello");
        assert_eq!(ws_recv(ws, 32).await.unwrap().unwrap(), vec![0xff, 0x00]);
        assert!(matches!(ws_recv(ws, 32).await, Err(CourierError::InvalidMessage(_))));
        assert_eq!(ws_recv(ws, 32).await.unwrap().unwrap(), b"after");

        ws_send_payload(ws, b"pong".to_vec()).await.unwrap();
        assert!(ws_recv(ws, 32).await.unwrap().is_none());

        let reply = client.await.unwrap();
        assert!(reply.is_text());
        assert_eq!(reply.into_data().to_vec(), b"pong");
    }
}
