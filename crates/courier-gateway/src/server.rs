//! Core server: accepts WebSocket connections and runs one session task each.
//!
//! Each connection task is the sole owner of its socket and [`Session`]. It
//! registers a handle in the [`ConnectionRegistry`] for the lifetime of the
//! connection, feeds decrypted messages into the forwarding pool and writes
//! control-plane pushes arriving on its outbound channel.

use crate::bridge::{ForwardHandler, Publisher};
use crate::config::GatewayConfig;
use crate::handshake::{self, FrameOutcome};
use crate::metrics::{PAYLOADS_PROCESSED_FAILED, PAYLOADS_PROCESSED_SUCCESS, PAYLOADS_RECEIVED};
use crate::pool::WorkerPool;
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::session::Session;
use crate::transport::websocket::{self, WebSocketConnection};
use courier_core::messages::ApplicationMessage;
use courier_core::{codec, generate_connection_id, CourierError, CourierResult};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Pool that forwards decrypted messages to the broker.
pub type ForwardPool<P> = WorkerPool<ApplicationMessage, ForwardHandler<P>>;

/// The gateway server instance.
pub struct GatewayServer<P: Publisher> {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<ForwardPool<P>>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl<P: Publisher> GatewayServer<P> {
    pub fn new(config: GatewayConfig, registry: Arc<ConnectionRegistry>, pool: Arc<ForwardPool<P>>) -> Self {
        Self {
            config,
            registry,
            pool,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Arc<ForwardPool<P>> {
        &self.pool
    }

    /// Serve accepted connections until `shutdown` resolves or the
    /// listener closes, then close every connection and drain the pool.
    pub async fn serve(
        self: Arc<Self>,
        mut connections: mpsc::Receiver<WebSocketConnection>,
        shutdown: impl Future<Output = ()> + Send,
    ) {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
                Some(conn) = connections.recv() => {
                    let srv = self.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    tasks.spawn(async move {
                        if let Err(e) = srv.handle_connection(conn, shutdown_rx).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(joined);
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }
        drop(connections);

        // Broadcast shutdown to all connected clients
        info!(connections = tasks.len(), "closing client connections");
        let _ = self.shutdown_tx.send(());
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }

        self.pool.shutdown().await;
        info!("gateway server stopped");
    }

    async fn handle_connection(
        &self,
        mut conn: WebSocketConnection,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> CourierResult<()> {
        let remote = conn.remote_addr;
        let requested = conn.requested_id.take();
        if requested.is_some() && !self.config.trust_user_param {
            debug!(remote = %remote, "ignoring user parameter, not trusted");
        }
        let connection_id = requested
            .filter(|_| self.config.trust_user_param)
            .unwrap_or_else(generate_connection_id);

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let serial = self.registry.next_serial();
        self.registry
            .add(&connection_id, ConnectionHandle::new(serial, remote, outbound_tx))
            .await;
        info!(connection_id = %connection_id, remote = %remote, "client connected");

        let mut session = Session::with_nonce_limit(connection_id.clone(), self.config.nonce_limit);
        let result = self
            .session_loop(&mut conn.ws_stream, &mut session, outbound_rx, shutdown_rx)
            .await;

        websocket::ws_close(&mut conn.ws_stream).await;
        self.registry.release(&connection_id, serial).await;
        info!(connection_id = %connection_id, "client disconnected");
        result
    }

    async fn session_loop(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        session: &mut Session,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> CourierResult<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(connection_id = %session.connection_id(), "shutdown signal received");
                    break;
                }

                Some(outbound) = outbound_rx.recv() => match outbound {
                    Outbound::Push { payload, ack } => {
                        if let Err(e) = websocket::ws_send_payload(ws, payload).await {
                            let reason = e.to_string();
                            let _ = ack.send(Err(e));
                            return Err(CourierError::Transport(reason));
                        }
                        let _ = ack.send(Ok(()));
                    }
                    Outbound::Close => {
                        info!(connection_id = %session.connection_id(), "disconnect requested");
                        break;
                    }
                },

                received = websocket::ws_recv(ws, self.config.max_frame_size) => {
                    match received {
                        Ok(Some(data)) => {
                            metrics::counter!(PAYLOADS_RECEIVED).increment(1);
                            self.handle_frame(ws, session, &data).await?;
                        }
                        Ok(None) => {
                            debug!(connection_id = %session.connection_id(), "peer closed");
                            break;
                        }
                        Err(e) if e.is_frame_local() => {
                            metrics::counter!(PAYLOADS_RECEIVED).increment(1);
                            metrics::counter!(PAYLOADS_PROCESSED_FAILED).increment(1);
                            warn!(connection_id = %session.connection_id(), error = %e, "frame rejected");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Run one frame through the protocol. Only transport and pool errors
    /// escape; everything frame-local is logged and counted here.
    async fn handle_frame(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        session: &mut Session,
        data: &[u8],
    ) -> CourierResult<()> {
        match handshake::process_frame(session, data) {
            Ok(FrameOutcome::Handshake(ack)) => {
                let text = codec::encode_ack(&ack)?;
                websocket::ws_send_text(ws, &text).await?;
                metrics::counter!(PAYLOADS_PROCESSED_SUCCESS).increment(1);
            }
            Ok(FrameOutcome::Message(msg)) => {
                debug!(
                    connection_id = %session.connection_id(),
                    message_id = %msg.message_id,
                    "message accepted"
                );
                self.pool.submit(msg).await?;
                metrics::counter!(PAYLOADS_PROCESSED_SUCCESS).increment(1);
            }
            Ok(FrameOutcome::Dropped(_)) => {
                metrics::counter!(PAYLOADS_PROCESSED_FAILED).increment(1);
            }
            Err(e) if e.is_frame_local() => {
                metrics::counter!(PAYLOADS_PROCESSED_FAILED).increment(1);
                warn!(connection_id = %session.connection_id(), error = %e, "frame rejected");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Log a finished connection task. Returns whether it ended normally.
fn reap(joined: Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "connection task failed");
            false
        }
    }
}
