//! Dispatch between the gateway core and its collaborators.
//!
//! Inbound: decrypted messages become pool jobs that a [`ForwardHandler`]
//! publishes to the broker channel for their receiver kind.
//! Outbound: [`ControlPlane`] answers presence checks and pushes raw
//! payloads to live connections through the registry.

use crate::metrics::PAYLOADS_SENT_TO_CLIENT;
use crate::pool::JobHandler;
use crate::registry::ConnectionRegistry;
use courier_core::messages::{ApplicationMessage, ReceiverKind};
use courier_core::{CourierError, CourierResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Channel for new direct messages.
pub const DIRECT_CHANNEL: &str = "dm:new";
/// Channel for new group messages.
pub const GROUP_CHANNEL: &str = "group:new";
/// Channel for new broadcast messages.
pub const BROADCAST_CHANNEL: &str = "broadcast:new";

/// Pub/sub sink for forwarded messages.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, channel: &str, payload: String) -> impl Future<Output = CourierResult<()>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

impl<P: Publisher> Publisher for Arc<P> {
    async fn publish(&self, channel: &str, payload: String) -> CourierResult<()> {
        P::publish(self, channel, payload).await
    }

    async fn close(&self) {
        P::close(self).await
    }
}

/// [`Publisher`] backed by Redis `PUBLISH`, reconnecting automatically.
pub struct RedisPublisher {
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisPublisher {
    pub async fn connect(url: &str) -> CourierResult<Self> {
        let client = redis::Client::open(url).map_err(broker_err)?;
        let conn = ConnectionManager::new(client).await.map_err(broker_err)?;
        info!(url = %url, "connected to redis");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn connection(&self) -> CourierResult<ConnectionManager> {
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CourierError::Broker("publisher closed".into()))
    }
}

impl Publisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: String) -> CourierResult<()> {
        let mut conn = self.connection()?;
        let _: () = conn.publish(channel, payload).await.map_err(broker_err)?;
        Ok(())
    }

    async fn close(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        if conn.is_some() {
            info!("redis publisher closed");
        }
    }
}

fn broker_err(e: redis::RedisError) -> CourierError {
    CourierError::Broker(e.to_string())
}

/// Broker channel for a receiver kind; `None` for kinds outside the
/// closed set.
pub fn channel_for(kind: &ReceiverKind) -> Option<&'static str> {
    match kind {
        ReceiverKind::Direct => Some(DIRECT_CHANNEL),
        ReceiverKind::Group => Some(GROUP_CHANNEL),
        ReceiverKind::Broadcast => Some(BROADCAST_CHANNEL),
        ReceiverKind::Other(_) => None,
    }
}

/// Pipe-delimited payload read by downstream consumers:
/// `messageID|content|timestamp|senderID|receiverID`.
pub fn broker_payload(msg: &ApplicationMessage) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        msg.message_id, msg.content, msg.timestamp, msg.sender_id, msg.receiver_id
    )
}

/// Pool handler that forwards each message once to its broker channel.
pub struct ForwardHandler<P> {
    publisher: P,
}

impl<P: Publisher> ForwardHandler<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}

impl<P: Publisher> JobHandler<ApplicationMessage> for ForwardHandler<P> {
    async fn handle(&self, msg: ApplicationMessage) -> CourierResult<()> {
        let Some(channel) = channel_for(&msg.receiver_kind) else {
            warn!(
                message_id = %msg.message_id,
                kind = %msg.receiver_kind,
                "unknown message type, dropping"
            );
            return Ok(());
        };

        self.publisher.publish(channel, broker_payload(&msg)).await?;
        debug!(message_id = %msg.message_id, channel, "message forwarded");
        Ok(())
    }

    async fn close(&self) {
        self.publisher.close().await;
    }
}

/// Result of a control-plane push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// The id is not connected. Not an error.
    NoActiveConnection,
    TransportFailed(String),
}

impl PushOutcome {
    /// Acknowledgement text returned to the control-plane caller.
    pub fn ack(&self) -> &'static str {
        match self {
            PushOutcome::Sent => "Payload sent",
            PushOutcome::NoActiveConnection => "No active connection",
            PushOutcome::TransportFailed(_) => "Failed to send payload",
        }
    }
}

/// Control-plane operations over the connection registry.
#[derive(Clone)]
pub struct ControlPlane {
    registry: Arc<ConnectionRegistry>,
}

impl ControlPlane {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.registry.exists(id).await
    }

    /// Drop the entry for `id` and close its socket. Returns whether a
    /// connection was registered.
    pub async fn disconnect(&self, id: &str) -> bool {
        let Some(handle) = self.registry.remove(id).await else {
            debug!(connection_id = %id, "disconnect of unknown connection");
            return false;
        };
        if !handle.close().await {
            debug!(connection_id = %id, "connection task already gone");
        }
        true
    }

    /// Write `payload` to the connection registered under `id`.
    pub async fn push_payload(&self, id: &str, payload: Vec<u8>) -> PushOutcome {
        let Some(handle) = self.registry.get(id).await else {
            debug!(connection_id = %id, "push to unknown connection");
            return PushOutcome::NoActiveConnection;
        };

        match handle.push(payload).await {
            Ok(()) => {
                metrics::counter!(PAYLOADS_SENT_TO_CLIENT).increment(1);
                debug!(connection_id = %id, "payload pushed");
                PushOutcome::Sent
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "push failed");
                PushOutcome::TransportFailed(e.to_string())
            }
        }
    }
}
