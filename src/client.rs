//! Client handle definition
//!
//! A cheap, cloneable handle to one connection: its identity, the sending half
//! of its bounded outbox, and the token that forcibly disconnects it. Every
//! actor that wants to message a client goes through `Client::deliver`.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DeliveryError;
use crate::message::ServerMessage;
use crate::types::ClientId;

/// Connected client handle
///
/// Identity is the `ClientId` plus the remote address. The outbox receiver is
/// owned by the connection's writer loop.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Remote peer address
    pub addr: SocketAddr,
    /// Server → Client outbox
    outbox: mpsc::Sender<ServerMessage>,
    /// Cancelled to force the connection closed
    disconnect: CancellationToken,
}

impl Client {
    /// Create a client handle and the receiving half of its outbox
    pub fn new(addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (outbox, inbox) = mpsc::channel(capacity);
        let client = Self {
            id: ClientId::new(),
            addr,
            outbox,
            disconnect: CancellationToken::new(),
        };
        (client, inbox)
    }

    /// Queue a message for this client without waiting
    ///
    /// A full outbox means the peer is not keeping up: the message is dropped
    /// and the client is disconnected. Its own reader loop observes the
    /// disconnect and runs the normal teardown.
    pub fn deliver(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        match self.outbox.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if !self.disconnect.is_cancelled() {
                    warn!("Client {} ({}) outbox full, disconnecting", self.id, self.addr);
                    self.disconnect.cancel();
                }
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Force this client's connection closed
    pub fn disconnect(&self) {
        self.disconnect.cancel();
    }

    /// Whether a disconnect has been requested
    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_cancelled()
    }

    /// Resolves once a disconnect has been requested
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await
    }
}
