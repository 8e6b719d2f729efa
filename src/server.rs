//! ChatServer registry actor implementation
//!
//! The server-wide authority for unique usernames and channel existence.
//! It owns the name table and the channel table outright; every mutation of
//! either goes through its mailbox, one command at a time.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelHandle};
use crate::client::Client;
use crate::error::AppError;
use crate::message::ServerMessage;
use crate::types::ClientId;

/// Commands sent from client actors to the registry
#[derive(Debug)]
pub enum ServerCommand {
    /// Claim `requested`; a held `current` name is released in the same step
    RegisterName {
        client: Client,
        current: Option<String>,
        channel: Option<String>,
        requested: String,
        respond_to: oneshot::Sender<Result<(), AppError>>,
    },
    /// Release a name (no-op if not held by this client)
    ReleaseName {
        client_id: ClientId,
        username: String,
        respond_to: oneshot::Sender<()>,
    },
    /// Join a channel, creating it if needed
    JoinChannel {
        client: Client,
        username: String,
        channel: String,
        respond_to: oneshot::Sender<Result<ChannelHandle, AppError>>,
    },
    /// Leave a channel, tearing it down if it becomes empty
    LeaveChannel {
        client_id: ClientId,
        username: String,
        channel: String,
        respond_to: oneshot::Sender<()>,
    },
    /// Route a private message by recipient name
    PrivateMessage {
        from: Client,
        from_name: String,
        to: String,
        text: String,
    },
    /// Report the current tables
    Snapshot {
        respond_to: oneshot::Sender<RegistrySnapshot>,
    },
}

/// Point-in-time view of the registry tables (sorted)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub names: Vec<String>,
    pub channels: Vec<String>,
}

/// The registry actor
///
/// Uses HashMap for O(1) lookups on names and channels.
pub struct ChatServer {
    /// Registered names: username -> Client
    names: HashMap<String, Client>,
    /// Live channels: channel name -> channel actor handle
    channels: HashMap<String, ChannelHandle>,
    /// Mailbox capacity for spawned channel actors
    channel_capacity: usize,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    /// Create the registry actor and its handle
    pub fn new(capacity: usize) -> (Self, ServerHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let server = Self {
            names: HashMap::new(),
            channels: HashMap::new(),
            channel_capacity: capacity,
            receiver,
        };
        (server, ServerHandle { sender })
    }

    /// Run the registry event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::RegisterName {
                client,
                current,
                channel,
                requested,
                respond_to,
            } => {
                let result = self
                    .handle_register_name(client, current, channel, requested)
                    .await;
                let _ = respond_to.send(result);
            }
            ServerCommand::ReleaseName {
                client_id,
                username,
                respond_to,
            } => {
                self.release_name(client_id, &username);
                let _ = respond_to.send(());
            }
            ServerCommand::JoinChannel {
                client,
                username,
                channel,
                respond_to,
            } => {
                let result = self.handle_join_channel(client, username, channel).await;
                let _ = respond_to.send(result);
            }
            ServerCommand::LeaveChannel {
                client_id,
                username,
                channel,
                respond_to,
            } => {
                self.handle_leave_channel(client_id, username, channel).await;
                let _ = respond_to.send(());
            }
            ServerCommand::PrivateMessage {
                from,
                from_name,
                to,
                text,
            } => {
                self.handle_private_message(from, from_name, to, text);
            }
            ServerCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// Handle name registration or rename
    async fn handle_register_name(
        &mut self,
        client: Client,
        current: Option<String>,
        channel: Option<String>,
        requested: String,
    ) -> Result<(), AppError> {
        if self.names.contains_key(&requested) {
            debug!("Client {} requested taken name {}", client.id, requested);
            return Err(AppError::NameUnavailable(requested));
        }

        info!("Client {} registered username '{}'", client.id, requested);
        self.names.insert(requested.clone(), client.clone());

        let Some(previous) = current else {
            return Ok(());
        };

        let _ = client.deliver(ServerMessage::Deregistering {
            username: previous.clone(),
        });
        self.release_name(client.id, &previous);

        if let Some(handle) = channel.and_then(|name| self.channels.get(&name)) {
            if let Err(e) = handle.rename(client.id, previous, requested).await {
                warn!("Rename not applied in channel {}: {}", handle.name(), e);
            }
        }

        Ok(())
    }

    /// Helper: drop a name if (and only if) this client holds it
    fn release_name(&mut self, client_id: ClientId, username: &str) {
        let held = self
            .names
            .get(username)
            .is_some_and(|holder| holder.id == client_id);

        if held {
            self.names.remove(username);
            info!("Client {} released username '{}'", client_id, username);
        } else {
            debug!("Client {} does not hold '{}', nothing to release", client_id, username);
        }
    }

    /// Handle channel joining, creating the channel on first use
    async fn handle_join_channel(
        &mut self,
        client: Client,
        username: String,
        channel: String,
    ) -> Result<ChannelHandle, AppError> {
        if let Some(handle) = self.channels.get(&channel).cloned() {
            match handle.admit(client.clone(), username.clone()).await {
                Ok(()) => return Ok(handle),
                Err(e) => {
                    warn!("Dropping dead channel {}: {}", channel, e);
                    self.channels.remove(&channel);
                }
            }
        }

        // Inserted before the first admit so no second actor can be spawned
        info!("Creating channel {}", channel);
        let (actor, handle) = Channel::new(channel.clone(), self.channel_capacity);
        self.channels.insert(channel.clone(), handle.clone());
        tokio::spawn(actor.run());

        if let Err(e) = handle.admit(client, username).await {
            self.channels.remove(&channel);
            return Err(e);
        }

        debug!("Registry state: {:?}", self.snapshot());

        Ok(handle)
    }

    /// Handle channel leaving; tears the channel down with its last member
    async fn handle_leave_channel(&mut self, client_id: ClientId, username: String, channel: String) {
        let Some(handle) = self.channels.get(&channel).cloned() else {
            debug!("Client {} left unknown channel {}", client_id, channel);
            return;
        };

        match handle.remove(client_id, username).await {
            Ok(false) => {}
            Ok(true) => {
                self.channels.remove(&channel);
                info!("Channel {} deleted (empty)", channel);
                debug!("Registry state: {:?}", self.snapshot());
            }
            Err(e) => {
                self.channels.remove(&channel);
                warn!("Channel {} lost during leave: {}", channel, e);
                debug!("Registry state: {:?}", self.snapshot());
            }
        }
    }

    /// Handle private message routing
    fn handle_private_message(&self, from: Client, from_name: String, to: String, text: String) {
        match self.names.get(&to) {
            Some(recipient) => {
                info!("{} messaging {} ({})", from_name, to, recipient.id);
                let _ = recipient.deliver(ServerMessage::Private {
                    from: from_name,
                    text,
                });
                let _ = from.deliver(ServerMessage::MessageSent);
            }
            None => {
                let _ = from.deliver(ServerMessage::UnknownUser { username: to });
            }
        }
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let mut names: Vec<String> = self.names.keys().cloned().collect();
        let mut channels: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        channels.sort();
        RegistrySnapshot { names, channels }
    }
}

/// Handle to the registry actor
///
/// Cheap to clone; every client actor holds one.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    sender: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    /// Register `requested`, releasing `current` and renaming within `channel` on success
    pub async fn register_name(
        &self,
        client: Client,
        current: Option<String>,
        channel: Option<String>,
        requested: String,
    ) -> Result<(), AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ServerCommand::RegisterName {
            client,
            current,
            channel,
            requested,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| AppError::RegistryClosed)?
    }

    /// Release a name held by this client
    pub async fn release_name(&self, client_id: ClientId, username: String) -> Result<(), AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ServerCommand::ReleaseName {
            client_id,
            username,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| AppError::RegistryClosed)
    }

    /// Join a channel; resolves once the channel has admitted the client
    pub async fn join_channel(
        &self,
        client: Client,
        username: String,
        channel: String,
    ) -> Result<ChannelHandle, AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ServerCommand::JoinChannel {
            client,
            username,
            channel,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| AppError::RegistryClosed)?
    }

    /// Leave a channel; resolves once removal (and any teardown) is done
    pub async fn leave_channel(
        &self,
        client_id: ClientId,
        username: String,
        channel: String,
    ) -> Result<(), AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ServerCommand::LeaveChannel {
            client_id,
            username,
            channel,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| AppError::RegistryClosed)
    }

    /// Send a private message (fire and forget)
    pub async fn private_message(
        &self,
        from: Client,
        from_name: String,
        to: String,
        text: String,
    ) -> Result<(), AppError> {
        self.send(ServerCommand::PrivateMessage {
            from,
            from_name,
            to,
            text,
        })
        .await
    }

    /// Fetch the current name and channel tables
    pub async fn snapshot(&self) -> Result<RegistrySnapshot, AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ServerCommand::Snapshot { respond_to }).await?;
        response.await.map_err(|_| AppError::RegistryClosed)
    }

    async fn send(&self, cmd: ServerCommand) -> Result<(), AppError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| AppError::RegistryClosed)
    }
}
