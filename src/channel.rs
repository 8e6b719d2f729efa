//! Channel actor implementation
//!
//! One actor per active room. It exclusively owns the room's membership and
//! serializes admit/remove/rename/broadcast for that room. Deliveries to
//! members never block: a member with a full outbox is disconnected instead.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::client::Client;
use crate::error::AppError;
use crate::message::ServerMessage;
use crate::types::ClientId;

/// Commands sent from the registry and members to a channel actor
#[derive(Debug)]
pub enum ChannelCommand {
    /// Add a member under its current name
    Admit {
        client: Client,
        username: String,
        respond_to: oneshot::Sender<()>,
    },
    /// Remove a member; replies `true` if the channel is now empty
    Remove {
        client_id: ClientId,
        username: String,
        respond_to: oneshot::Sender<bool>,
    },
    /// Re-key a member from its old name to its new one
    Rename {
        client_id: ClientId,
        from: String,
        to: String,
        respond_to: oneshot::Sender<()>,
    },
    /// Deliver a member's line to everyone in the room
    Broadcast {
        sender: ClientId,
        from: String,
        text: String,
    },
}

/// The channel actor
pub struct Channel {
    /// Room name
    name: String,
    /// Current members: username -> Client
    members: HashMap<String, Client>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ChannelCommand>,
}

/// Whether the event loop keeps going after a command
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl Channel {
    /// Create a channel actor and the handle used to reach it
    pub fn new(name: String, capacity: usize) -> (Self, ChannelHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = ChannelHandle {
            name: name.clone(),
            sender,
        };
        let channel = Self {
            name,
            members: HashMap::new(),
            receiver,
        };
        (channel, handle)
    }

    /// Run the channel event loop
    ///
    /// Ends when the last member is removed or every handle is dropped.
    pub async fn run(mut self) {
        debug!("Channel {} started", self.name);

        while let Some(cmd) = self.receiver.recv().await {
            if self.handle_command(cmd) == Flow::Stop {
                break;
            }
        }

        debug!("Channel {} stopped", self.name);
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ChannelCommand) -> Flow {
        match cmd {
            ChannelCommand::Admit {
                client,
                username,
                respond_to,
            } => {
                self.handle_admit(client, username);
                let _ = respond_to.send(());
            }
            ChannelCommand::Remove {
                client_id,
                username,
                respond_to,
            } => {
                let empty = self.handle_remove(client_id, username);
                let _ = respond_to.send(empty);
                if empty {
                    return Flow::Stop;
                }
            }
            ChannelCommand::Rename {
                client_id,
                from,
                to,
                respond_to,
            } => {
                self.handle_rename(client_id, from, to);
                let _ = respond_to.send(());
            }
            ChannelCommand::Broadcast { sender, from, text } => {
                self.handle_broadcast(sender, from, text);
            }
        }
        Flow::Continue
    }

    /// Admit a member, then announce it to everyone, the newcomer included
    fn handle_admit(&mut self, client: Client, username: String) {
        info!("{} ({}) joining channel {}", username, client.id, self.name);

        let _ = client.deliver(ServerMessage::Joining {
            channel: self.name.clone(),
        });
        self.members.insert(username.clone(), client);

        self.broadcast(ServerMessage::Joined { username });
    }

    /// Remove a member and announce the departure; returns whether the room is empty
    fn handle_remove(&mut self, client_id: ClientId, username: String) -> bool {
        let is_member = self
            .members
            .get(&username)
            .is_some_and(|member| member.id == client_id);

        if is_member {
            if let Some(client) = self.members.remove(&username) {
                info!("{} ({}) leaving channel {}", username, client_id, self.name);
                let _ = client.deliver(ServerMessage::Leaving {
                    channel: self.name.clone(),
                });
            }
            self.broadcast(ServerMessage::Left { username });
        } else {
            debug!(
                "Remove for non-member {} ({}) in channel {}",
                username, client_id, self.name
            );
        }

        let empty = self.members.is_empty();
        if empty {
            info!("Channel {} is empty, shutting down", self.name);
        }
        empty
    }

    /// Re-key a member and announce the new name
    fn handle_rename(&mut self, client_id: ClientId, from: String, to: String) {
        let Some(client) = self.members.remove(&from) else {
            debug!("Rename for non-member {} in channel {}", from, self.name);
            return;
        };
        if client.id != client_id {
            self.members.insert(from, client);
            return;
        }

        info!("{} changing username to {} in channel {}", from, to, self.name);
        let _ = client.deliver(ServerMessage::ChangingName {
            username: to.clone(),
        });
        self.members.insert(to.clone(), client);

        self.broadcast(ServerMessage::Renamed { from, to });
    }

    /// Relay a member's line: an echo to the sender, a chat line to the rest
    fn handle_broadcast(&self, sender: ClientId, from: String, text: String) {
        debug!("{} broadcasting in channel {}: {}", from, self.name, text);

        for client in self.members.values() {
            let msg = if client.id == sender {
                ServerMessage::Echo {
                    from: from.clone(),
                    text: text.clone(),
                }
            } else {
                ServerMessage::Chat {
                    from: from.clone(),
                    text: text.clone(),
                }
            };
            let _ = client.deliver(msg);
        }
    }

    /// Helper: deliver to every member
    fn broadcast(&self, msg: ServerMessage) {
        for client in self.members.values() {
            let _ = client.deliver(msg.clone());
        }
    }
}

/// Handle to a running channel actor
///
/// Cheap to clone; holds only the mailbox sender.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    name: String,
    sender: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    /// Room name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a client; returns once the channel has acknowledged
    pub async fn admit(&self, client: Client, username: String) -> Result<(), AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ChannelCommand::Admit {
            client,
            username,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| self.closed())
    }

    /// Remove a client; returns whether the channel is now empty
    pub async fn remove(&self, client_id: ClientId, username: String) -> Result<bool, AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ChannelCommand::Remove {
            client_id,
            username,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| self.closed())
    }

    /// Rename a member; returns once the channel has acknowledged
    pub async fn rename(&self, client_id: ClientId, from: String, to: String) -> Result<(), AppError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ChannelCommand::Rename {
            client_id,
            from,
            to,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| self.closed())
    }

    /// Broadcast a line from a member
    pub async fn broadcast(&self, sender: ClientId, from: String, text: String) -> Result<(), AppError> {
        self.send(ChannelCommand::Broadcast { sender, from, text }).await
    }

    async fn send(&self, cmd: ChannelCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> AppError {
        AppError::ChannelClosed(self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::Receiver;

    fn spawn_channel(name: &str) -> ChannelHandle {
        let (channel, handle) = Channel::new(name.to_string(), 16);
        tokio::spawn(channel.run());
        handle
    }

    fn new_client(port: u16) -> (Client, Receiver<ServerMessage>) {
        Client::new(format!("127.0.0.1:{}", port).parse().unwrap(), 16)
    }

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_admit_announces_to_everyone() {
        let channel = spawn_channel("lobby");
        let (alice, mut alice_rx) = new_client(1);
        let (bob, mut bob_rx) = new_client(2);

        channel.admit(alice, "alice".into()).await.unwrap();
        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerMessage::Joining {
                    channel: "lobby".into()
                },
                ServerMessage::Joined {
                    username: "alice".into()
                },
            ]
        );

        channel.admit(bob, "bob".into()).await.unwrap();
        assert_eq!(
            drain(&mut bob_rx),
            vec![
                ServerMessage::Joining {
                    channel: "lobby".into()
                },
                ServerMessage::Joined {
                    username: "bob".into()
                },
            ]
        );
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::Joined {
                username: "bob".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_broadcast_echo_and_chat() {
        let channel = spawn_channel("lobby");
        let (alice, mut alice_rx) = new_client(1);
        let (bob, mut bob_rx) = new_client(2);
        let alice_id = alice.id;

        channel.admit(alice, "alice".into()).await.unwrap();
        channel.admit(bob, "bob".into()).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        channel
            .broadcast(alice_id, "alice".into(), "hello".into())
            .await
            .unwrap();
        // Round-trip through the mailbox so the broadcast has been processed
        let (carol, _carol_rx) = new_client(3);
        channel.admit(carol, "carol".into()).await.unwrap();

        assert_eq!(
            drain(&mut bob_rx)[0],
            ServerMessage::Chat {
                from: "alice".into(),
                text: "hello".into()
            }
        );
        assert_eq!(
            drain(&mut alice_rx)[0],
            ServerMessage::Echo {
                from: "alice".into(),
                text: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn test_remove_reports_empty() {
        let channel = spawn_channel("lobby");
        let (alice, mut alice_rx) = new_client(1);
        let (bob, mut bob_rx) = new_client(2);
        let (alice_id, bob_id) = (alice.id, bob.id);

        channel.admit(alice, "alice".into()).await.unwrap();
        channel.admit(bob, "bob".into()).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(!channel.remove(alice_id, "alice".into()).await.unwrap());
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::Leaving {
                channel: "lobby".into()
            }]
        );
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::Left {
                username: "alice".into()
            }]
        );

        assert!(channel.remove(bob_id, "bob".into()).await.unwrap());

        // The actor has stopped
        let (carol, _rx) = new_client(3);
        assert!(matches!(
            channel.admit(carol, "carol".into()).await,
            Err(AppError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_ignores_stale_identity() {
        let channel = spawn_channel("lobby");
        let (alice, _alice_rx) = new_client(1);
        let (impostor, _rx) = new_client(2);

        channel.admit(alice, "alice".into()).await.unwrap();
        assert!(!channel.remove(impostor.id, "alice".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_rekeys_member() {
        let channel = spawn_channel("lobby");
        let (alice, mut alice_rx) = new_client(1);
        let (bob, mut bob_rx) = new_client(2);
        let alice_id = alice.id;

        channel.admit(alice, "alice".into()).await.unwrap();
        channel.admit(bob, "bob".into()).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        channel
            .rename(alice_id, "alice".into(), "carol".into())
            .await
            .unwrap();
        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerMessage::ChangingName {
                    username: "carol".into()
                },
                ServerMessage::Renamed {
                    from: "alice".into(),
                    to: "carol".into()
                },
            ]
        );
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::Renamed {
                from: "alice".into(),
                to: "carol".into()
            }]
        );

        // Removal now goes by the new name
        assert!(!channel.remove(alice_id, "carol".into()).await.unwrap());
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::Left {
                username: "carol".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_slow_member_does_not_stall_channel() {
        let channel = spawn_channel("lobby");
        let (slow, _slow_rx) = Client::new("127.0.0.1:9".parse().unwrap(), 1);
        let (fast, mut fast_rx) = new_client(2);
        let fast_id = fast.id;
        let slow_handle = slow.clone();

        channel.admit(slow, "slow".into()).await.unwrap();
        channel.admit(fast, "fast".into()).await.unwrap();

        for i in 0..5 {
            channel
                .broadcast(fast_id, "fast".into(), format!("line {}", i))
                .await
                .unwrap();
        }
        channel
            .rename(fast_id, "fast".into(), "quick".into())
            .await
            .unwrap();

        assert!(slow_handle.is_disconnected());
        assert_eq!(drain(&mut fast_rx).len(), 2 + 5 + 2);
    }
}
