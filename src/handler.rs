//! Connection handler
//!
//! Each connection gets a client actor (the reader loop, run on the
//! connection's own task) and a writer loop (a spawned task draining the
//! outbox to the socket). The client actor walks the protocol state machine
//! and talks to the registry and its channel by request/acknowledgement.

use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;
use crate::client::Client;
use crate::config::Settings;
use crate::error::AppError;
use crate::message::{prompt_reply, ClientMessage, Prompt, ServerMessage};
use crate::server::ServerHandle;

/// Handle a new connection
///
/// Runs the client actor to completion, tears down its registrations and
/// waits for the writer loop to finish before returning. The writer gets
/// `settings.flush_timeout` to drain; after that the socket is cut.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    server: ServerHandle,
    settings: Settings,
    shutdown: CancellationToken,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (client, outbox) = Client::new(addr, settings.outbox_capacity);
    info!("Client {} connected from {}", client.id, addr);

    let mut write_task = tokio::spawn(write_loop(writer, outbox, client.clone()));

    let _ = client.deliver(ServerMessage::Welcome);

    let mut session = Session {
        client: client.clone(),
        server,
        lines: FramedRead::new(
            reader,
            AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                Vec::new(),
                settings.max_line_length,
            ),
        ),
        shutdown,
        username: None,
        channel: None,
        hangup: false,
    };

    let result = session.run().await;
    if let Err(e) = &result {
        debug!("Client {} session ended with error: {}", client.id, e);
        if !session.hangup {
            let _ = client.deliver(ServerMessage::InternalError);
        }
    }
    session.teardown().await;

    let flushed = match tokio::time::timeout(settings.flush_timeout, &mut write_task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!("Client {} did not drain its outbox in time, cutting it off", client.id);
            client.disconnect();
            write_task.await
        }
    };
    if flushed.is_err() {
        warn!("Writer task for client {} panicked", client.id);
    }

    info!("Client {} disconnected", client.id);

    result
}

/// Drain the outbox to the socket
///
/// Stops after writing the shutdown notice, on a write error, or as soon as
/// the client is disconnected.
async fn write_loop<W>(mut writer: W, mut outbox: mpsc::Receiver<ServerMessage>, client: Client)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = client.disconnected() => break,
            msg = outbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let last = msg == ServerMessage::ShuttingDown;
        let line = msg.to_string();

        let written = tokio::select! {
            _ = client.disconnected() => break,
            written = writer.write_all(line.as_bytes()) => written,
        };
        if let Err(e) = written {
            debug!("Write failed for client {}: {}", client.id, e);
            client.disconnect();
            break;
        }
        if last {
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!("Write task ended for client {}", client.id);
}

/// Protocol states of a client actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingName,
    AwaitingChannel,
    Active,
    Shutdown,
}

/// One inbound event
enum Input {
    Line(Option<Result<String, AnyDelimiterCodecError>>),
    Disconnected,
    ServerShutdown,
}

/// Client actor state
struct Session<R> {
    client: Client,
    server: ServerHandle,
    lines: FramedRead<R, AnyDelimiterCodec>,
    shutdown: CancellationToken,
    /// Registered name, once the registry accepted one
    username: Option<String>,
    /// Current channel, once joined
    channel: Option<ChannelHandle>,
    /// The peer is gone; skip the flush on teardown
    hangup: bool,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    /// Walk the state machine until shutdown
    async fn run(&mut self) -> Result<(), AppError> {
        let mut state = State::AwaitingName;
        loop {
            state = match state {
                State::AwaitingName => self.await_name().await?,
                State::AwaitingChannel => self.await_channel().await?,
                State::Active => self.active().await?,
                State::Shutdown => return Ok(()),
            };
        }
    }

    /// Read the next line; `None` means the session should shut down
    async fn next_line(&mut self) -> Result<Option<String>, AppError> {
        let input = tokio::select! {
            _ = self.client.disconnected() => Input::Disconnected,
            _ = self.shutdown.cancelled() => Input::ServerShutdown,
            frame = self.lines.next() => Input::Line(frame.map(|r| r.map(|bytes| decode_line(&bytes)))),
        };

        match input {
            Input::Line(Some(Ok(line))) => Ok(Some(line)),
            Input::Line(Some(Err(e))) => match AppError::from(e) {
                AppError::LineTooLong => {
                    debug!("Client {} sent an over-long line", self.client.id);
                    let _ = self.client.deliver(ServerMessage::LineTooLong);
                    Ok(None)
                }
                e => {
                    self.hangup = true;
                    Err(e)
                }
            },
            Input::Line(None) => {
                debug!("Client {} closed the connection", self.client.id);
                self.hangup = true;
                Ok(None)
            }
            Input::Disconnected => {
                debug!("Client {} was disconnected", self.client.id);
                self.hangup = true;
                Ok(None)
            }
            Input::ServerShutdown => {
                debug!("Server shutdown reached client {}", self.client.id);
                Ok(None)
            }
        }
    }

    /// `AwaitingName`: prompt until the registry accepts a name
    async fn await_name(&mut self) -> Result<State, AppError> {
        let _ = self.client.deliver(ServerMessage::Prompt(Prompt::Username));
        let Some(line) = self.next_line().await? else {
            return Ok(State::Shutdown);
        };
        let Some(requested) = prompt_reply(&line) else {
            return Ok(State::AwaitingName);
        };

        if self.register(requested).await? {
            Ok(State::AwaitingChannel)
        } else {
            Ok(State::AwaitingName)
        }
    }

    /// `AwaitingChannel`: prompt for a channel and join it
    async fn await_channel(&mut self) -> Result<State, AppError> {
        let _ = self.client.deliver(ServerMessage::Prompt(Prompt::Channel));
        let Some(line) = self.next_line().await? else {
            return Ok(State::Shutdown);
        };
        let Some(channel) = prompt_reply(&line) else {
            return Ok(State::AwaitingChannel);
        };

        let _ = self.client.deliver(ServerMessage::HelpHint);
        self.join(channel).await?;
        Ok(State::Active)
    }

    /// `Active`: dispatch commands until shutdown
    async fn active(&mut self) -> Result<State, AppError> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(State::Shutdown);
            };

            let msg = match ClientMessage::parse(&line) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) => {
                    let _ = self.client.deliver(e.into());
                    continue;
                }
            };

            match msg {
                ClientMessage::ChangeChannel(channel) => {
                    info!("{} changing to channel {}", self.username(), channel);
                    let _ = self.client.deliver(ServerMessage::ChangingChannel {
                        channel: channel.clone(),
                    });
                    self.leave().await?;
                    self.join(channel).await?;
                }
                ClientMessage::ChangeName(requested) => {
                    self.register(requested).await?;
                }
                ClientMessage::PrivateMessage { to, text } => {
                    self.server
                        .private_message(self.client.clone(), self.username(), to, text)
                        .await?;
                }
                ClientMessage::Close => return Ok(State::Shutdown),
                ClientMessage::Help => {
                    let _ = self.client.deliver(ServerMessage::Help);
                }
                ClientMessage::Say(text) => {
                    if let Some(channel) = &self.channel {
                        if let Err(e) = channel.broadcast(self.client.id, self.username(), text).await {
                            warn!("Broadcast from client {} failed: {}", self.client.id, e);
                        }
                    }
                }
            }
        }
    }

    /// Ask the registry for a name; `false` if it is taken
    async fn register(&mut self, requested: String) -> Result<bool, AppError> {
        let _ = self.client.deliver(ServerMessage::Registering {
            username: requested.clone(),
        });

        let channel = self.channel.as_ref().map(|c| c.name().to_string());
        let result = self
            .server
            .register_name(self.client.clone(), self.username.clone(), channel, requested.clone())
            .await;

        match result {
            Ok(()) => {
                self.username = Some(requested);
                Ok(true)
            }
            Err(e) if e.is_recoverable() => {
                let _ = self.client.deliver(e.into());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Join a channel through the registry
    async fn join(&mut self, channel: String) -> Result<(), AppError> {
        let handle = self
            .server
            .join_channel(self.client.clone(), self.username(), channel)
            .await?;
        self.channel = Some(handle);
        Ok(())
    }

    /// Leave the current channel, if any
    async fn leave(&mut self) -> Result<(), AppError> {
        if let Some(channel) = self.channel.take() {
            self.server
                .leave_channel(self.client.id, self.username(), channel.name().to_string())
                .await?;
        }
        Ok(())
    }

    /// Release everything this client holds: channel first, then name
    ///
    /// Safe to call more than once.
    async fn teardown(&mut self) {
        info!("Client {} shutting down", self.client.id);

        if let Err(e) = self.leave().await {
            debug!("Client {} could not leave its channel: {}", self.client.id, e);
        }
        if let Some(username) = self.username.take() {
            if let Err(e) = self.server.release_name(self.client.id, username).await {
                debug!("Client {} could not release its name: {}", self.client.id, e);
            }
        }

        if self.hangup {
            self.client.disconnect();
        } else {
            let _ = self.client.deliver(ServerMessage::ShuttingDown);
        }
    }

    fn username(&self) -> String {
        self.username.clone().unwrap_or_default()
    }
}

/// Decode one inbound frame
///
/// Bytes that are not UTF-8 become U+FFFD rather than failing the read.
fn decode_line(frame: &[u8]) -> String {
    let frame = frame.strip_suffix(b"\r").unwrap_or(frame);
    String::from_utf8_lossy(frame).into_owned()
}
