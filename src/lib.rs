//! Line-oriented TCP Chat Relay Library
//!
//! A plaintext chat server: clients pick a unique username, join a named
//! channel, talk to the channel, message each other privately and switch
//! channels, all over newline-delimited text.
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` mailboxes and `oneshot` replies:
//! - `ChatServer` is the registry actor owning the name and channel tables
//! - Each `Channel` actor owns one room's membership
//! - Each connection runs a client actor (`handler`) plus a writer loop
//! - No locks needed - all state access goes through message passing
//!
//! Actors never block on a client's outbox: a client that cannot keep up
//! is disconnected instead.
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//! use chat_relay::{serve, Settings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:4000").await.unwrap();
//!     serve(listener, Settings::default(), CancellationToken::new())
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use channel::{Channel, ChannelHandle};
pub use client::Client;
pub use config::{Config, Settings};
pub use error::{AppError, DeliveryError};
pub use handler::handle_connection;
pub use listener::serve;
pub use message::{escape_control_chars, ClientMessage, ServerMessage};
pub use server::{ChatServer, RegistrySnapshot, ServerCommand, ServerHandle};
pub use types::ClientId;
