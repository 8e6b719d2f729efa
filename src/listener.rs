//! Connection accept loop
//!
//! Starts the registry actor, accepts connections and spawns a client actor
//! for each. On shutdown it stops accepting, lets every connection tear down
//! gracefully, then lets the registry drain and exit.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::server::ChatServer;

/// Serve connections from `listener` until `shutdown` is cancelled
///
/// An accept error ends the loop; open connections are still torn down
/// gracefully before the error is returned.
pub async fn serve(
    listener: TcpListener,
    settings: Settings,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let (server, server_handle) = ChatServer::new(settings.mailbox_capacity);
    let registry = tokio::spawn(server.run());

    let connections = shutdown.child_token();
    let tracker = TaskTracker::new();

    if let Ok(addr) = listener.local_addr() {
        info!("{} is listening", addr);
    }

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections");
                break Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let server_handle = server_handle.clone();
                    let connections = connections.clone();

                    tracker.spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, server_handle, settings, connections).await
                        {
                            warn!("Connection {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    break Err(AppError::Io(e));
                }
            },
        }
    };

    drop(listener);
    connections.cancel();
    tracker.close();
    info!("Waiting for {} connection(s) to close", tracker.len());
    tracker.wait().await;

    // Last handle gone: the registry drains its mailbox and exits
    drop(server_handle);
    if registry.await.is_err() {
        error!("Registry task panicked");
    }

    result
}
