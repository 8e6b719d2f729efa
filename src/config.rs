//! Command line configuration
//!
//! `Config` is what the binary parses; `Settings` is the subset the library
//! needs to run connections and actors.

use std::time::Duration;

use clap::Parser;

/// Default outbox capacity (lines queued per client)
pub const DEFAULT_OUTBOX_CAPACITY: usize = 255;

/// Default maximum inbound line length (bytes)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default mailbox capacity for the registry and channel actors
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default time a closing connection gets to flush its outbox (milliseconds)
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 5000;

/// Line-oriented TCP chat relay
#[derive(Parser, Clone, Debug)]
#[command(name = "chat_relay", version, about = "Line-oriented TCP chat relay")]
pub struct Config {
    /// Listen address: host:port, :port or a bare port
    #[arg(long, default_value = ":4000")]
    pub addr: String,

    /// Lines queued per client before it is dropped as too slow
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Maximum inbound line length in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Milliseconds a closing connection may spend flushing queued lines
    #[arg(long, default_value_t = DEFAULT_FLUSH_TIMEOUT_MS)]
    pub flush_timeout_ms: u64,
}

impl Config {
    /// Parse from the process arguments, accepting `-addr` for `--addr`
    pub fn from_args() -> Self {
        Self::parse_from(normalize_args(std::env::args()))
    }

    /// Address to bind, normalized
    pub fn listen_addr(&self) -> String {
        normalize_addr(&self.addr)
    }

    /// Runtime settings for the library
    pub fn settings(&self) -> Settings {
        Settings {
            outbox_capacity: self.outbox_capacity.max(1),
            max_line_length: self.max_line_length.max(1),
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
            ..Settings::default()
        }
    }
}

/// Runtime settings for connections and actors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Outbox capacity per client
    pub outbox_capacity: usize,
    /// Maximum inbound line length in bytes
    pub max_line_length: usize,
    /// Registry and channel mailbox capacity
    pub mailbox_capacity: usize,
    /// Upper bound on the final outbox flush; the socket is cut after it
    pub flush_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
        }
    }
}

/// Normalize a listen address
///
/// A bare port becomes `:port`, and a missing host binds all interfaces.
pub fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    let addr = if addr.contains(':') {
        addr.to_string()
    } else {
        format!(":{}", addr)
    };
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr
    }
}

/// Rewrite single-dash long flags (`-addr`) to the `--addr` form clap expects
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg == "-addr" || arg.starts_with("-addr=") {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("4000"), "0.0.0.0:4000");
        assert_eq!(normalize_addr(":4000"), "0.0.0.0:4000");
        assert_eq!(normalize_addr("127.0.0.1:5000"), "127.0.0.1:5000");
        assert_eq!(normalize_addr("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_single_dash_addr_flag() {
        let config = Config::parse_from(normalize_args(args(&["chat_relay", "-addr", "5000"])));
        assert_eq!(config.listen_addr(), "0.0.0.0:5000");

        let config = Config::parse_from(normalize_args(args(&["chat_relay", "-addr=:6000"])));
        assert_eq!(config.listen_addr(), "0.0.0.0:6000");
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(args(&["chat_relay"]));
        assert_eq!(config.listen_addr(), "0.0.0.0:4000");
        assert_eq!(config.settings(), Settings::default());
    }

    #[test]
    fn test_settings_floor() {
        let config = Config::parse_from(args(&["chat_relay", "--outbox-capacity", "0"]));
        assert_eq!(config.settings().outbox_capacity, 1);

        let config = Config::parse_from(args(&["chat_relay", "--flush-timeout-ms", "250"]));
        assert_eq!(config.settings().flush_timeout, Duration::from_millis(250));
    }
}
