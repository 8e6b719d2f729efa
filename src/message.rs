//! Line protocol definitions
//!
//! Newline-delimited plaintext in both directions. Inbound lines are parsed
//! into the closed `ClientMessage` set; outbound lines are `ServerMessage`
//! values whose `Display` impl is the exact wire text.

use std::fmt::{self, Write as _};

use crate::error::AppError;

/// Client → Server message
///
/// One parsed inbound line in the `Active` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `/chch <channel>`: leave the current channel and join another
    ChangeChannel(String),
    /// `/chun <name>`: change username in place
    ChangeName(String),
    /// `/msg <name> <text>`: private message
    PrivateMessage { to: String, text: String },
    /// `/close`: graceful shutdown
    Close,
    /// `/help`: usage text
    Help,
    /// Any other non-empty line: broadcast to the current channel
    Say(String),
}

impl ClientMessage {
    /// Parse one raw inbound line
    ///
    /// The line is trimmed and control characters are escaped before any
    /// interpretation. Returns `Ok(None)` for lines that are empty after
    /// trimming. Command prefixes are case-sensitive.
    pub fn parse(raw: &str) -> Result<Option<Self>, AppError> {
        let line = escape_control_chars(raw.trim());
        if line.is_empty() {
            return Ok(None);
        }

        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line.as_str(), ""),
        };

        let msg = match command {
            "/chch" if rest.is_empty() => return Err(AppError::MissingChannelName),
            "/chch" => ClientMessage::ChangeChannel(rest.to_string()),
            "/chun" if rest.is_empty() => return Err(AppError::MissingUsername),
            "/chun" => ClientMessage::ChangeName(rest.to_string()),
            "/msg" => {
                let Some((to, text)) = rest.split_once(' ') else {
                    return Err(AppError::MalformedPrivateMessage);
                };
                let text = text.trim();
                if text.is_empty() {
                    return Err(AppError::MalformedPrivateMessage);
                }
                ClientMessage::PrivateMessage {
                    to: to.to_string(),
                    text: text.to_string(),
                }
            }
            "/close" if rest.is_empty() => ClientMessage::Close,
            "/help" if rest.is_empty() => ClientMessage::Help,
            _ => ClientMessage::Say(line.clone()),
        };

        Ok(Some(msg))
    }
}

/// Trim a prompt reply and escape it; `None` if nothing is left
pub fn prompt_reply(raw: &str) -> Option<String> {
    let reply = escape_control_chars(raw.trim());
    (!reply.is_empty()).then_some(reply)
}

/// Escape C0 control characters (except the `\n` delimiter)
///
/// Named escapes are used where one exists (`\t`, `\r`, ...), everything else
/// becomes `\xNN`. Single pass; escaping already-escaped text escapes nothing.
pub fn escape_control_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\n' => out.push(ch),
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            '\x0c' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            c if c < ' ' => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Which value a prompt is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    Username,
    Channel,
}

/// Server → Client message
///
/// Every variant renders to one or more complete lines, except prompts,
/// which are left unterminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Banner sent on connect
    Welcome,
    /// `username: ` / `channel: `
    Prompt(Prompt),
    /// Name registration in progress
    Registering { username: String },
    /// Name registration refused
    NameUnavailable { username: String },
    /// Old name dropped as part of a rename
    Deregistering { username: String },
    /// Pointer to `/help`, sent once after the channel prompt
    HelpHint,
    /// Static usage text
    Help,
    /// Usage notice for a malformed command
    Usage(&'static str),
    /// Acknowledgement of `/chch`
    ChangingChannel { channel: String },
    /// Admission notice to the joining client
    Joining { channel: String },
    /// Someone else joined
    Joined { username: String },
    /// Removal notice to the leaving client
    Leaving { channel: String },
    /// Someone else left
    Left { username: String },
    /// Rename notice to the renaming client
    ChangingName { username: String },
    /// Rename broadcast
    Renamed { from: String, to: String },
    /// Channel line from another member
    Chat { from: String, text: String },
    /// Echo of the client's own channel line
    Echo { from: String, text: String },
    /// Private message delivery
    Private { from: String, text: String },
    /// Private message confirmation
    MessageSent,
    /// Private message to a name nobody holds
    UnknownUser { username: String },
    /// Inbound line exceeded the length limit
    LineTooLong,
    /// Something went wrong on the server side
    InternalError,
    /// Last line before the connection closes
    ShuttingDown,
}

const HELP_TEXT: &str = "\
??? /help                      - usage info
??? /chch <channelname>        - join new channel
??? /chun <username>           - change username
??? /msg  <username> <message> - private message
??? /close                     - close connection
";

pub(crate) const USAGE_CHCH: &str = "/chch <channelname>";
pub(crate) const USAGE_CHUN: &str = "/chun <username>";
pub(crate) const USAGE_MSG: &str = "/msg <username> <message>";

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Welcome => writeln!(f, "*** welcome to the chat server"),
            ServerMessage::Prompt(Prompt::Username) => write!(f, "username: "),
            ServerMessage::Prompt(Prompt::Channel) => write!(f, "channel: "),
            ServerMessage::Registering { username } => {
                writeln!(f, "*** registering username {}", username)
            }
            ServerMessage::NameUnavailable { username } => {
                writeln!(f, "*** username {} is not available", username)
            }
            ServerMessage::Deregistering { username } => {
                writeln!(f, "*** deregistering username {}", username)
            }
            ServerMessage::HelpHint => writeln!(f, "??? /help for usage info"),
            ServerMessage::Help => f.write_str(HELP_TEXT),
            ServerMessage::Usage(usage) => writeln!(f, "??? usage: {}", usage),
            ServerMessage::ChangingChannel { channel } => {
                writeln!(f, "*** changing to channel {}", channel)
            }
            ServerMessage::Joining { channel } => writeln!(f, "*** joining channel {}", channel),
            ServerMessage::Joined { username } => {
                writeln!(f, "+++ {} has joined the channel", username)
            }
            ServerMessage::Leaving { channel } => writeln!(f, "*** leaving channel {}", channel),
            ServerMessage::Left { username } => writeln!(f, "--- {} has left the channel", username),
            ServerMessage::ChangingName { username } => {
                writeln!(f, "*** changing username to {}", username)
            }
            ServerMessage::Renamed { from, to } => writeln!(f, "/// {} now known as {}", from, to),
            ServerMessage::Chat { from, text } => writeln!(f, "--> {}: {}", from, text),
            ServerMessage::Echo { from, text } => writeln!(f, ">>> {}: {}", from, text),
            ServerMessage::Private { from, text } => writeln!(f, "### {}: {}", from, text),
            ServerMessage::MessageSent => writeln!(f, "*** message sent"),
            ServerMessage::UnknownUser { username } => {
                writeln!(f, "*** user {} is not registered", username)
            }
            ServerMessage::LineTooLong => writeln!(f, "*** line too long"),
            ServerMessage::InternalError => writeln!(f, "*** internal error"),
            ServerMessage::ShuttingDown => writeln!(f, "*** shutting down"),
        }
    }
}

/// Convert AppError to a notice for the offending client
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NameUnavailable(username) => ServerMessage::NameUnavailable { username },
            AppError::MissingChannelName => ServerMessage::Usage(USAGE_CHCH),
            AppError::MissingUsername => ServerMessage::Usage(USAGE_CHUN),
            AppError::MalformedPrivateMessage => ServerMessage::Usage(USAGE_MSG),
            AppError::LineTooLong => ServerMessage::LineTooLong,
            AppError::Io(_) | AppError::RegistryClosed | AppError::ChannelClosed(_) => {
                ServerMessage::InternalError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ClientMessage {
        ClientMessage::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("/chch lobby"), ClientMessage::ChangeChannel("lobby".into()));
        assert_eq!(parse("/chun bob"), ClientMessage::ChangeName("bob".into()));
        assert_eq!(
            parse("/msg bob hi there "),
            ClientMessage::PrivateMessage {
                to: "bob".into(),
                text: "hi there".into()
            }
        );
        assert_eq!(parse("  /close\r\n"), ClientMessage::Close);
        assert_eq!(parse("/help"), ClientMessage::Help);
    }

    #[test]
    fn test_parse_broadcast_and_empty() {
        assert_eq!(parse("hello world"), ClientMessage::Say("hello world".into()));
        // Prefixes are case-sensitive and must be whole words
        assert_eq!(parse("/CLOSE"), ClientMessage::Say("/CLOSE".into()));
        assert_eq!(parse("/chchlobby"), ClientMessage::Say("/chchlobby".into()));
        assert!(ClientMessage::parse("   \t ").unwrap().is_none());
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!(matches!(
            ClientMessage::parse("/chch"),
            Err(AppError::MissingChannelName)
        ));
        assert!(matches!(
            ClientMessage::parse("/chch    "),
            Err(AppError::MissingChannelName)
        ));
        assert!(matches!(ClientMessage::parse("/chun"), Err(AppError::MissingUsername)));
        assert!(matches!(
            ClientMessage::parse("/msg bob"),
            Err(AppError::MalformedPrivateMessage)
        ));
        assert!(matches!(
            ClientMessage::parse("/msg"),
            Err(AppError::MalformedPrivateMessage)
        ));
    }

    #[test]
    fn test_escape_control_chars() {
        assert_eq!(escape_control_chars("plain text"), "plain text");
        assert_eq!(escape_control_chars("a\tb"), "a\\tb");
        assert_eq!(escape_control_chars("\x1b[2J"), "\\x1b[2J");
        assert_eq!(escape_control_chars("\x00\x07\x7f"), "\\x00\\a\x7f");
        assert_eq!(escape_control_chars("ünï\r"), "ünï\\r");
    }

    #[test]
    fn test_parse_escapes_before_use() {
        assert_eq!(
            parse("/chun ev\x1bil"),
            ClientMessage::ChangeName("ev\\x1bil".into())
        );
        assert_eq!(prompt_reply(" al\x08ice \n"), Some("al\\bice".to_string()));
        assert_eq!(prompt_reply("  \r\n"), None);
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(ServerMessage::Prompt(Prompt::Username).to_string(), "username: ");
        assert_eq!(ServerMessage::Prompt(Prompt::Channel).to_string(), "channel: ");
        assert_eq!(
            ServerMessage::Joined {
                username: "bob".into()
            }
            .to_string(),
            "+++ bob has joined the channel\n"
        );
        assert_eq!(
            ServerMessage::Chat {
                from: "alice".into(),
                text: "hello".into()
            }
            .to_string(),
            "--> alice: hello\n"
        );
        assert_eq!(
            ServerMessage::Renamed {
                from: "alice".into(),
                to: "carol".into()
            }
            .to_string(),
            "/// alice now known as carol\n"
        );
        assert_eq!(ServerMessage::Help.to_string().lines().count(), 5);
    }

    #[test]
    fn test_error_to_notice() {
        let msg: ServerMessage = AppError::NameUnavailable("alice".into()).into();
        assert_eq!(msg.to_string(), "*** username alice is not available\n");

        let msg: ServerMessage = AppError::MalformedPrivateMessage.into();
        assert_eq!(msg.to_string(), "??? usage: /msg <username> <message>\n");

        let msg: ServerMessage = AppError::RegistryClosed.into();
        assert_eq!(msg, ServerMessage::InternalError);
        let msg: ServerMessage = AppError::ChannelClosed("lobby".into()).into();
        assert_eq!(msg.to_string(), "*** internal error\n");
    }
}
