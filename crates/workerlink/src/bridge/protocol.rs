//! Reserved control vocabulary carried in-band on message channels.
//!
//! Control tokens are plain strings. Every reserved token shares the
//! `__WORKERLINK_` namespace so relays can recognise and intercept them
//! without ever forwarding one to application code. The port policy tokens
//! (`ClosePort`, `CloseWorker`) are sent by applications on ordinary shared
//! ports and are only interpreted by the worker-side port relay.

use std::fmt;

use super::channel::Message;

pub const RESERVED_PREFIX: &str = "__WORKERLINK_";

pub const CLOSE: &str = "__WORKERLINK_CLOSE__";
pub const STDOUT_PREFIX: &str = "__WORKERLINK_STDOUT__";
pub const STDERR_PREFIX: &str = "__WORKERLINK_STDERR__";
pub const WRITE_TO_CONSOLE: &str = "__WORKERLINK_WRITE_TO_CONSOLE__";
pub const WRITE_TO_CONTROLLER: &str = "__WORKERLINK_WRITE_TO_CONTROLLER__";

pub const CLOSE_PORT: &str = "ClosePort";
pub const CLOSE_WORKER: &str = "CloseWorker";

/// Output stream a redirected line belongs to, numbered like the fds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdout = 1,
    Stderr = 2,
}

impl StreamId {
    pub fn from_fd(fd: i32) -> Option<Self> {
        match fd {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn fd(self) -> i32 {
        self as i32
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Stdout => STDOUT_PREFIX,
            Self::Stderr => STDERR_PREFIX,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// A recognised control token. Stdio variants borrow the text after the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control<'a> {
    Close,
    Stdout(&'a str),
    Stderr(&'a str),
    WriteToConsole,
    WriteToController,
    /// Carries the namespace prefix but is not a token we know.
    Reserved(&'a str),
}

/// Classify an inbound payload. `None` means it belongs to the application.
pub fn classify(data: &Message) -> Option<Control<'_>> {
    let text = data.as_str()?;
    if !text.starts_with(RESERVED_PREFIX) {
        return None;
    }
    let control = match text {
        CLOSE => Control::Close,
        WRITE_TO_CONSOLE => Control::WriteToConsole,
        WRITE_TO_CONTROLLER => Control::WriteToController,
        _ => {
            if let Some(line) = text.strip_prefix(STDOUT_PREFIX) {
                Control::Stdout(line)
            } else if let Some(line) = text.strip_prefix(STDERR_PREFIX) {
                Control::Stderr(line)
            } else {
                Control::Reserved(text)
            }
        }
    };
    Some(control)
}

/// Requests an application may send on an ordinary shared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCommand {
    /// Close this port; the worker shuts down if it was the last one.
    ClosePort,
    /// Close this port and shut the worker down regardless of other ports.
    CloseWorker,
}

impl PortCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClosePort => CLOSE_PORT,
            Self::CloseWorker => CLOSE_WORKER,
        }
    }

    pub fn message(self) -> Message {
        control_message(self.as_str())
    }
}

pub fn port_command(data: &Message) -> Option<PortCommand> {
    match data.as_str()? {
        CLOSE_PORT => Some(PortCommand::ClosePort),
        CLOSE_WORKER => Some(PortCommand::CloseWorker),
        _ => None,
    }
}

pub fn control_message(token: &str) -> Message {
    Message::String(token.to_string())
}

/// One redirected line as it travels to the controller.
pub fn stdio_message(stream: StreamId, line: &str) -> Message {
    let prefix = stream.prefix();
    let mut text = String::with_capacity(prefix.len() + line.len() + 1);
    text.push_str(prefix);
    text.push_str(line);
    text.push('\n');
    Message::String(text)
}

/// Handshake signal posted by a listener once it is armed.
pub fn ready() -> Message {
    Message::Null
}

/// Ack posted on a port once it has been bound as the mgmt port.
pub fn mgmt_ack() -> Message {
    Message::Bool(true)
}
