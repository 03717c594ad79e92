//! Errors surfaced by connection setup and control calls.
//!
//! Once a relay is running, per-message failures are logged and never reach
//! the caller; only setup, configuration, and channel-closure conditions do.

use crate::bridge::channel::{ChannelError, SpawnError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("shared worker {name:?} already exists")]
    AlreadyExists { name: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("channel closed before the handshake completed")]
    ChannelClosed,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ConnectionError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_messages() {
        insta::assert_snapshot!(
            ConnectionError::already_exists("hello").to_string(),
            @r#"shared worker "hello" already exists"#
        );
        insta::assert_snapshot!(
            ConnectionError::configuration("stdout already set").to_string(),
            @"invalid configuration: stdout already set"
        );
        insta::assert_snapshot!(
            ConnectionError::from(SpawnError::MissingName).to_string(),
            @"a name is required to connect to a shared worker"
        );
        insta::assert_snapshot!(
            ConnectionError::from(ChannelError::Closed).to_string(),
            @"endpoint is closed"
        );
    }
}
