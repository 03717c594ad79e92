//! Channel primitive consumed by the connection protocol.
//!
//! The host hands out endpoints that can post a value, listen for inbound
//! values until a cancellation token fires, and close. Nothing here queues on
//! our behalf: whether a message posted before the peer listens survives is a
//! property of the host, which is why every connection performs a ready
//! handshake before sending application messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Payload carried by the channel. The ready signal is `Value::Null`.
pub type Message = serde_json::Value;

/// One inbound message, with the buffers whose ownership was transferred.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub data: Message,
    pub transfer: Vec<Bytes>,
}

impl MessageEvent {
    pub fn new(data: impl Into<Message>) -> Self {
        Self {
            data: data.into(),
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(data: impl Into<Message>, transfer: Vec<Bytes>) -> Self {
        Self {
            data: data.into(),
            transfer,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.data.as_str()
    }

    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }
}

/// Inbound messages on one endpoint. Ends once the listen token is cancelled
/// (after yielding whatever was already queued) or the endpoint closes.
pub type EventStream = BoxStream<'static, MessageEvent>;

/// Ports delivered to a shared worker by incoming connect requests.
pub type ConnectStream = BoxStream<'static, Arc<dyn Endpoint>>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("endpoint is closed")]
    Closed,
    #[error("channel error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no worker script registered at {0:?}")]
    ScriptNotFound(String),
    #[error("no shared worker named {name:?} at {url:?}")]
    WorkerNotFound { name: String, url: String },
    #[error("a name is required to connect to a shared worker")]
    MissingName,
    #[error("a url is required to connect to a shared worker")]
    MissingUrl,
    #[error("spawn failed: {0}")]
    Other(String),
}

/// One side of a message channel: a worker, a worker's own scope, or a port.
pub trait Endpoint: Send + Sync + 'static {
    /// Send a value, moving ownership of `transfer` to the receiver.
    fn post(&self, data: Message, transfer: Vec<Bytes>) -> Result<(), ChannelError>;

    /// Arm a listener. Events posted before this call may or may not be seen,
    /// depending on the host.
    fn listen(&self, cancel: CancellationToken) -> Result<EventStream, ChannelError>;

    fn close(&self) -> Result<(), ChannelError>;
}

/// Controller-side handle to a dedicated worker.
pub trait WorkerHandle: Endpoint {
    fn name(&self) -> &str;

    /// Destroy the worker immediately, without running its shutdown sequence.
    fn terminate(&self);
}

/// A dedicated worker's view of itself. `close()` closes the worker.
pub trait WorkerScope: Endpoint {
    fn name(&self) -> &str;
}

/// A shared worker's view of itself.
pub trait SharedWorkerScope: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// The port whose connect request started this worker.
    fn initial_port(&self) -> Option<Arc<dyn Endpoint>>;

    fn listen_connect(&self, cancel: CancellationToken) -> Result<ConnectStream, ChannelError>;

    fn close(&self) -> Result<(), ChannelError>;
}

/// Result of asking the host for a shared worker.
pub struct SharedSpawn {
    /// Controller side of the port that started (or reached) the worker.
    pub port: Arc<dyn Endpoint>,
    pub name: String,
    pub url: String,
}

/// Extension point for hosts able to run workers.
#[async_trait]
pub trait WorkerHost: Send + Sync + 'static {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn WorkerHandle>, SpawnError>;

    /// Start a shared worker, or reach the live one already using `spec.name`.
    async fn spawn_shared(&self, spec: &SpawnSpec) -> Result<SharedSpawn, SpawnError>;

    async fn connect_shared(&self, name: &str, url: &str)
    -> Result<Arc<dyn Endpoint>, SpawnError>;
}

/// What to run and how to identify it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Worker identity. Generated (UUID v4) at start when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
    /// Command line, including the program as `args[0]`. Empty means `[path]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Empty means the current process environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add `key=value` entries. Later duplicates win, entries without `=` are skipped.
    pub fn with_env_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            if let Some((key, value)) = entry.as_ref().split_once('=') {
                self.env.insert(key.to_string(), value.to_string());
            }
        }
        self
    }

    /// Fill in a generated name if none was given and return it.
    pub fn ensure_name(&mut self) -> &str {
        self.name
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn effective_args(&self) -> Vec<String> {
        if self.args.is_empty() {
            vec![self.path.clone()]
        } else {
            self.args.clone()
        }
    }

    pub fn effective_env(&self) -> BTreeMap<String, String> {
        if self.env.is_empty() {
            std::env::vars().collect()
        } else {
            self.env.clone()
        }
    }
}
