//! workerlink: connection and lifecycle protocol for message-passing workers.
//!
//! A controller spawns workers through a [`WorkerHost`] and talks to them over
//! message channels. Dedicated workers have exactly one controller; shared
//! workers are reached through any number of ports and shut down when the
//! last one closes. Both sides perform a ready handshake before application
//! traffic, intercept the reserved control vocabulary, and can carry the
//! worker's stdio back to the controller.

pub mod bridge;
pub mod config;
pub mod dedicated;
pub mod error;
pub mod lifecycle;
pub mod redirect;
pub mod self_shared;
pub mod shared;
pub mod worker;
mod worker_tracing_layer;

pub use bridge::channel::{
    ChannelError, Endpoint, Message, MessageEvent, SharedWorkerScope, SpawnError, SpawnSpec,
    WorkerHandle, WorkerHost, WorkerScope,
};
pub use bridge::local::{DedicatedContext, LocalHost, SharedContext};
pub use bridge::protocol::{PortCommand, StreamId};
pub use config::LinkConfig;
pub use dedicated::DedicatedConnection;
pub use error::ConnectionError;
pub use redirect::{Sink, SinkSet, StdioRedirector};
pub use self_shared::{SelfSharedConnection, SelfSharedPort};
pub use shared::{MgmtConnection, SharedConnection};
pub use worker::{SelfCloser, SelfConnection};
pub use worker_tracing_layer::WorkerTracingLayer;
