//! Message bridge between a controller and its workers.
//!
//! This module holds everything below the connection protocol: the channel
//! primitive the host provides, the reserved control vocabulary carried on it,
//! and the framing used for redirected stdio.
//!
//! # Architecture
//!
//! - **channel**: Host capability traits (spawn, post, listen, close, terminate)
//! - **protocol**: Reserved control tokens and inbound classification
//! - **codec**: Lossy line decoder for stdio byte streams
//! - **local**: In-process host running worker programs as tokio tasks

pub mod channel;
pub mod codec;
pub mod local;
pub mod protocol;
