//! # dbwire-client
//!
//! Communication engine for a multi-host database cluster.
//!
//! This crate provides:
//! - Multiplexed connections: many requests in flight on one socket,
//!   matched to responses by message id
//! - Per-host connection pools with load balancing and idle reaping
//! - Cluster topology refresh with draining of removed hosts
//! - Conversations binding an execution context to one connection
//! - Optional TLS and authentication on connect

pub mod balancer;
pub mod communication;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod pool;
pub mod stream;
pub mod tls;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use communication::Communication;
pub use config::{
    CommunicationConfig, CommunicationConfigBuilder, ConfigFile, LoadBalancingStrategy,
    TlsOptions,
};
pub use connection::Connection;
pub use conversation::{Conversation, ConversationManager, ExecutionContext};
pub use error::CommError;
pub use pool::{ClusterPool, HostPool, Lease, TopologyChange};

pub use dbwire_protocol::{
    ContentCodec, ContentSerde, ContentType, Credential, DocumentMeta, HostDescription, Method,
    Request, Response,
};
