//! chanpool-core — shared channel pool and client reconnection for RPC clients.
//!
//! # Overview
//!
//! Every RPC-based client in a process (database, cache, messaging, ...)
//! talks to a small fixed set of backend addresses. This crate lets many
//! independent clients share one physical channel per address without
//! duplicate connections and without ever handing out a dead channel.
//!
//! - [`ChannelPool`] — process-wide registry `Address → pooled channel`,
//!   reference counted, with per-address locking
//! - [`ClientConnection`] — per-client borrower with a lock-free healthy
//!   path and deduplicated reconnection
//! - [`Channel`] / [`Connector`] — the transport seam implemented by
//!   concrete transports (see `chanpool-tcp`)
//! - [`ChannelState`] — locally cached connectivity state
//! - [`PoolError`] — structured error type

pub mod address;
pub mod client;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pool;
pub mod state;
pub mod transport;

pub use address::{Address, Resolver, StaticResolver};
pub use client::{ClientConnection, StubFactory};
pub use config::{PoolConfig, PoolConfigFile};
pub use error::PoolError;
pub use pool::{ChannelPool, PoolStats};
pub use state::{wait_for_ready, AtomicChannelState, ChannelState, ConnectionState};
pub use transport::{Channel, ChannelHandle, ChannelId, Connector};
