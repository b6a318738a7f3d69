//! chanpool-tcp — TCP transport for the channel pool.
//!
//! # Features
//! - One background task per channel watches the socket and publishes
//!   connectivity changes, so `state()` is a local atomic read
//! - Peer close or read error moves the channel to `TransientFailure`
//! - Inbound bytes are forwarded to whoever takes the channel's receiver

pub mod channel;
pub mod connector;

pub use channel::TcpChannel;
pub use connector::{TcpConfig, TcpConnector};
