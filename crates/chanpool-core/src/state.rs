//! Channel connectivity states and the client connection lifecycle.
//!
//! Channel state transitions are driven by the transport, not by this crate:
//! ```text
//! Idle ⇄ Connecting → Ready → TransientFailure → Connecting ...
//!                       any → Shutdown (terminal)
//! ```
//! Client connections move through:
//! ```text
//! Disconnected → Connecting → Connected → Reconnecting → Connected
//!                                 └── close / force_close → Disconnected
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::transport::ChannelHandle;

/// Locally cached connectivity state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ChannelState {
    /// States in which a channel may be handed out and used.
    pub const HEALTHY: [ChannelState; 3] = [Self::Idle, Self::Ready, Self::Connecting];
    /// States that require the channel to be replaced.
    pub const UNHEALTHY: [ChannelState; 2] = [Self::TransientFailure, Self::Shutdown];

    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Idle | Self::Ready | Self::Connecting)
    }

    pub fn is_unhealthy(self) -> bool {
        !self.is_healthy()
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Ready => 2,
            Self::TransientFailure => 3,
            Self::Shutdown => 4,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values decode as `Shutdown`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::TransientFailure,
            _ => Self::Shutdown,
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::TransientFailure => write!(f, "transient-failure"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Atomic cell holding a [`ChannelState`]; transports use it to publish
/// connectivity changes that readers observe without blocking.
#[derive(Debug)]
pub struct AtomicChannelState(AtomicU8);

impl AtomicChannelState {
    pub fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ChannelState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move to `next` unless the current state is `Shutdown`.
    ///
    /// Returns the previous state.
    pub fn transition(&self, next: ChannelState) -> ChannelState {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if ChannelState::from_u8(current) == ChannelState::Shutdown {
                return ChannelState::Shutdown;
            }
            match self.0.compare_exchange_weak(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return ChannelState::from_u8(prev),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Lifecycle of a [`ClientConnection`](crate::ClientConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Reconnecting,
        }
    }

    pub(crate) fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Poll `handle` until it reports `Ready`.
///
/// Returns the last observed state: `Ready`, an unhealthy state, or whatever
/// the channel was in when `timeout` elapsed.
pub async fn wait_for_ready(
    handle: &ChannelHandle,
    timeout: Duration,
    poll_interval: Duration,
) -> ChannelState {
    let deadline = Instant::now() + timeout;
    loop {
        let state = handle.state();
        if state == ChannelState::Ready || state.is_unhealthy() || Instant::now() >= deadline {
            return state;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
