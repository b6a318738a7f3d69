//! The transport seam: `Channel` and `Connector`.
//!
//! The pool never frames or dispatches RPCs itself. It only asks a channel
//! for its current state, closes it, and asks a connector for a new one.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::address::Address;
use crate::error::PoolError;
use crate::state::ChannelState;

/// A single network channel to one backend address.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; one channel is shared read-only by
/// every client connection bound to its address.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn Channel>`.
pub trait Channel: Send + Sync + 'static {
    /// Current connectivity state. Must not perform network I/O or block.
    fn state(&self) -> ChannelState;

    /// Tear down the channel. After this, `state()` reports `Shutdown`.
    /// Calling it more than once is a no-op.
    fn close(&self);

    /// The address this channel is connected to.
    fn address(&self) -> &Address;

    /// Concrete-type access for stubs bound to a specific transport.
    fn as_any(&self) -> &dyn Any;
}

/// Creates channels. Implemented once per transport (TCP, mock, ...).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new channel to `address`.
    ///
    /// The returned channel must be fully constructed; the pool publishes it
    /// to other callers as soon as this returns.
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>, PoolError>;
}

/// Process-unique identity of a channel created by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// A borrowed reference to a pooled channel.
///
/// Cloning is cheap. Holding a handle does not keep the channel open: the
/// pool may close it (force-close, shutdown, replacement) at any time, after
/// which `state()` reports `Shutdown`.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    inner: Arc<dyn Channel>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, inner: Arc<dyn Channel>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    pub fn address(&self) -> &Address {
        self.inner.address()
    }

    /// Returns `true` if both handles refer to the same underlying channel.
    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        self.id == other.id
    }

    /// Borrow the concrete channel type, e.g. `TcpChannel` for a stub that
    /// writes frames directly.
    pub fn downcast_ref<T: Channel>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// Close the underlying channel. Borrowers should prefer
    /// [`ChannelPool::force_close`](crate::ChannelPool::force_close), which
    /// also removes the pool entry.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("address", &self.inner.address())
            .field("state", &self.inner.state())
            .finish()
    }
}
