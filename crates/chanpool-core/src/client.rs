//! Per-client connection with deduplicated reconnection.
//!
//! A `ClientConnection` borrows a channel from the [`ChannelPool`] and binds
//! a request stub to it. Every RPC issued by a business client goes through
//! [`ensure_connected`](ClientConnection::ensure_connected) first:
//!
//! 1. Fast path: if connected and the bound channel reports a healthy state,
//!    return. One atomic load plus the channel's local state read; no lock,
//!    no pool call.
//! 2. Otherwise take the reconnection lock, then re-check. The re-check is
//!    mandatory: callers that queued behind an in-flight reconnect must find
//!    the fresh channel and return rather than reconnecting again.
//! 3. Still absent or unhealthy: acquire from the pool and rebind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::address::{Address, Resolver};
use crate::error::PoolError;
use crate::pool::ChannelPool;
use crate::state::{AtomicConnectionState, ConnectionState};
use crate::transport::ChannelHandle;

/// Builds a request stub for a freshly bound channel.
pub type StubFactory<S> = Arc<dyn Fn(&ChannelHandle) -> S + Send + Sync>;

struct Binding<S> {
    channel: ChannelHandle,
    stub: Arc<S>,
}

/// A logical client's view of one backend address.
///
/// The connection never owns the channel: [`close`](Self::close) drops its
/// reference in the pool and leaves the channel open for siblings.
pub struct ClientConnection<S = ChannelHandle> {
    address: Address,
    pool: Arc<ChannelPool>,
    factory: StubFactory<S>,
    connected: AtomicBool,
    binding: ArcSwapOption<Binding<S>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    state: AtomicConnectionState,
    reconnects: AtomicU64,
}

impl ClientConnection<ChannelHandle> {
    /// A connection whose stub is the channel handle itself.
    pub fn plain(pool: Arc<ChannelPool>, address: Address) -> Self {
        Self::new(pool, address, |handle: &ChannelHandle| handle.clone())
    }
}

impl<S: Send + Sync + 'static> ClientConnection<S> {
    /// Create a disconnected client. Nothing is acquired until the first
    /// [`ensure_connected`](Self::ensure_connected).
    pub fn new<F>(pool: Arc<ChannelPool>, address: Address, factory: F) -> Self
    where
        F: Fn(&ChannelHandle) -> S + Send + Sync + 'static,
    {
        Self {
            address,
            pool,
            factory: Arc::new(factory),
            connected: AtomicBool::new(false),
            binding: ArcSwapOption::empty(),
            reconnect_lock: tokio::sync::Mutex::new(()),
            state: AtomicConnectionState::new(ConnectionState::Disconnected),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Resolve a logical service name, then build the client for it.
    pub fn from_name<F>(
        pool: Arc<ChannelPool>,
        resolver: &dyn Resolver,
        name: &str,
        factory: F,
    ) -> Result<Self, PoolError>
    where
        F: Fn(&ChannelHandle) -> S + Send + Sync + 'static,
    {
        let address = resolver.resolve(name)?;
        Ok(Self::new(pool, address, factory))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.load()
    }

    /// How many times this client has rebound to a new channel.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// The currently bound channel, if any.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.binding.load_full().map(|b| b.channel.clone())
    }

    /// The currently bound stub, if any. Does not check health; call
    /// [`ensure_stub`](Self::ensure_stub) before issuing an RPC.
    pub fn stub(&self) -> Option<Arc<S>> {
        self.binding.load_full().map(|b| b.stub.clone())
    }

    /// Guarantee a healthy bound channel before an RPC.
    ///
    /// Returns `Err` only when a fresh channel cannot be established; a dead
    /// channel that can be replaced is never surfaced to the caller.
    pub async fn ensure_connected(&self) -> Result<(), PoolError> {
        if self.connected.load(Ordering::Acquire) {
            if let Some(binding) = &*self.binding.load() {
                if binding.channel.is_healthy() {
                    return Ok(());
                }
            }
        }

        let _guard = self.reconnect_lock.lock().await;

        // Re-check under the lock: a caller ahead of us may already have
        // rebound to a healthy channel.
        let current = self.binding.load_full();
        match current {
            Some(binding) if self.connected.load(Ordering::Acquire) => {
                if binding.channel.is_healthy() {
                    return Ok(());
                }
                tracing::debug!(
                    address = %self.address,
                    channel = %binding.channel.id(),
                    state = %binding.channel.state(),
                    "bound channel unhealthy"
                );
                self.reconnect_locked().await
            }
            _ => self.connect_locked().await,
        }
    }

    /// [`ensure_connected`](Self::ensure_connected), then return the stub.
    pub async fn ensure_stub(&self) -> Result<Arc<S>, PoolError> {
        self.ensure_connected().await?;
        self.stub()
            .ok_or_else(|| PoolError::connection(&self.address, "connection closed concurrently"))
    }

    /// Drop the current channel reference and bind a fresh one from the pool,
    /// regardless of the current channel's health.
    pub async fn reconnect(&self) -> Result<(), PoolError> {
        let _guard = self.reconnect_lock.lock().await;
        self.reconnect_locked().await
    }

    /// Whether the bound channel is currently healthy. Never blocks, never
    /// reconnects; `false` when nothing is bound.
    pub fn is_channel_healthy(&self) -> bool {
        match &*self.binding.load() {
            Some(b) => b.channel.is_healthy(),
            None => false,
        }
    }

    /// Release this client's reference and return to `Disconnected`.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        let _guard = self.reconnect_lock.lock().await;
        self.unbind();
        self.connected.store(false, Ordering::Release);
        self.state.store(ConnectionState::Disconnected);
    }

    /// Force-close the shared channel in the pool, then reset like
    /// [`close`](Self::close). Every other client on this address will have to
    /// reconnect.
    pub async fn force_close(&self) {
        let _guard = self.reconnect_lock.lock().await;
        self.pool.force_close(&self.address).await;
        // the entry is gone; dropping the binding without a release is enough
        self.binding.store(None);
        self.connected.store(false, Ordering::Release);
        self.state.store(ConnectionState::Disconnected);
    }

    // Caller must hold `reconnect_lock`.
    async fn connect_locked(&self) -> Result<(), PoolError> {
        self.state.store(ConnectionState::Connecting);
        let pending = PendingBind::new(&self.state);
        // a binding without the connected flag is left over from a failed
        // bind; give its reference back first
        self.unbind();

        let handle = self.pool.acquire(&self.address).await?;
        self.bind(handle);
        pending.bound();
        tracing::debug!(address = %self.address, "client connected");
        Ok(())
    }

    // Caller must hold `reconnect_lock`.
    async fn reconnect_locked(&self) -> Result<(), PoolError> {
        self.state.store(ConnectionState::Reconnecting);
        let pending = PendingBind::new(&self.state);
        self.connected.store(false, Ordering::Release);
        self.unbind();

        match self.pool.acquire(&self.address).await {
            Ok(handle) => {
                let channel = handle.id();
                self.bind(handle);
                pending.bound();
                let n = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(
                    address = %self.address,
                    channel = %channel,
                    reconnects = n,
                    "client reconnected"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "reconnect failed");
                Err(e)
            }
        }
    }

    fn bind(&self, handle: ChannelHandle) {
        let stub = Arc::new((self.factory)(&handle));
        self.binding.store(Some(Arc::new(Binding {
            channel: handle,
            stub,
        })));
        self.connected.store(true, Ordering::Release);
        self.state.store(ConnectionState::Connected);
    }

    fn unbind(&self) {
        if let Some(old) = self.binding.swap(None) {
            self.pool.release_handle(&old.channel);
        }
    }
}

/// Resets the connection state to `Disconnected` unless a bind completed.
/// Covers both an acquire error and the caller dropping the future mid-acquire.
struct PendingBind<'a> {
    state: &'a AtomicConnectionState,
    bound: bool,
}

impl<'a> PendingBind<'a> {
    fn new(state: &'a AtomicConnectionState) -> Self {
        Self { state, bound: false }
    }

    fn bound(mut self) {
        self.bound = true;
    }
}

impl Drop for PendingBind<'_> {
    fn drop(&mut self) {
        if !self.bound {
            self.state.store(ConnectionState::Disconnected);
        }
    }
}

impl<S> Drop for ClientConnection<S> {
    fn drop(&mut self) {
        if let Some(old) = self.binding.swap(None) {
            self.pool.release_handle(&old.channel);
        }
    }
}

impl<S> std::fmt::Debug for ClientConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("address", &self.address)
            .field("state", &self.state.load())
            .field("reconnects", &self.reconnects.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::state::ChannelState;
    use crate::{PoolConfig, StaticResolver};
    use std::time::Duration;

    fn addr() -> Address {
        Address::new("svc-a", 50051)
    }

    fn setup() -> (Arc<MockConnector>, Arc<ChannelPool>) {
        let connector = Arc::new(MockConnector::new());
        let pool = ChannelPool::new(connector.clone(), PoolConfig::default());
        (connector, pool)
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool, addr());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_channel_healthy());
        assert!(client.stub().is_none());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn first_call_connects() {
        let (_connector, pool) = setup();
        let client = ClientConnection::plain(pool.clone(), addr());
        client.ensure_connected().await.unwrap();

        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert!(client.is_channel_healthy());
        assert_eq!(pool.refcount(&addr()), Some(1));
        assert_eq!(client.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn healthy_path_does_not_touch_pool() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool.clone(), addr());
        client.ensure_connected().await.unwrap();

        let before = pool.stats();
        for _ in 0..100 {
            client.ensure_connected().await.unwrap();
        }
        assert_eq!(pool.stats(), before);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_channel_triggers_one_reconnect() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool.clone(), addr());
        client.ensure_connected().await.unwrap();

        connector.last_channel().unwrap().set_state(ChannelState::Shutdown);
        assert!(!client.is_channel_healthy());

        client.ensure_connected().await.unwrap();
        assert_eq!(client.reconnect_count(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.channel().unwrap().state(), ChannelState::Ready);
        assert_eq!(pool.refcount(&addr()), Some(1));
    }

    #[tokio::test]
    async fn explicit_reconnect_rebinds() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool.clone(), addr());
        client.ensure_connected().await.unwrap();
        let first = client.channel().unwrap();

        client.reconnect().await.unwrap();
        // healthy entry is reused; refcount stays balanced
        assert!(first.same_channel(&client.channel().unwrap()));
        assert_eq!(pool.refcount(&addr()), Some(1));
        assert_eq!(client.reconnect_count(), 1);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool.clone(), addr());
        client.ensure_connected().await.unwrap();

        client.close().await;
        client.close().await;

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.stub().is_none());
        assert_eq!(pool.refcount(&addr()), Some(0));
        assert_eq!(connector.last_channel().unwrap().close_count(), 0);

        // revivable
        client.ensure_connected().await.unwrap();
        assert_eq!(pool.refcount(&addr()), Some(1));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn connect_error_propagates() {
        let (connector, pool) = setup();
        connector.set_failing(true);
        let client = ClientConnection::plain(pool, addr());

        let err = client.ensure_connected().await.unwrap_err();
        assert!(matches!(err, PoolError::Connection { .. }));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_channel_healthy());
    }

    #[tokio::test]
    async fn failed_reconnect_surfaces_and_recovers() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool, addr());
        client.ensure_connected().await.unwrap();

        connector.last_channel().unwrap().set_state(ChannelState::TransientFailure);
        connector.set_failing(true);
        assert!(client.ensure_connected().await.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        connector.set_failing(false);
        client.ensure_connected().await.unwrap();
        assert!(client.is_channel_healthy());
    }

    #[tokio::test]
    async fn abandoned_connect_leaves_client_disconnected() {
        let connector = Arc::new(MockConnector::with_delay(Duration::from_millis(200)));
        let pool = ChannelPool::new(connector.clone(), PoolConfig::default());
        let client = ClientConnection::plain(pool.clone(), addr());

        let res = tokio::time::timeout(Duration::from_millis(20), client.ensure_connected()).await;
        assert!(res.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.stub().is_none());
        assert_eq!(pool.stats().entries, 0);

        connector.set_delay(None);
        client.ensure_connected().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(pool.refcount(&addr()), Some(1));
    }

    #[tokio::test]
    async fn abandoned_reconnect_leaves_client_disconnected() {
        let (connector, pool) = setup();
        let client = ClientConnection::plain(pool.clone(), addr());
        client.ensure_connected().await.unwrap();

        connector.last_channel().unwrap().set_state(ChannelState::TransientFailure);
        connector.set_delay(Some(Duration::from_millis(200)));
        let res = tokio::time::timeout(Duration::from_millis(20), client.ensure_connected()).await;
        assert!(res.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_channel_healthy());
        assert_eq!(client.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn stub_is_rebuilt_on_reconnect() {
        let (connector, pool) = setup();
        let client = ClientConnection::new(pool, addr(), |h: &ChannelHandle| h.id());

        let first = *client.ensure_stub().await.unwrap();
        connector.last_channel().unwrap().set_state(ChannelState::Shutdown);
        let second = *client.ensure_stub().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn drop_releases_reference() {
        let (_connector, pool) = setup();
        {
            let client = ClientConnection::plain(pool.clone(), addr());
            client.ensure_connected().await.unwrap();
            assert_eq!(pool.refcount(&addr()), Some(1));
        }
        assert_eq!(pool.refcount(&addr()), Some(0));
    }

    #[tokio::test]
    async fn from_name_resolves() {
        let (_connector, pool) = setup();
        let resolver = StaticResolver::new().with("orders-db", addr());
        let client =
            ClientConnection::from_name(pool, &resolver, "orders-db", |h: &ChannelHandle| h.clone())
                .unwrap();
        assert_eq!(client.address(), &addr());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_unhealthy_callers_reconnect_once() {
        let connector = Arc::new(MockConnector::new());
        let pool = ChannelPool::new(connector.clone(), PoolConfig::default());
        let client = Arc::new(ClientConnection::plain(pool.clone(), addr()));
        client.ensure_connected().await.unwrap();

        connector.set_delay(Some(Duration::from_millis(50)));
        connector.last_channel().unwrap().set_state(ChannelState::TransientFailure);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let c = client.clone();
                tokio::spawn(async move { c.ensure_connected().await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(client.reconnect_count(), 1);
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(pool.refcount(&addr()), Some(1));
    }
}
