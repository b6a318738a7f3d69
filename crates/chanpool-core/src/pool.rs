//! Process-wide channel pool: one reference-counted channel per address.
//!
//! Locking is sharded per address. Each address gets an `AddressSlot` on
//! first touch, holding:
//! - an async `gate` that serialises entry creation, replacement and removal
//!   for that address. It is held across the connect handshake, so a second
//!   acquirer waits and then reuses the new channel instead of building its
//!   own, and no caller can observe a half-built entry.
//! - the entry itself behind a short synchronous lock, so refcount changes
//!   and stats never wait on a handshake in progress.
//!
//! Slots are never removed from the map once created; an evicted or
//! force-closed address keeps its (empty) slot so every caller contends on
//! the same gate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::state::ChannelState;
use crate::transport::{ChannelHandle, ChannelId, Connector};

struct PooledEntry {
    handle: ChannelHandle,
    refcount: usize,
    created_at: Instant,
    /// Set when refcount drops to 0, cleared on the next acquire.
    idle_since: Option<Instant>,
}

impl PooledEntry {
    fn new(handle: ChannelHandle) -> Self {
        Self {
            handle,
            refcount: 1,
            created_at: Instant::now(),
            idle_since: None,
        }
    }
}

#[derive(Default)]
struct AddressSlot {
    gate: tokio::sync::Mutex<()>,
    entry: Mutex<Option<PooledEntry>>,
}

#[derive(Default)]
struct PoolCounters {
    acquires: AtomicU64,
    releases: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
}

/// Point-in-time snapshot of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live entries (addresses with a channel installed).
    pub entries: usize,
    /// Sum of refcounts across all entries.
    pub total_refcount: usize,
    /// `host:port` → refcount.
    pub per_address_refcount: BTreeMap<String, usize>,
    /// Channels built since the pool was created.
    pub channels_created: u64,
    /// Channels closed by the pool (replacement, force-close, eviction, shutdown).
    pub channels_closed: u64,
    /// `acquire` calls, including failed ones.
    pub acquires: u64,
    /// `release` calls, including no-ops.
    pub releases: u64,
}

/// Shared registry of pooled channels, keyed by [`Address`].
///
/// Constructed once and passed around as `Arc<ChannelPool>`; call
/// [`shutdown`](Self::shutdown) to close everything explicitly.
pub struct ChannelPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: DashMap<Address, Arc<AddressSlot>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    counters: PoolCounters,
}

impl ChannelPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            counters: PoolCounters::default(),
        })
    }

    /// Pool with [`PoolConfig::default`].
    pub fn with_connector(connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::new(connector, PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn slot(&self, address: &Address) -> Arc<AddressSlot> {
        if let Some(slot) = self.slots.get(address) {
            return slot.value().clone();
        }
        self.slots.entry(address.clone()).or_default().value().clone()
    }

    fn existing_slot(&self, address: &Address) -> Option<Arc<AddressSlot>> {
        self.slots.get(address).map(|s| s.value().clone())
    }

    /// Return a healthy channel for `address`, building one if needed.
    ///
    /// A healthy existing entry is reused and its refcount incremented. An
    /// absent or unhealthy entry is replaced: the stale channel is closed and
    /// a fresh one installed with refcount 1. Refcounts held on the stale
    /// channel are dropped with it.
    pub async fn acquire(&self, address: &Address) -> Result<ChannelHandle, PoolError> {
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(address);
        let _gate = slot.gate.lock().await;

        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        {
            let mut guard = slot.entry.lock().unwrap();
            if let Some(entry) = guard.as_mut() {
                let state = entry.handle.state();
                if state.is_healthy() {
                    entry.refcount += 1;
                    entry.idle_since = None;
                    tracing::debug!(
                        address = %address,
                        channel = %entry.handle.id(),
                        refcount = entry.refcount,
                        "reusing pooled channel"
                    );
                    return Ok(entry.handle.clone());
                }
            }
            if let Some(stale) = guard.take() {
                tracing::warn!(
                    address = %address,
                    channel = %stale.handle.id(),
                    state = %stale.handle.state(),
                    refcount = stale.refcount,
                    age_ms = stale.created_at.elapsed().as_millis() as u64,
                    "replacing unhealthy channel"
                );
                stale.handle.close();
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let handle = self.open(address).await?;
        *slot.entry.lock().unwrap() = Some(PooledEntry::new(handle.clone()));
        Ok(handle)
    }

    async fn open(&self, address: &Address) -> Result<ChannelHandle, PoolError> {
        let timeout = self.config.connect_timeout;
        let channel = tokio::time::timeout(timeout, self.connector.connect(address))
            .await
            .map_err(|_| PoolError::ConnectTimeout {
                address: address.to_string(),
                ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| {
                tracing::warn!(address = %address, error = %e, "channel connect failed");
                e
            })?;

        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(address = %address, channel = %id, "channel created");
        Ok(ChannelHandle::new(id, channel))
    }

    /// Drop one reference to the entry at `address`.
    ///
    /// Never closes the channel: an entry at refcount 0 stays pooled until
    /// evicted or force-closed. Releasing an address with no references is
    /// logged and ignored.
    pub fn release(&self, address: &Address) {
        self.release_matching(address, None);
    }

    /// Like [`release`](Self::release), but only if the pooled entry is still
    /// the channel behind `handle`. A borrower whose channel was replaced or
    /// force-closed must not decrement its successor's refcount.
    pub fn release_handle(&self, handle: &ChannelHandle) {
        self.release_matching(handle.address(), Some(handle.id()));
    }

    fn release_matching(&self, address: &Address, id: Option<ChannelId>) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        let Some(slot) = self.existing_slot(address) else {
            tracing::debug!(address = %address, "release for unknown address ignored");
            return;
        };

        let mut guard = slot.entry.lock().unwrap();
        let Some(entry) = guard.as_mut() else {
            return;
        };
        if id.is_some_and(|id| id != entry.handle.id()) {
            tracing::debug!(address = %address, "release for superseded channel ignored");
            return;
        }
        if entry.refcount == 0 {
            tracing::warn!(address = %address, "release with refcount already 0");
            return;
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entry.idle_since = Some(Instant::now());
        }
        tracing::debug!(address = %address, refcount = entry.refcount, "released channel");
    }

    /// Close and remove the entry at `address` regardless of its refcount.
    ///
    /// Every client sharing the channel will see `Shutdown` on its next check
    /// and reconnect. Returns `true` if an entry was removed.
    pub async fn force_close(&self, address: &Address) -> bool {
        let Some(slot) = self.existing_slot(address) else {
            return false;
        };
        let _gate = slot.gate.lock().await;
        let removed = slot.entry.lock().unwrap().take();
        match removed {
            Some(entry) => {
                tracing::warn!(
                    address = %address,
                    channel = %entry.handle.id(),
                    refcount = entry.refcount,
                    "force-closing pooled channel"
                );
                entry.handle.close();
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Close entries that have sat at refcount 0 for at least `max_idle`.
    ///
    /// Addresses whose gate is busy are skipped this round. Returns the
    /// number of channels closed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let slots: Vec<(Address, Arc<AddressSlot>)> = self
            .slots
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();

        let mut evicted = 0;
        for (address, slot) in slots {
            let Ok(_gate) = slot.gate.try_lock() else {
                continue;
            };
            let mut guard = slot.entry.lock().unwrap();
            let expired = guard.as_ref().is_some_and(|e| {
                e.refcount == 0 && e.idle_since.is_some_and(|t| t.elapsed() >= max_idle)
            });
            if expired {
                if let Some(entry) = guard.take() {
                    tracing::info!(address = %address, channel = %entry.handle.id(), "evicting idle channel");
                    entry.handle.close();
                    self.counters.closed.fetch_add(1, Ordering::Relaxed);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Start the background evictor if `eviction_interval` is configured.
    ///
    /// The task holds only a weak reference and exits once the pool is
    /// dropped or shut down.
    pub fn spawn_evictor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.eviction_interval?;
        let idle_timeout = self.config.idle_timeout;
        let weak: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                if pool.is_shut_down() {
                    return;
                }
                let n = pool.evict_idle(idle_timeout).await;
                if n > 0 {
                    tracing::debug!(evicted = n, "idle eviction pass");
                }
            }
        }))
    }

    /// Close every channel and refuse further acquires. Idempotent.
    ///
    /// Returns the number of channels closed by this call.
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let slots: Vec<Arc<AddressSlot>> = self.slots.iter().map(|kv| kv.value().clone()).collect();

        let mut closed = 0;
        for slot in slots {
            let _gate = slot.gate.lock().await;
            let taken = slot.entry.lock().unwrap().take();
            if let Some(entry) = taken {
                entry.handle.close();
                closed += 1;
            }
        }
        self.counters.closed.fetch_add(closed as u64, Ordering::Relaxed);
        tracing::info!(closed, "channel pool shut down");
        closed
    }

    /// Snapshot of entries, refcounts and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            channels_created: self.counters.created.load(Ordering::Relaxed),
            channels_closed: self.counters.closed.load(Ordering::Relaxed),
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for kv in self.slots.iter() {
            if let Some(entry) = kv.value().entry.lock().unwrap().as_ref() {
                stats.entries += 1;
                stats.total_refcount += entry.refcount;
                stats
                    .per_address_refcount
                    .insert(kv.key().to_string(), entry.refcount);
            }
        }
        stats
    }

    /// Current refcount at `address`, if an entry exists.
    pub fn refcount(&self, address: &Address) -> Option<usize> {
        let slot = self.existing_slot(address)?;
        let refcount = slot.entry.lock().unwrap().as_ref().map(|e| e.refcount);
        refcount
    }

    /// State of the pooled channel at `address`, if an entry exists.
    pub fn entry_state(&self, address: &Address) -> Option<ChannelState> {
        let slot = self.existing_slot(address)?;
        let state = slot.entry.lock().unwrap().as_ref().map(|e| e.handle.state());
        state
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("addresses", &self.slots.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;

    fn addr() -> Address {
        Address::new("svc-a", 50051)
    }

    fn pool_with(connector: Arc<MockConnector>) -> Arc<ChannelPool> {
        ChannelPool::new(connector, PoolConfig::default())
    }

    #[tokio::test]
    async fn acquire_reuses_healthy_entry() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());

        let a = pool.acquire(&addr()).await.unwrap();
        let b = pool.acquire(&addr()).await.unwrap();

        assert!(a.same_channel(&b));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.refcount(&addr()), Some(2));
    }

    #[tokio::test]
    async fn acquire_replaces_unhealthy_entry() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());

        let first = pool.acquire(&addr()).await.unwrap();
        connector.last_channel().unwrap().set_state(ChannelState::TransientFailure);

        let second = pool.acquire(&addr()).await.unwrap();
        assert!(!first.same_channel(&second));
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.channels()[0].close_count(), 1);
        assert_eq!(pool.refcount(&addr()), Some(1));
        assert_eq!(pool.stats().channels_closed, 1);
    }

    #[tokio::test]
    async fn release_never_closes() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());

        let h = pool.acquire(&addr()).await.unwrap();
        pool.release(&addr());
        pool.release(&addr()); // underflow is ignored

        assert_eq!(pool.refcount(&addr()), Some(0));
        assert!(h.is_healthy());
        assert_eq!(connector.last_channel().unwrap().close_count(), 0);

        // idle entry is reused, not rebuilt
        let again = pool.acquire(&addr()).await.unwrap();
        assert!(h.same_channel(&again));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn release_handle_ignores_superseded_channel() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());

        let old = pool.acquire(&addr()).await.unwrap();
        assert!(pool.force_close(&addr()).await);
        let _new = pool.acquire(&addr()).await.unwrap();

        pool.release_handle(&old);
        assert_eq!(pool.refcount(&addr()), Some(1));
    }

    #[tokio::test]
    async fn force_close_removes_entry() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());

        let h = pool.acquire(&addr()).await.unwrap();
        let _h2 = pool.acquire(&addr()).await.unwrap();
        assert!(pool.force_close(&addr()).await);

        assert_eq!(h.state(), ChannelState::Shutdown);
        assert_eq!(pool.refcount(&addr()), None);
        assert!(!pool.force_close(&addr()).await);
        assert!(!pool.force_close(&Address::new("other", 1)).await);
    }

    #[tokio::test]
    async fn connect_failure_leaves_no_entry() {
        let connector = Arc::new(MockConnector::new());
        connector.set_failing(true);
        let pool = pool_with(connector.clone());

        let err = pool.acquire(&addr()).await.unwrap_err();
        assert!(matches!(err, PoolError::Connection { .. }));
        assert_eq!(pool.stats().entries, 0);

        connector.set_failing(false);
        pool.acquire(&addr()).await.unwrap();
        assert_eq!(pool.refcount(&addr()), Some(1));
    }

    #[tokio::test]
    async fn connect_timeout_surfaces_as_error() {
        let connector = Arc::new(MockConnector::with_delay(Duration::from_millis(200)));
        let pool = ChannelPool::new(
            connector,
            PoolConfig {
                connect_timeout: Duration::from_millis(20),
                ..PoolConfig::default()
            },
        );
        let err = pool.acquire(&addr()).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectTimeout { ms: 20, .. }));
        assert_eq!(pool.stats().entries, 0);
    }

    #[tokio::test]
    async fn evict_idle_only_touches_zero_refcount() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());
        let busy = Address::new("busy", 1);
        let idle = Address::new("idle", 1);

        pool.acquire(&busy).await.unwrap();
        pool.acquire(&idle).await.unwrap();
        pool.release(&idle);

        assert_eq!(pool.evict_idle(Duration::ZERO).await, 1);
        assert_eq!(pool.refcount(&idle), None);
        assert_eq!(pool.refcount(&busy), Some(1));
    }

    #[tokio::test]
    async fn evict_idle_respects_max_idle() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector);
        pool.acquire(&addr()).await.unwrap();
        pool.release(&addr());
        assert_eq!(pool.evict_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(pool.refcount(&addr()), Some(0));
    }

    #[tokio::test]
    async fn evictor_disabled_by_default() {
        let pool = pool_with(Arc::new(MockConnector::new()));
        assert!(pool.spawn_evictor().is_none());
    }

    #[tokio::test]
    async fn evictor_runs_on_interval() {
        let pool = ChannelPool::new(
            Arc::new(MockConnector::new()),
            PoolConfig {
                eviction_interval: Some(Duration::from_millis(10)),
                idle_timeout: Duration::ZERO,
                ..PoolConfig::default()
            },
        );
        let task = pool.spawn_evictor().unwrap();
        pool.acquire(&addr()).await.unwrap();
        pool.release(&addr());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.refcount(&addr()), None);
        task.abort();
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone());
        pool.acquire(&Address::new("a", 1)).await.unwrap();
        pool.acquire(&Address::new("b", 2)).await.unwrap();

        assert_eq!(pool.shutdown().await, 2);
        assert_eq!(pool.shutdown().await, 0);
        assert!(connector.channels().iter().all(|c| c.close_count() == 1));
        assert!(matches!(pool.acquire(&addr()).await, Err(PoolError::ShutDown)));
        assert_eq!(pool.stats().entries, 0);
    }

    #[tokio::test]
    async fn stats_reports_per_address() {
        let pool = pool_with(Arc::new(MockConnector::new()));
        pool.acquire(&Address::new("a", 1)).await.unwrap();
        pool.acquire(&Address::new("a", 1)).await.unwrap();
        pool.acquire(&Address::new("b", 2)).await.unwrap();

        let s = pool.stats();
        assert_eq!(s.entries, 2);
        assert_eq!(s.total_refcount, 3);
        assert_eq!(s.per_address_refcount.get("a:1"), Some(&2));
        assert_eq!(s.per_address_refcount.get("b:2"), Some(&1));
        assert_eq!(s.channels_created, 2);
        assert_eq!(s.acquires, 3);
    }
}
