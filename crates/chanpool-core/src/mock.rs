//! In-memory transport for tests and examples.
//!
//! `MockConnector` counts connect calls and keeps every channel it created so
//! a test can flip their states (simulating a dead connection) and assert on
//! how many channels the pool actually built.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::address::Address;
use crate::error::PoolError;
use crate::state::{AtomicChannelState, ChannelState};
use crate::transport::{Channel, Connector};

/// A channel whose state is set by hand.
#[derive(Debug)]
pub struct MockChannel {
    address: Address,
    state: AtomicChannelState,
    closes: AtomicUsize,
}

impl MockChannel {
    /// New channel in `Ready` state.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: AtomicChannelState::new(ChannelState::Ready),
            closes: AtomicUsize::new(0),
        }
    }

    /// Force the channel into `state`, bypassing the `Shutdown` latch.
    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state);
    }

    /// How many times `close()` was called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Channel for MockChannel {
    fn state(&self) -> ChannelState {
        self.state.load()
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.store(ChannelState::Shutdown);
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Connector producing [`MockChannel`]s.
#[derive(Debug, Default)]
pub struct MockConnector {
    connects: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    created: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect sleeps for `delay` before completing.
    pub fn with_delay(delay: Duration) -> Self {
        let c = Self::default();
        *c.delay.lock().unwrap() = Some(delay);
        c
    }

    /// Make subsequent connects fail with [`PoolError::Connection`].
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// All channels created so far, oldest first.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.created.lock().unwrap().clone()
    }

    /// Most recently created channel.
    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>, PoolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(PoolError::connection(address, "mock connect failure"));
        }

        let ch = Arc::new(MockChannel::new(address.clone()));
        self.created.lock().unwrap().push(ch.clone());
        Ok(ch as Arc<dyn Channel>)
    }
}
