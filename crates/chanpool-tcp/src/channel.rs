//! A TCP channel whose connectivity is tracked by a background reader task.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chanpool_core::error::PoolError;
use chanpool_core::state::{AtomicChannelState, ChannelState};
use chanpool_core::transport::Channel;
use chanpool_core::Address;

const READ_BUF: usize = 16 * 1024;

/// An established TCP connection to one backend.
///
/// Writes go through [`send`](Self::send). Inbound bytes are forwarded to the
/// receiver returned by [`take_inbound`](Self::take_inbound). Until it is
/// taken, and after it is dropped, the reader discards what it reads and
/// counts it in [`discarded_bytes`](Self::discarded_bytes).
pub struct TcpChannel {
    address: Address,
    state: Arc<AtomicChannelState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    inbound: Arc<Inbound>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Inbound {
    /// `None` until the receiver is taken.
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    taken: AtomicBool,
    discarded: AtomicU64,
}

impl Inbound {
    fn deliver(&self, bytes: &[u8]) {
        let mut tx = self.tx.lock().unwrap();
        if let Some(sender) = tx.as_ref() {
            if sender.send(bytes.to_vec()).is_ok() {
                return;
            }
            // receiver dropped
            *tx = None;
        }
        self.discarded.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
}

impl TcpChannel {
    /// Wrap a connected stream and start its reader task.
    pub fn from_stream(address: Address, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let state = Arc::new(AtomicChannelState::new(ChannelState::Ready));
        let inbound = Arc::new(Inbound::default());

        let reader = tokio::spawn(reader_task(
            address.clone(),
            read_half,
            state.clone(),
            inbound.clone(),
        ));

        Self {
            address,
            state,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            inbound,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Write `bytes` to the peer.
    ///
    /// A write failure marks the channel `TransientFailure` so the next
    /// health check replaces it.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), PoolError> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(PoolError::connection(&self.address, "channel closed"));
        };
        if let Err(e) = w.write_all(bytes).await {
            self.state.transition(ChannelState::TransientFailure);
            tracing::warn!(address = %self.address, error = %e, "TCP write failed");
            return Err(PoolError::Io(e));
        }
        Ok(())
    }

    /// Take the inbound byte stream. Only the first caller gets it; bytes
    /// read before this call are not replayed.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        if self.inbound.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.tx.lock().unwrap() = Some(tx);
        Some(rx)
    }

    /// Inbound bytes dropped because no receiver was attached.
    pub fn discarded_bytes(&self) -> u64 {
        self.inbound.discarded.load(Ordering::Relaxed)
    }
}

impl Channel for TcpChannel {
    fn state(&self) -> ChannelState {
        self.state.load()
    }

    fn close(&self) {
        if self.state.transition(ChannelState::Shutdown) == ChannelState::Shutdown {
            return;
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        // a writer mid-send keeps its half until it finishes; it is dropped
        // with the channel
        if let Ok(mut w) = self.writer.try_lock() {
            w.take();
        }
        tracing::debug!(address = %self.address, "TCP channel closed");
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("address", &self.address)
            .field("state", &self.state.load())
            .finish()
    }
}

async fn reader_task(
    address: Address,
    mut read_half: OwnedReadHalf,
    state: Arc<AtomicChannelState>,
    inbound: Arc<Inbound>,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::warn!(address = %address, "peer closed TCP connection");
                break;
            }
            Ok(n) => inbound.deliver(&buf[..n]),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "TCP read error");
                break;
            }
        }
    }
    state.transition(ChannelState::TransientFailure);
}
