//! In-process transport.
//!
//! Endpoints sharing an address share one unbounded channel held in a process-wide address book.
//! The address stays registered while at least one endpoint on it is open; endpoints keep their
//! channel alive after closing, so confirmations remain queryable.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{select, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{CommConfig, Communicator, Direction};
use crate::error::CommError;

pub const KIND: &str = "memory";

/// In-process comm endpoint.
pub struct MemoryComm {
    config: CommConfig,
    address: String,
    channel: Arc<Channel>,
    is_open: AtomicBool,

    /// Dropping the sender wakes a receive blocked on this endpoint.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

struct Channel {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,

    /// Serializes multi-frame writes.
    write_lock: Mutex<()>,

    n_sent: AtomicU64,
    n_recv: AtomicU64,

    /// Open endpoints on this address.
    n_open: AtomicUsize,
}

fn address_book() -> &'static Mutex<HashMap<String, Arc<Channel>>> {
    static BOOK: OnceLock<Mutex<HashMap<String, Arc<Channel>>>> = OnceLock::new();
    BOOK.get_or_init(Default::default)
}

fn new_address() -> String {
    format!("{KIND}-{:016x}", rand::random::<u64>())
}

// ========================================================== MemoryComm ===|

impl MemoryComm {
    /// Creates an unopened endpoint. A missing address is allocated here, so
    /// [`Communicator::opposite_endpoint_config`] is usable before `open`.
    pub fn new(config: CommConfig) -> Self {
        let address = config.address.clone().unwrap_or_else(new_address);
        let channel = address_book()
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone();

        let (close_tx, close_rx) = crossbeam_channel::bounded(0);

        Self {
            config,
            address,
            channel,
            is_open: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    /// [`CommConstructor`](super::CommConstructor) of this transport.
    pub fn construct(config: CommConfig) -> Result<Arc<dyn Communicator>, CommError> {
        Ok(Arc::new(Self::new(config)))
    }

    /// Total frames ever pushed to this endpoint's address.
    pub fn n_sent_total(&self) -> u64 {
        self.channel.n_sent.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), CommError> {
        if self.is_open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CommError::Closed)
        }
    }
}

impl Communicator for MemoryComm {
    fn config(&self) -> &CommConfig {
        &self.config
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn open(&self) -> Result<(), CommError> {
        if self.close_tx.lock().is_none() {
            return Err(CommError::Fatal("memory comm can't be reopened after close".into()));
        }
        if self.is_open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Re-register if every other endpoint closed in between.
        let mut book = address_book().lock();
        book.entry(self.address.clone()).or_insert_with(|| self.channel.clone());
        self.channel.n_open.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    fn close(&self) {
        let Some(close_tx) = self.close_tx.lock().take() else { return };
        drop(close_tx);

        let mut book = address_book().lock();
        let was_open = self.is_open.swap(false, Ordering::AcqRel);
        let remaining = if was_open {
            self.channel.n_open.fetch_sub(1, Ordering::AcqRel) - 1
        } else {
            self.channel.n_open.load(Ordering::Acquire)
        };

        // Only drop the entry if it's still ours.
        let ours = book.get(&self.address).is_some_and(|x| Arc::ptr_eq(x, &self.channel));
        if remaining == 0 && ours {
            book.remove(&self.address);
        }
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), CommError> {
        self.send_frames(vec![frame])
    }

    fn send_frames(&self, frames: Vec<Bytes>) -> Result<(), CommError> {
        self.ensure_open()?;
        if self.config.direction != Direction::Send {
            return Err(CommError::Config("can't send on a receiving comm".into()));
        }

        let _guard = self.channel.write_lock.lock();
        for frame in frames {
            self.channel.n_sent.fetch_add(1, Ordering::AcqRel);
            // The channel owns its receiver, so it can't be disconnected while we hold it.
            if self.channel.tx.send(frame).is_err() {
                self.channel.n_sent.fetch_sub(1, Ordering::AcqRel);
                return Err(CommError::Fatal("memory channel disconnected".into()));
            }
        }

        Ok(())
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Bytes, CommError> {
        self.ensure_open()?;
        if self.config.direction != Direction::Recv {
            return Err(CommError::Config("can't receive on a sending comm".into()));
        }

        select! {
            recv(self.channel.rx) -> frame => {
                let frame = frame
                    .map_err(|_| CommError::Fatal("memory channel disconnected".into()))?;
                self.channel.n_recv.fetch_add(1, Ordering::AcqRel);
                Ok(frame)
            }
            recv(self.close_rx) -> _ => Err(CommError::Closed),
            default(timeout) => Err(CommError::NoMessages),
        }
    }

    fn n_msg(&self) -> usize {
        self.channel.rx.len()
    }

    fn is_confirmed_send(&self) -> bool {
        self.channel.n_recv.load(Ordering::Acquire) >= self.channel.n_sent.load(Ordering::Acquire)
    }

    fn is_confirmed_recv(&self) -> bool {
        self.channel.rx.is_empty()
    }
}

impl Drop for MemoryComm {
    fn drop(&mut self) {
        self.close();
    }
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            write_lock: Mutex::new(()),
            n_sent: AtomicU64::new(0),
            n_recv: AtomicU64::new(0),
            n_open: AtomicUsize::new(0),
        }
    }
}
