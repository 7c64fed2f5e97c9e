//! Process-wide comm registry.
//!
//! Maps a transport kind to its constructor, and tracks every comm created through [`new_comm`]
//! so all comms of one kind can be closed at once. The registry is initialized on first use and
//! torn down only by an explicit [`shutdown`] call.

use std::sync::{Arc, OnceLock, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{CommConfig, Communicator, Direction};
use crate::error::CommError;

/// Builds an unopened comm from its configuration.
pub type CommConstructor = fn(CommConfig) -> Result<Arc<dyn Communicator>, CommError>;

#[derive(Default)]
struct CommRegistry {
    constructors: HashMap<String, CommConstructor>,
    live: HashMap<String, Vec<Weak<dyn Communicator>>>,
}

fn registry() -> &'static Mutex<CommRegistry> {
    static REGISTRY: OnceLock<Mutex<CommRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(CommRegistry::with_builtins()))
}

impl CommRegistry {
    fn with_builtins() -> Self {
        #[allow(unused_mut)]
        let mut this = Self::default();

        #[cfg(feature = "in-memory-comm")]
        this.constructors.insert(super::memory::KIND.into(), super::memory::MemoryComm::construct);

        this
    }
}

/// Registers a transport kind. Returns the constructor it replaced.
pub fn register_comm_kind(kind: &str, ctor: CommConstructor) -> Option<CommConstructor> {
    registry().lock().constructors.insert(kind.to_string(), ctor)
}

/// Creates a comm of `config.kind`, opening it unless `config.dont_open` is set.
pub fn new_comm(config: CommConfig) -> Result<Arc<dyn Communicator>, CommError> {
    config.validate()?;

    let ctor = registry()
        .lock()
        .constructors
        .get(&config.kind)
        .copied()
        .ok_or_else(|| CommError::Config(format!("unknown comm kind '{}'", config.kind).into()))?;

    let dont_open = config.dont_open;
    let kind = config.kind.clone();
    let comm = ctor(config)?;

    if !dont_open {
        comm.open()?;
    }

    let mut reg = registry().lock();
    let live = reg.live.entry(kind).or_default();
    live.retain(|x| x.strong_count() > 0);
    live.push(Arc::downgrade(&comm));

    Ok(comm)
}

/// Creates a comm and its opposite endpoint on the same address. Returns `(send, recv)`.
pub fn new_comm_pair(
    config: CommConfig,
) -> Result<(Arc<dyn Communicator>, Arc<dyn Communicator>), CommError> {
    let first = new_comm(config)?;
    let second = new_comm(first.opposite_endpoint_config())?;

    Ok(match first.direction() {
        Direction::Send => (first, second),
        Direction::Recv => (second, first),
    })
}

/// Closes every still-open comm of `kind`, or of every kind when `None`. Returns the number of
/// comms that were open.
pub fn cleanup_comms(kind: Option<&str>) -> usize {
    let comms: Vec<Arc<dyn Communicator>> = {
        let mut reg = registry().lock();
        let drained: Vec<_> = match kind {
            Some(kind) => reg.live.remove(kind).into_iter().flatten().collect(),
            None => reg.live.drain().flat_map(|(_, v)| v).collect(),
        };
        drained.iter().filter_map(Weak::upgrade).collect()
    };

    let mut count = 0;
    for comm in comms {
        if comm.is_open() {
            comm.close();
            count += 1;
        }
    }

    if count > 0 {
        tracing::debug!(kind = kind.unwrap_or("*"), count, "cleaned up comms");
    }

    count
}

/// Closes every tracked comm. Registered constructors stay in place.
pub fn shutdown() -> usize {
    cleanup_comms(None)
}
