#![allow(dead_code)]

use std::{
    sync::{Arc, Once},
    time::{Duration, Instant},
};

use rpc_bridge::{
    comm::{memory, new_comm_pair},
    CommConfig, CommMessage, Communicator,
};

pub const POLL: Duration = Duration::from_millis(20);
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Opened send/recv endpoints on a fresh in-memory address.
pub fn memory_pair(name: &str) -> (Arc<dyn Communicator>, Arc<dyn Communicator>) {
    new_comm_pair(CommConfig::recv(name, memory::KIND)).expect("memory pair")
}

/// Receives until a non-empty message arrives, or fails the test after [`PATIENCE`].
pub fn recv_one(comm: &dyn Communicator) -> CommMessage {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        let msg = comm.recv_chunked(POLL).expect("recv");
        if !msg.is_empty() {
            return msg;
        }
    }

    panic!("no message on '{}' within {PATIENCE:?}", comm.name());
}

/// Drains everything that arrives until the channel stays quiet for `quiet`.
pub fn drain(comm: &dyn Communicator, quiet: Duration) -> Vec<CommMessage> {
    let mut out = Vec::new();
    loop {
        let msg = comm.recv_chunked(quiet).expect("recv");
        if msg.is_empty() {
            return out;
        }
        out.push(msg);
    }
}

/// Polls `cond` until it holds, or fails the test after [`PATIENCE`].
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    panic!("timed out waiting for {what}");
}
