#![cfg(feature = "in-memory-comm")]

use std::time::Duration;

use bytes::Bytes;
use rpc_bridge::{
    comm::{cleanup_comms, memory, new_comm, register_comm_kind, MemoryComm},
    envelope,
    types::{Scalar, ScalarType, TypedSerializer},
    CommConfig, CommError, CommMessage, Communicator, Direction, ErrorKind, Flag, Header,
    TypeCodec, TypeError,
};
use serde_json::json;

use crate::shared::{init_tracing, memory_pair, recv_one, POLL};

mod shared;

#[test]
fn send_and_receive() {
    init_tracing();
    let (tx, rx) = memory_pair("basic");

    tx.send(&CommMessage::new("hello").set("model", "a")).unwrap();
    let msg = recv_one(&*rx);

    assert_eq!(msg.flag, Flag::Success);
    assert_eq!(msg.payload, "hello");
    assert_eq!(msg.model(), Some("a"));
    assert!(tx.is_confirmed_send());
    assert!(rx.is_confirmed_recv());
}

#[test]
fn timeout_yields_empty_message() {
    let (_tx, rx) = memory_pair("quiet");
    let msg = rx.recv(Duration::from_millis(10)).unwrap();

    assert!(msg.is_empty());
}

#[test]
fn eof_carries_the_model() {
    let (tx, rx) = memory_pair("eof");
    tx.send_eof("producer").unwrap();

    let msg = recv_one(&*rx);
    assert!(msg.is_eof());
    assert_eq!(msg.model(), Some("producer"));
    assert!(msg.payload.is_empty());
}

#[test]
fn large_messages_are_chunked() {
    init_tracing();
    let (tx, rx) = memory_pair("chunked");

    let payload: Bytes = (0..40_000u32).flat_map(|x| x.to_le_bytes()).collect::<Vec<_>>().into();
    let msg = CommMessage::new(payload.clone()).set("model", "big");

    assert!(matches!(tx.send(&msg), Err(CommError::Oversized { .. })));

    tx.send_chunked(&msg).unwrap();
    assert!(rx.n_msg() > 1);

    let got = rx.recv_chunked(POLL).unwrap();
    assert_eq!(got.payload, payload);
    assert_eq!(got.model(), Some("big"));
    assert!(!got.header.contains_key("chunked"));
    assert!(!got.header.contains_key("size"));
}

#[test]
fn truncated_chunked_message_is_fatal() {
    let (tx, rx) = memory_pair("truncated");
    let small = CommConfig::send("small", memory::KIND)
        .with_address(rx.address())
        .with_max_msg_size(256);
    let small = new_comm(small).unwrap();

    small.send_chunked(&CommMessage::new(vec![7u8; 1024])).unwrap();

    // Drop the tail frames on the floor by reading only the head through a raw receive.
    let head = rx.recv_frame(POLL).unwrap();
    while rx.recv_frame(Duration::from_millis(5)).is_ok() {}
    tx.send_frame(head).unwrap();

    let err = rx.recv_chunked(Duration::from_millis(20)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[test]
fn impossible_chunk_size_is_rejected() -> anyhow::Result<()> {
    let (tx, rx) = memory_pair("impossible");

    let mut header = Header::new();
    header.insert("chunked".into(), true.into());
    header.insert("size".into(), u64::MAX.into());
    tx.send_frame(envelope::encode(&header, b"abc")?)?;

    let err = rx.recv_chunked(POLL).unwrap_err();
    assert!(matches!(err, CommError::Type(TypeError::MalformedData(_))), "{err}");
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);

    // Announcing less than the first frame already carries is just as wrong.
    header.insert("size".into(), 1.into());
    tx.send_frame(envelope::encode(&header, b"abc")?)?;
    assert_eq!(rx.recv_chunked(POLL).unwrap_err().kind(), ErrorKind::TypeMismatch);

    tx.send(&CommMessage::new("after"))?;
    assert_eq!(recv_one(&*rx).payload, "after");
    Ok(())
}

#[test]
fn closed_comm_refuses_io() {
    let (tx, rx) = memory_pair("closed");
    tx.close();
    tx.close();

    assert!(tx.is_closed());
    assert!(matches!(tx.send(&CommMessage::new("x")), Err(CommError::Closed)));
    assert!(tx.open().is_err());

    rx.close();
    assert_eq!(rx.recv(POLL).unwrap_err().kind(), ErrorKind::Fatal);
}

#[test]
fn close_unblocks_pending_receive() {
    let (_tx, rx) = memory_pair("unblock");

    let waiter = {
        let rx = rx.clone();
        std::thread::spawn(move || rx.recv_frame(Duration::from_secs(30)))
    };

    std::thread::sleep(Duration::from_millis(50));
    rx.close();

    let res = waiter.join().unwrap();
    assert!(matches!(res, Err(CommError::Closed)));
}

#[test]
fn opposite_config_pairs_endpoints() {
    let rx = new_comm(CommConfig::recv("server", memory::KIND)).unwrap();
    let cfg = rx.opposite_endpoint_config();

    assert_eq!(cfg.direction, Direction::Send);
    assert_eq!(cfg.address.as_deref(), Some(rx.address()));
    assert_eq!(cfg.kind, memory::KIND);

    let tx = new_comm(cfg).unwrap();
    tx.send(&CommMessage::new("ping")).unwrap();
    assert_eq!(recv_one(&*rx).payload, "ping");
}

#[test]
fn direction_is_enforced() {
    let (tx, rx) = memory_pair("direction");

    assert!(rx.send(&CommMessage::new("x")).is_err());
    assert!(tx.recv(POLL).is_err());
}

#[test]
fn unknown_kind_is_a_config_error() {
    let err = new_comm(CommConfig::recv("x", "carrier-pigeon")).err().unwrap();
    assert!(matches!(err, CommError::Config(_)));
}

#[test]
fn cleanup_closes_every_comm_of_a_kind() {
    const KIND: &str = "memory-cleanup-test";
    register_comm_kind(KIND, MemoryComm::construct);

    let a = new_comm(CommConfig::recv("a", KIND)).unwrap();
    let b = new_comm(CommConfig::send("b", KIND).with_address(a.address())).unwrap();
    let c = new_comm(CommConfig::recv("c", KIND).with_dont_open(true)).unwrap();

    assert!(a.is_open() && b.is_open() && !c.is_open());
    assert_eq!(cleanup_comms(Some(KIND)), 2);
    assert!(a.is_closed() && b.is_closed());
    assert_eq!(cleanup_comms(Some(KIND)), 0);
}

#[test]
fn typed_comm_rejects_mismatching_metadata() {
    init_tracing();

    let def = json!({"typename": "scalar", "subtype": "int", "precision": 16});
    let def = def.as_object().unwrap().clone();

    let rx = new_comm(CommConfig::recv("typed", memory::KIND).with_typedef(def.clone())).unwrap();
    let tx = new_comm(rx.opposite_endpoint_config()).unwrap();

    let ser = TypedSerializer::with_typedef(ScalarType, def).unwrap();
    tx.send(&ser.to_message(&Scalar::Int(1000)).unwrap()).unwrap();
    assert_eq!(ser.from_message(&recv_one(&*rx)).unwrap(), Some(Scalar::Int(1000)));

    // A 64 bit instance doesn't fit the declared 16 bits.
    let (meta, data) = ScalarType.encode(&Scalar::Int(1 << 40), None).unwrap();
    let wide = CommMessage::with_header(data, meta);
    assert_eq!(tx.send(&wide).unwrap_err().kind(), ErrorKind::TypeMismatch);

    // An untyped sender bypasses the check; the receiver still rejects it.
    let untyped =
        new_comm(CommConfig::send("untyped", memory::KIND).with_address(rx.address())).unwrap();
    untyped.send(&wide).unwrap();
    assert_eq!(rx.recv(POLL).unwrap_err().kind(), ErrorKind::TypeMismatch);

    // Raw control messages pass through.
    untyped.send(&CommMessage::new("ctl").set("raw", true).set("typename", "scalar")).unwrap();
    assert_eq!(recv_one(&*rx).payload, "ctl");
}
