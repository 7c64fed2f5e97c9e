#![cfg(feature = "in-memory-comm")]

use std::{sync::Arc, time::Duration};

use rpc_bridge::{
    comm::{memory, new_comm},
    driver::ConnectionBuilder,
    message::value_token,
    rpc::{self, is_client_begin, is_client_end, REQUEST_ID_KEY, RESPONSE_ADDRESS_KEY},
    CommConfig, CommError, CommMessage, Communicator, DriverError, RequestDriver,
    RequestDriverConfig, RunState,
};
use serde_json::json;

use crate::shared::{drain, init_tracing, recv_one, wait_until, PATIENCE, POLL};

mod shared;

struct Rig {
    driver: RequestDriver,
    client: Arc<dyn Communicator>,
    server: Arc<dyn Communicator>,
}

fn rig(name: &str, clients: &[&str], client_reply: Option<CommConfig>) -> Rig {
    let builder = ConnectionBuilder::new(name)
        .with_input(CommConfig::recv(format!("{name}.requests"), memory::KIND))
        .with_output(CommConfig::send(format!("{name}.server"), memory::KIND))
        .with_input_models(clients.iter().copied())
        .with_poll_timeout(POLL);

    let driver = RequestDriver::from_builder(builder, None, client_reply).unwrap();
    let client = new_comm(driver.producer_configs().remove(0)).unwrap();
    let server = new_comm(driver.consumer_configs().remove(0)).unwrap();

    Rig { driver, client, server }
}

fn reply_inbox(name: &str) -> Arc<dyn Communicator> {
    new_comm(CommConfig::recv(name, memory::KIND)).unwrap()
}

fn request(model: &str, inbox: &dyn Communicator, payload: &'static str) -> CommMessage {
    CommMessage::new(payload)
        .set("model", model)
        .set(RESPONSE_ADDRESS_KEY, inbox.address())
        .set("commtype", inbox.kind())
}

#[test]
fn ping_pong() {
    init_tracing();

    let Rig { driver, client, server } = rig("ping", &["client"], None);
    let inbox = reply_inbox("client.inbox");
    driver.start().unwrap();

    let begin = recv_one(&*server);
    assert!(is_client_begin(&begin));
    assert_eq!(begin.model(), Some("client"));

    client.send(&request("client", &*inbox, "ping").set(REQUEST_ID_KEY, 42)).unwrap();

    let req = recv_one(&*server);
    assert_eq!(req.payload, "ping");
    assert_eq!(req.model(), Some("client"));
    assert_eq!(req.header[REQUEST_ID_KEY], 42);
    assert_eq!(req.header_str("commtype"), Some(memory::KIND));
    assert_ne!(req.header_str(RESPONSE_ADDRESS_KEY), Some(inbox.address()));

    // Keyed by the client's own route, not the rewritten one.
    assert!(driver.has_route(inbox.address(), "42"));
    assert_eq!(driver.is_route_alive(inbox.address(), "42"), Some(true));

    rpc::reply_to(&req, CommMessage::new("pong")).unwrap();

    let reply = recv_one(&*inbox);
    assert_eq!(reply.payload, "pong");
    assert_eq!(reply.header[REQUEST_ID_KEY], 42);

    wait_until("route pruning", || driver.n_response_drivers() == 0);

    client.send_eof("client").unwrap();
    let end = recv_one(&*server);
    assert!(is_client_end(&end));
    assert_eq!(end.model(), Some("client"));
    assert!(recv_one(&*server).is_eof());

    assert!(driver.wait(PATIENCE));
    assert_eq!(driver.state(), RunState::Closed);
}

#[test]
fn server_sees_one_eof_after_last_client() {
    init_tracing();

    let Rig { driver, client, server } = rig("clients", &[], None);
    let inbox = reply_inbox("clients.inbox");
    driver.start().unwrap();

    for model in ["B", "A", "C"] {
        client.send(&request(model, &*inbox, "hello")).unwrap();
    }

    for model in ["B", "A", "C"] {
        let begin = recv_one(&*server);
        assert!(is_client_begin(&begin), "{begin:?}");
        assert_eq!(begin.model(), Some(model));

        let req = recv_one(&*server);
        assert_eq!(req.payload, "hello");
        assert_eq!(req.model(), Some(model));
    }

    let mut clients = driver.clients();
    clients.sort();
    assert_eq!(clients, ["A", "B", "C"]);

    client.send_eof("B").unwrap();
    client.send_eof("A").unwrap();

    for model in ["B", "A"] {
        let end = recv_one(&*server);
        assert!(is_client_end(&end));
        assert_eq!(end.model(), Some(model));
    }

    assert!(drain(&*server, Duration::from_millis(100)).is_empty());
    assert_eq!(driver.clients(), ["C"]);
    assert_eq!(driver.state(), RunState::Open);

    client.send_eof("C").unwrap();

    let rest = drain(&*server, Duration::from_millis(200));
    assert_eq!(rest.len(), 2, "{rest:?}");
    assert!(is_client_end(&rest[0]));
    assert!(rest[1].is_eof());

    assert!(driver.wait(PATIENCE));
}

#[test]
fn header_route_takes_precedence() {
    init_tracing();

    let fallback = reply_inbox("precedence.fallback");
    let cfg = fallback.opposite_endpoint_config();
    let Rig { driver, client, server } = rig("precedence", &["client"], Some(cfg));
    let inbox = reply_inbox("precedence.inbox");
    driver.start().unwrap();
    assert!(is_client_begin(&recv_one(&*server)));

    client.send(&request("client", &*inbox, "routed").set(REQUEST_ID_KEY, 42)).unwrap();
    client.send(&CommMessage::new("unrouted").set("model", "client")).unwrap();

    let routed = recv_one(&*server);
    let unrouted = recv_one(&*server);
    assert_eq!(unrouted.payload, "unrouted");

    assert!(driver.has_route(inbox.address(), "42"));
    assert!(!driver.has_route(fallback.address(), "42"));

    let generated = value_token(&unrouted.header[REQUEST_ID_KEY]);
    assert!(driver.has_route(fallback.address(), &generated));
    assert_eq!(driver.n_response_drivers(), 2);

    rpc::reply_to(&unrouted, CommMessage::new("to fallback")).unwrap();
    rpc::reply_to(&routed, CommMessage::new("to inbox")).unwrap();

    assert_eq!(recv_one(&*fallback).payload, "to fallback");
    assert_eq!(recv_one(&*inbox).payload, "to inbox");
    wait_until("route pruning", || driver.n_response_drivers() == 0);
}

#[test]
fn request_without_route_is_dropped() {
    init_tracing();

    let Rig { driver, client, server } = rig("no-route", &[], None);
    let inbox = reply_inbox("no-route.inbox");
    driver.start().unwrap();

    client.send(&CommMessage::new("lost").set("model", "m")).unwrap();
    client.send(&request("m", &*inbox, "found")).unwrap();

    let got = drain(&*server, Duration::from_millis(200));
    let payloads: Vec<_> = got.iter().filter(|m| !m.is_raw()).map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, ["found"]);

    assert_eq!(driver.state(), RunState::Open);
    assert_eq!(driver.n_response_drivers(), 1);
}

#[test]
fn unsent_request_leaves_no_route() -> anyhow::Result<()> {
    init_tracing();

    let def = json!({"typename": "scalar", "subtype": "int", "precision": 16});
    let server_cfg = CommConfig::send("unsent.server", memory::KIND)
        .with_typedef(def.as_object().cloned().unwrap_or_default());
    let builder = ConnectionBuilder::new("unsent")
        .with_input(CommConfig::recv("unsent.requests", memory::KIND))
        .with_output(server_cfg)
        .with_poll_timeout(POLL);

    let driver = RequestDriver::from_builder(builder, None, None)?;
    let client = new_comm(driver.producer_configs().remove(0))?;
    let server = new_comm(driver.consumer_configs().remove(0))?;
    let inbox = reply_inbox("unsent.inbox");
    driver.start()?;

    let scalar = |payload, id: u32, precision: u32| {
        request("client", &*inbox, payload)
            .set(REQUEST_ID_KEY, id)
            .set("typename", "scalar")
            .set("subtype", "int")
            .set("precision", precision)
    };

    // Wider than the server channel accepts; each one is refused on the way out.
    for id in 0..5 {
        client.send(&scalar("wide", id, 64))?;
    }
    client.send(&scalar("narrow", 5, 8))?;

    let got: Vec<_> = drain(&*server, Duration::from_millis(200))
        .into_iter()
        .filter(|m| !m.is_raw())
        .collect();
    assert_eq!(got.len(), 1, "{got:?}");
    assert_eq!(got[0].payload, "narrow");

    for id in 0..5 {
        assert!(!driver.has_route(inbox.address(), &id.to_string()));
    }
    assert!(driver.has_route(inbox.address(), "5"));
    assert_eq!(driver.n_response_drivers(), 1);
    assert_eq!(driver.state(), RunState::Open);

    driver.terminate();
    assert!(driver.wait(PATIENCE));
    Ok(())
}

#[test]
fn repeated_request_id_replaces_the_route() -> anyhow::Result<()> {
    init_tracing();

    let Rig { driver, client, server } = rig("replace", &["client"], None);
    let inbox = reply_inbox("replace.inbox");
    driver.start()?;
    assert!(is_client_begin(&recv_one(&*server)));

    client.send(&request("client", &*inbox, "first").set(REQUEST_ID_KEY, 7))?;
    client.send(&request("client", &*inbox, "second").set(REQUEST_ID_KEY, 7))?;

    let first = recv_one(&*server);
    let second = recv_one(&*server);
    assert_eq!(second.payload, "second");
    assert_ne!(first.header_str(RESPONSE_ADDRESS_KEY), second.header_str(RESPONSE_ADDRESS_KEY));
    assert_eq!(driver.n_response_drivers(), 1);

    rpc::reply_to(&first, CommMessage::new("stale"))?;
    rpc::reply_to(&second, CommMessage::new("fresh"))?;

    let replies = drain(&*inbox, Duration::from_millis(200));
    let payloads: Vec<_> = replies.iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, ["fresh"]);

    wait_until("route pruning", || driver.n_response_drivers() == 0);
    Ok(())
}

#[test]
fn unusable_reply_route_is_dropped() {
    let Rig { driver, client, server } = rig("bad-route", &[], None);
    driver.start().unwrap();

    let bogus = CommMessage::new("nowhere")
        .set(RESPONSE_ADDRESS_KEY, "somewhere")
        .set("commtype", "carrier-pigeon");
    client.send(&bogus).unwrap();

    assert!(drain(&*server, Duration::from_millis(200)).is_empty());
    assert_eq!(driver.n_response_drivers(), 0);
    assert_eq!(driver.state(), RunState::Open);
}

#[test]
fn closing_terminates_pending_routes() {
    init_tracing();

    let Rig { driver, client, server } = rig("pending", &["client"], None);
    let inbox = reply_inbox("pending.inbox");
    driver.start().unwrap();

    for id in 0..3 {
        client.send(&request("client", &*inbox, "unanswered").set(REQUEST_ID_KEY, id)).unwrap();
    }

    wait_until("every route", || driver.n_response_drivers() == 3);
    let reqs: Vec<_> = drain(&*server, Duration::from_millis(100))
        .into_iter()
        .filter(|m| !m.is_raw())
        .collect();
    assert_eq!(reqs.len(), 3);

    driver.terminate();
    assert!(driver.wait(PATIENCE));
    assert_eq!(driver.n_response_drivers(), 0);

    // The route's input is gone; a late reply lands nowhere.
    let late = rpc::reply_to(&reqs[0], CommMessage::new("late"));
    assert!(late.is_ok());
    assert!(drain(&*inbox, Duration::from_millis(50)).is_empty());
}

#[test]
fn close_blocks_new_routes() {
    let Rig { driver, client, server } = rig("blocked", &[], None);
    let inbox = reply_inbox("blocked.inbox");
    driver.start().unwrap();

    assert_eq!(driver.close_response_drivers(), 0);
    client.send(&request("m", &*inbox, "too late")).unwrap();

    let got = drain(&*server, Duration::from_millis(200));
    assert!(got.iter().all(|m| m.is_raw()), "{got:?}");
    assert_eq!(driver.n_response_drivers(), 0);
}

#[test]
fn reply_needs_a_route() {
    let err = rpc::reply_to(&CommMessage::new("req"), CommMessage::new("rep")).unwrap_err();
    assert!(matches!(err, CommError::Config(_)));
}

#[test]
fn request_driver_needs_one_output() {
    let builder = ConnectionBuilder::new("two-outputs")
        .with_input(CommConfig::recv("in", memory::KIND))
        .with_output(CommConfig::send("out.0", memory::KIND))
        .with_output(CommConfig::send("out.1", memory::KIND));

    let err = RequestDriver::from_builder(builder, None, None).unwrap_err();
    assert!(matches!(err, DriverError::Config(_)));
}

#[test]
fn config_is_flattened() {
    let cfg: RequestDriverConfig = serde_json::from_value(json!({
        "name": "from-json",
        "inputs": [{"name": "in", "commtype": "memory", "direction": "recv"}],
        "outputs": [{"name": "out", "commtype": "memory", "direction": "send"}],
        "poll_timeout_ms": 10,
        "response": {"name": "response", "commtype": "memory", "direction": "recv"},
    }))
    .unwrap();

    assert_eq!(cfg.driver.poll_timeout(), Duration::from_millis(10));
    assert!(cfg.client_reply.is_none());

    let driver = RequestDriver::new(cfg).unwrap();
    assert_eq!(driver.name(), "from-json");
    assert_eq!(driver.n_clients(), 0);
}
