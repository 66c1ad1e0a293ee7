// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Node lifecycle integration tests: identity, endpoint table behavior,
//! transport loss, and shutdown draining.

use dorpc::transport::intra::IntraTransport;
use dorpc::{
    ClientEvent, ElementData, EntryType, Error, MessageElement, MessageEntry, Node, NodeId,
    Result, ServiceSkel, SkelRequest,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct SlowSkel;

impl ServiceSkel for SlowSkel {
    fn object_type(&self) -> &str {
        "experimental.lifecycle.Slow"
    }

    fn call(&self, _request: &SkelRequest<'_>, entry: &MessageEntry) -> Result<MessageEntry> {
        match entry.member_name.as_str() {
            "ping" => entry.make_response(),
            "hang" => {
                thread::sleep(Duration::from_secs(3));
                entry.make_response()
            }
            other => Err(Error::MemberNotFound(other.to_string())),
        }
    }
}

fn start_server(peer_name: &str) -> Arc<Node> {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = Node::new();
    let transport = IntraTransport::new(&node).expect("server transport");
    transport.start_server(peer_name).expect("start server");
    node.register_service("lifesvc", Arc::new(SlowSkel))
        .expect("register service");
    node
}

fn client_node() -> Arc<Node> {
    let node = Node::new();
    IntraTransport::new(&node).expect("client transport");
    node
}

fn url(peer_name: &str) -> String {
    format!("rr+intra:///?service=lifesvc&nodename={}", peer_name)
}

#[test]
fn concurrent_connects_yield_distinct_endpoint_ids() {
    let server = start_server("life_distinct");

    let client_side = client_node();
    let mut workers = Vec::new();
    for _ in 0..8 {
        let node = client_side.clone();
        workers.push(thread::spawn(move || {
            node.connect_service(&url("life_distinct")).expect("connect")
        }));
    }

    let clients: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("connect thread"))
        .collect();

    let ids: HashSet<u32> = clients.iter().map(|c| c.local_endpoint()).collect();
    assert_eq!(ids.len(), clients.len(), "endpoint ids must not collide");
    assert!(!ids.contains(&0));

    for client in clients {
        client.close().expect("close");
    }
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn connect_to_unknown_service_does_not_leak_endpoints() {
    let server = start_server("life_leak");
    let client_side = client_node();

    let err = client_side
        .connect_service("rr+intra:///?service=nosuch&nodename=life_leak")
        .expect_err("unknown service");
    assert!(matches!(err, Error::ServiceNotFound(_)));

    // The failed handshake tore the client endpoint down.
    assert_eq!(client_side.endpoint_count(), 0);

    client_side.shutdown();
    server.shutdown();
}

#[test]
fn url_pinned_node_id_is_verified() {
    let server = start_server("life_pinned");
    let client_side = client_node();

    let wrong = NodeId::random();
    let err = client_side
        .connect_service(&format!(
            "rr+intra:///?service=lifesvc&nodename=life_pinned&nodeid={}",
            wrong
        ))
        .expect_err("wrong pinned node id");
    assert!(matches!(err, Error::NodeNotFound(_)));

    // The correct id connects.
    let correct = server.node_id();
    let client = client_side
        .connect_service(&format!(
            "rr+intra:///?service=lifesvc&nodename=life_pinned&nodeid={}",
            correct
        ))
        .expect("pinned connect");
    client.close().expect("close");

    client_side.shutdown();
    server.shutdown();
}

#[test]
fn server_shutdown_fails_inflight_requests_and_notifies_client() {
    let server = start_server("life_server_down");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("life_server_down"))
        .expect("connect");

    let lost = Arc::new(AtomicU32::new(0));
    let l = Arc::clone(&lost);
    client.add_listener(move |event| {
        if event == ClientEvent::ConnectionLost {
            l.fetch_add(1, Ordering::SeqCst);
        }
    });

    let results = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&results);
    let entry = MessageEntry::with_member(EntryType::FunctionCallReq, "lifesvc", "hang");
    client.async_process_request(
        entry,
        Box::new(move |result| {
            r.lock().expect("results lock").push(result);
        }),
        None,
    );

    thread::sleep(Duration::from_millis(100));
    server.shutdown();

    // The in-flight request completes with an error, never a success.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let results = results.lock().expect("results lock");
            if !results.is_empty() {
                assert!(results[0].is_err(), "shutdown must fail in-flight requests");
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "in-flight request never completed"
        );
        thread::sleep(Duration::from_millis(10));
    }
    // The listener completion is posted independently of the request
    // completion; give it its own window.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while lost.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(lost.load(Ordering::SeqCst), 1, "connection-lost event fired once");

    client_side.shutdown();
}

#[test]
fn client_node_shutdown_drains_outstanding_with_errors() {
    let server = start_server("life_client_down");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("life_client_down"))
        .expect("connect");

    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..4 {
        let r = Arc::clone(&results);
        let entry = MessageEntry::with_member(EntryType::FunctionCallReq, "lifesvc", "hang");
        client.async_process_request(
            entry,
            Box::new(move |result| {
                r.lock().expect("results lock").push(result.map(|_| ()));
            }),
            None,
        );
    }

    thread::sleep(Duration::from_millis(50));
    client_side.shutdown();

    let results = results.lock().expect("results lock");
    assert_eq!(results.len(), 4, "every outstanding request completed");
    for result in results.iter() {
        assert!(result.is_err(), "shutdown completions carry errors");
    }
    server.shutdown();
}

#[test]
fn requests_after_close_fail_fast() {
    let server = start_server("life_after_close");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("life_after_close"))
        .expect("connect");

    client.close().expect("close");
    assert!(!client.is_connected());

    let err = client
        .function_call("lifesvc", "ping", Vec::new())
        .expect_err("closed connection");
    assert!(matches!(err, Error::InvalidOperation(_)));

    client_side.shutdown();
    server.shutdown();
}

#[test]
fn events_fan_out_to_clients() {
    let server = Node::new();
    let transport = IntraTransport::new(&server).expect("server transport");
    transport.start_server("life_events").expect("start server");
    let ctx = server
        .register_service("lifesvc", Arc::new(SlowSkel))
        .expect("register service");

    let client_side = client_node();
    let client = client_side
        .connect_service(&url("life_events"))
        .expect("connect");

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    client.add_event_listener(move |entry| {
        r.lock().expect("received lock").push((
            entry.member_name.clone(),
            entry.element("count").map(|e| e.data.clone()),
        ));
    });

    ctx.send_event(
        "lifesvc",
        "frame_ready",
        vec![MessageElement::new("count", ElementData::scalar_u32(3))],
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let received = received.lock().expect("received lock");
            if !received.is_empty() {
                assert_eq!(received[0].0, "frame_ready");
                assert_eq!(received[0].1, Some(ElementData::scalar_u32(3)));
                break;
            }
        }
        assert!(std::time::Instant::now() < deadline, "event never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn connection_test_special_request_roundtrips() {
    let server = start_server("life_conntest");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("life_conntest"))
        .expect("connect");

    let entry = MessageEntry::new(EntryType::ConnectionTest);
    let response = client.process_request(entry).expect("connection test");
    assert_eq!(response.entry_type, EntryType::ConnectionTestRet);

    let entry = MessageEntry::new(EntryType::GetNodeInfo);
    let response = client.process_request(entry).expect("node info");
    let node_id = response
        .element("nodeid")
        .expect("nodeid element")
        .data
        .as_str()
        .expect("nodeid string")
        .parse::<NodeId>()
        .expect("nodeid parses");
    assert_eq!(node_id, server.node_id());

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}
