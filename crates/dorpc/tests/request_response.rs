// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Request/response integration tests over two in-process nodes.

use dorpc::transport::intra::IntraTransport;
use dorpc::{
    AuthenticatedUser, ElementData, EntryType, Error, MessageElement, MessageEntry, Node,
    NodeConfig, Result, ServiceSkel, SkelRequest, UserAuthenticator,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct TestSkel {
    exposure: Mutex<ElementData>,
    generators: Mutex<HashMap<i32, i32>>,
    next_generator: AtomicU32,
}

impl TestSkel {
    fn new() -> Self {
        Self {
            exposure: Mutex::new(ElementData::scalar_i32(10)),
            generators: Mutex::new(HashMap::new()),
            next_generator: AtomicU32::new(1),
        }
    }
}

impl ServiceSkel for TestSkel {
    fn object_type(&self) -> &str {
        "experimental.testsvc.TestObject"
    }

    fn call(&self, _request: &SkelRequest<'_>, entry: &MessageEntry) -> Result<MessageEntry> {
        match (entry.entry_type, entry.member_name.as_str()) {
            (EntryType::PropertyGetReq, "exposure") => {
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "value",
                    self.exposure.lock().expect("exposure lock").clone(),
                ));
                Ok(resp)
            }
            (EntryType::PropertySetReq, "exposure") => {
                let value = entry.element_or_err("value")?.data.clone();
                *self.exposure.lock().expect("exposure lock") = value;
                entry.make_response()
            }
            (EntryType::FunctionCallReq, "add") => {
                let a = entry.element_or_err("a")?.data.as_i32()?;
                let b = entry.element_or_err("b")?.data.as_i32()?;
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "return",
                    ElementData::scalar_i32(a + b),
                ));
                Ok(resp)
            }
            (EntryType::FunctionCallReq, "slow_echo") => {
                thread::sleep(Duration::from_millis(300));
                let value = entry.element_or_err("value")?.data.clone();
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new("return", value));
                Ok(resp)
            }
            (EntryType::FunctionCallReq, "fail") => {
                Err(Error::InvalidArgument("fail requested".to_string()))
            }
            (EntryType::FunctionCallReq, "count_to_three") => {
                let id = self.next_generator.fetch_add(1, Ordering::Relaxed) as i32;
                self.generators
                    .lock()
                    .expect("generators lock")
                    .insert(id, 0);
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new("index", ElementData::scalar_i32(id)));
                Ok(resp)
            }
            (EntryType::GeneratorNextReq, "count_to_three") => {
                let id = entry.element_or_err("index")?.data.as_i32()?;
                let mut generators = self.generators.lock().expect("generators lock");

                // Sentinel-carrying next entries terminate the generator.
                if let Some(err) = entry.extract_error() {
                    generators.remove(&id);
                    return Err(err);
                }

                let counter = generators
                    .get_mut(&id)
                    .ok_or_else(|| Error::InvalidArgument(format!("generator {}", id)))?;
                *counter += 1;
                if *counter > 3 {
                    generators.remove(&id);
                    return Err(Error::StopIteration);
                }
                let value = *counter;
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "return",
                    ElementData::scalar_i32(value),
                ));
                Ok(resp)
            }
            _ => Err(Error::MemberNotFound(format!(
                "{}.{}",
                entry.service_path, entry.member_name
            ))),
        }
    }
}

fn start_server(peer_name: &str) -> Arc<Node> {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = Node::new();
    let transport = IntraTransport::new(&node).expect("server transport");
    transport.start_server(peer_name).expect("start server");
    node.register_service("testsvc", Arc::new(TestSkel::new()))
        .expect("register service");
    node
}

fn client_node() -> Arc<Node> {
    let node = Node::new();
    IntraTransport::new(&node).expect("client transport");
    node
}

fn url(peer_name: &str) -> String {
    format!("rr+intra:///?service=testsvc&nodename={}", peer_name)
}

#[test]
fn connect_property_function_roundtrip() {
    let server = start_server("rr_basic");
    server
        .service("testsvc")
        .expect("registered service")
        .set_attributes(vec![MessageElement::new(
            "vendor",
            ElementData::Str("acme".to_string()),
        )]);
    let client_side = client_node();

    let client = client_side
        .connect_service(&url("rr_basic"))
        .expect("connect");
    assert_eq!(client.root_object_type(), "experimental.testsvc.TestObject");
    assert!(client.is_connected());

    let object_type = client.object_type_name("testsvc").expect("object type");
    assert_eq!(object_type, "experimental.testsvc.TestObject");

    let attributes = client.service_attributes().expect("service attributes");
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].name_str(), Some("vendor"));

    let exposure = client
        .property_get("testsvc", "exposure")
        .expect("property get");
    assert_eq!(exposure, ElementData::scalar_i32(10));

    client
        .property_set("testsvc", "exposure", ElementData::scalar_i32(55))
        .expect("property set");
    let exposure = client
        .property_get("testsvc", "exposure")
        .expect("property get after set");
    assert_eq!(exposure, ElementData::scalar_i32(55));

    let sum = client
        .function_call(
            "testsvc",
            "add",
            vec![
                MessageElement::new("a", ElementData::scalar_i32(2)),
                MessageElement::new("b", ElementData::scalar_i32(40)),
            ],
        )
        .expect("function call");
    assert_eq!(sum, Some(ElementData::scalar_i32(42)));

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn concurrent_requests_correlate_to_their_own_callers() {
    let server = start_server("rr_concurrent");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("rr_concurrent"))
        .expect("connect");

    let mut workers = Vec::new();
    for i in 0..16i32 {
        let client = client.clone();
        workers.push(thread::spawn(move || {
            let sum = client
                .function_call(
                    "testsvc",
                    "add",
                    vec![
                        MessageElement::new("a", ElementData::scalar_i32(i)),
                        MessageElement::new("b", ElementData::scalar_i32(1000)),
                    ],
                )
                .expect("function call");
            assert_eq!(
                sum,
                Some(ElementData::scalar_i32(i + 1000)),
                "response cross-wired for caller {}",
                i
            );
        }));
    }
    for worker in workers {
        worker.join().expect("worker thread");
    }

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn timeout_fires_once_and_late_response_is_discarded() {
    let server = start_server("rr_timeout");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("rr_timeout"))
        .expect("connect");

    let completions = Arc::new(AtomicU32::new(0));
    let timed_out = Arc::new(AtomicU32::new(0));

    let mut entry = MessageEntry::with_member(EntryType::FunctionCallReq, "testsvc", "slow_echo");
    entry.add_element(MessageElement::new("value", ElementData::scalar_i32(1)));

    let c = Arc::clone(&completions);
    let t = Arc::clone(&timed_out);
    let start = Instant::now();
    client.async_process_request(
        entry,
        Box::new(move |result| {
            c.fetch_add(1, Ordering::SeqCst);
            if matches!(result, Err(Error::ConnectionError(_))) {
                t.fetch_add(1, Ordering::SeqCst);
            }
        }),
        Some(Duration::from_millis(100)),
    );

    // Wait past both the timeout and the late response at ~300 ms.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(completions.load(Ordering::SeqCst), 1, "handler must run exactly once");
    assert_eq!(timed_out.load(Ordering::SeqCst), 1, "completion must be the timeout");
    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "sanity: timeout window elapsed"
    );

    // The connection survives a timed-out request.
    let sum = client
        .function_call(
            "testsvc",
            "add",
            vec![
                MessageElement::new("a", ElementData::scalar_i32(1)),
                MessageElement::new("b", ElementData::scalar_i32(2)),
            ],
        )
        .expect("later call on same connection");
    assert_eq!(sum, Some(ElementData::scalar_i32(3)));

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn remote_errors_reconstruct_into_local_variants() {
    let server = start_server("rr_errors");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("rr_errors"))
        .expect("connect");

    let err = client
        .function_call("testsvc", "fail", Vec::new())
        .expect_err("remote failure");
    assert_eq!(err, Error::InvalidArgument("fail requested".to_string()));

    let err = client
        .function_call("testsvc", "no_such_member", Vec::new())
        .expect_err("unknown member");
    assert!(matches!(err, Error::MemberNotFound(_)));

    let err = client
        .property_get("nosuchservice", "x")
        .expect_err("unknown service");
    assert!(matches!(err, Error::ServiceNotFound(_)));

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn generator_counts_then_stops() {
    let server = start_server("rr_generator");
    let client_side = client_node();
    let client = client_side
        .connect_service(&url("rr_generator"))
        .expect("connect");

    let index = client
        .function_call("testsvc", "count_to_three", Vec::new())
        .expect("start generator")
        .expect("generator index");
    let id = index.as_i32().expect("index is i32");

    let generator = client.generator("testsvc", "count_to_three", id);
    for expected in 1..=3 {
        let value = generator
            .next(None)
            .expect("generator value")
            .expect("return element");
        assert_eq!(value, ElementData::scalar_i32(expected));
    }
    let err = generator.next(None).expect_err("exhausted");
    assert_eq!(err, Error::StopIteration);

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn object_locks_exclude_other_clients() {
    let server = start_server("rr_locks");
    let client_side_a = client_node();
    let client_side_b = client_node();
    let client_a = client_side_a
        .connect_service(&url("rr_locks"))
        .expect("connect a");
    let client_b = client_side_b
        .connect_service(&url("rr_locks"))
        .expect("connect b");

    client_a.lock_object("testsvc").expect("lock");

    let err = client_b
        .property_get("testsvc", "exposure")
        .expect_err("locked for b");
    assert!(matches!(err, Error::ObjectLocked(_)));

    // The lock holder still operates.
    client_a
        .property_get("testsvc", "exposure")
        .expect("holder reads");

    client_a.unlock_object("testsvc").expect("unlock");
    client_b
        .property_get("testsvc", "exposure")
        .expect("unlocked for b");

    client_a.close().expect("close a");
    client_b.close().expect("close b");
    client_side_a.shutdown();
    client_side_b.shutdown();
    server.shutdown();
}

#[test]
fn lock_released_when_holder_disconnects() {
    let server = start_server("rr_lock_release");
    let client_side_a = client_node();
    let client_side_b = client_node();
    let client_a = client_side_a
        .connect_service(&url("rr_lock_release"))
        .expect("connect a");
    let client_b = client_side_b
        .connect_service(&url("rr_lock_release"))
        .expect("connect b");

    client_a.lock_object("testsvc").expect("lock");
    client_a.close().expect("close a");

    // The disconnect released the lock.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match client_b.property_get("testsvc", "exposure") {
            Ok(_) => break,
            Err(Error::ObjectLocked(_)) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => panic!("unexpected error waiting for lock release: {}", err),
        }
    }

    client_b.close().expect("close b");
    client_side_a.shutdown();
    client_side_b.shutdown();
    server.shutdown();
}

struct SingleUserAuth;

impl UserAuthenticator for SingleUserAuth {
    fn authenticate(
        &self,
        username: &str,
        credentials: &[MessageElement],
    ) -> Result<AuthenticatedUser> {
        let password = credentials
            .iter()
            .find(|e| e.name_str() == Some("password"))
            .and_then(|e| e.data.as_str().ok())
            .unwrap_or("");
        if username == "operator" && password == "hunter2" {
            Ok(AuthenticatedUser {
                username: username.to_string(),
                privileges: vec!["all".to_string()],
            })
        } else {
            Err(Error::AuthenticationError("bad credentials".to_string()))
        }
    }
}

#[test]
fn authentication_gates_connects() {
    let server = Node::new();
    let transport = IntraTransport::new(&server).expect("server transport");
    transport.start_server("rr_auth").expect("start server");
    let ctx = server
        .register_service("testsvc", Arc::new(TestSkel::new()))
        .expect("register service");
    ctx.set_authenticator(Arc::new(SingleUserAuth));

    let client_side = client_node();

    // No credentials: rejected.
    let err = client_side
        .connect_service(&url("rr_auth"))
        .expect_err("credentials required");
    assert!(matches!(err, Error::AuthenticationError(_)));

    // Wrong password: rejected.
    let err = client_side
        .connect_service_with(
            &url("rr_auth"),
            Some("operator"),
            vec![MessageElement::new(
                "password",
                ElementData::Str("wrong".to_string()),
            )],
        )
        .expect_err("bad credentials");
    assert!(matches!(err, Error::AuthenticationError(_)));

    // Correct credentials: accepted, endpoint usable.
    let client = client_side
        .connect_service_with(
            &url("rr_auth"),
            Some("operator"),
            vec![MessageElement::new(
                "password",
                ElementData::Str("hunter2".to_string()),
            )],
        )
        .expect("authenticated connect");
    client
        .property_get("testsvc", "exposure")
        .expect("authenticated call");

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}

#[test]
fn custom_request_timeout_config_applies() {
    let server = start_server("rr_cfg_timeout");
    let client_side = Node::with_config(NodeConfig::new().with_request_timeout(
        Duration::from_millis(100),
    ));
    IntraTransport::new(&client_side).expect("client transport");

    let client = client_side
        .connect_service(&url("rr_cfg_timeout"))
        .expect("connect");

    // slow_echo takes ~300 ms; the configured 100 ms default wins.
    let mut entry = MessageEntry::with_member(EntryType::FunctionCallReq, "testsvc", "slow_echo");
    entry.add_element(MessageElement::new("value", ElementData::scalar_i32(1)));
    let start = Instant::now();
    let err = client.process_request(entry).expect_err("default timeout");
    assert!(matches!(err, Error::ConnectionError(_)));
    assert!(start.elapsed() < Duration::from_millis(290), "timed out before the reply");

    client.close().expect("close");
    client_side.shutdown();
    server.shutdown();
}
