// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Client-side endpoint context.
//!
//! A [`ClientContext`] maps transport messages to service-level requests for
//! one remote service and enforces request correlation and timeout. Every
//! outstanding request is completed exactly once by whichever of {matching
//! response, timeout, connection loss, forced close} wins the race; removal
//! from the outstanding table is the guard, so the losers observe a miss and
//! no-op.
//!
//! Blocking calls are the async path plus an
//! [`AutoResetEvent`](crate::sync::AutoResetEvent) wait - there is no second
//! code path, so timeout and shutdown semantics are identical on both
//! surfaces.

use super::{Endpoint, EndpointHandler};
use crate::config::DISCONNECT_TIMEOUT;
use crate::error::{Error, Result};
use crate::message::{
    ElementData, EntryType, Message, MessageElement, MessageEntry,
};
use crate::node::Node;
use crate::pipe::PipeClient;
use crate::sync::{AutoResetEvent, TimerHandle};
use crate::transport::ParsedUrl;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Completion callback for an asynchronous request.
pub type ResponseHandler = Box<dyn FnOnce(Result<MessageEntry>) + Send + 'static>;

/// Client connection state changes observed by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connect handshake completed.
    Connected,
    /// Connection closed by this side.
    Closed,
    /// Transport failed underneath the connection.
    ConnectionLost,
}

struct OutstandingRequest {
    handler: ResponseHandler,
    timer: Option<TimerHandle>,
}

/// Client side of one service connection.
pub struct ClientContext {
    weak_self: Weak<ClientContext>,
    ep: Endpoint,

    service_name: Mutex<String>,
    root_object_type: Mutex<String>,

    connected: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,

    next_request_id: AtomicU32,
    outstanding: Mutex<HashMap<u32, OutstandingRequest>>,

    pipes: Mutex<HashMap<(String, String), Arc<PipeClient>>>,
    listeners: Mutex<Vec<Arc<dyn Fn(ClientEvent) + Send + Sync>>>,
    event_listeners: Mutex<Vec<Arc<dyn Fn(&MessageEntry) + Send + Sync>>>,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("service_name", &self.service_name())
            .field("local_endpoint", &self.local_endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientContext {
    fn new(node: &Arc<Node>, local_endpoint: u32) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            ep: Endpoint::new(node, local_endpoint),
            service_name: Mutex::new(String::new()),
            root_object_type: Mutex::new(String::new()),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_request_id: AtomicU32::new(1),
            outstanding: Mutex::new(HashMap::new()),
            pipes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            event_listeners: Mutex::new(Vec::new()),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Name of the connected service.
    pub fn service_name(&self) -> String {
        self.service_name.lock().clone()
    }

    /// Qualified type of the service root object, learned at connect time.
    pub fn root_object_type(&self) -> String {
        self.root_object_type.lock().clone()
    }

    /// Local endpoint id in the owning node's table.
    pub fn local_endpoint(&self) -> u32 {
        self.ep.local_endpoint()
    }

    /// True between a completed connect handshake and close.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// Observe connection state changes.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(ClientEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Observe server-pushed event entries.
    pub fn add_event_listener<F>(&self, listener: F)
    where
        F: Fn(&MessageEntry) + Send + Sync + 'static,
    {
        self.event_listeners.lock().push(Arc::new(listener));
    }

    fn fire_event(&self, event: ClientEvent) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        if listeners.is_empty() {
            return;
        }
        if let Ok(node) = self.ep.node() {
            for listener in listeners {
                node.post_handler(Box::new(move || listener(event)));
            }
        }
    }

    // ========================================================================
    // Request correlation
    // ========================================================================

    /// Send a request and block for the response, with the node's default
    /// request timeout.
    pub fn process_request(&self, entry: MessageEntry) -> Result<MessageEntry> {
        let timeout = self.ep.node()?.config().request_timeout;
        self.process_request_timeout(entry, Some(timeout))
    }

    /// Send a request and block for the response. `None` disables the
    /// timeout.
    pub fn process_request_timeout(
        &self,
        entry: MessageEntry,
        timeout: Option<Duration>,
    ) -> Result<MessageEntry> {
        let done = Arc::new(AutoResetEvent::new());
        let slot: Arc<Mutex<Option<Result<MessageEntry>>>> = Arc::new(Mutex::new(None));

        let done2 = Arc::clone(&done);
        let slot2 = Arc::clone(&slot);
        self.async_process_request(
            entry,
            Box::new(move |result| {
                *slot2.lock() = Some(result);
                done2.set();
            }),
            timeout,
        );

        done.wait_one(None);
        let result = slot
            .lock()
            .take()
            .unwrap_or_else(|| Err(Error::InternalError("request completed empty".to_string())));
        result
    }

    /// Send a request; the handler is invoked exactly once with the
    /// response, a timeout error, or a connection error. `None` timeout
    /// disables the timer.
    pub fn async_process_request(
        &self,
        entry: MessageEntry,
        handler: ResponseHandler,
        timeout: Option<Duration>,
    ) {
        self.start_request(entry, handler, timeout, false);
    }

    fn start_request(
        &self,
        mut entry: MessageEntry,
        handler: ResponseHandler,
        timeout: Option<Duration>,
        allow_while_closing: bool,
    ) {
        if self.closed.load(Ordering::Acquire)
            || (!allow_while_closing && self.closing.load(Ordering::Acquire))
        {
            self.invoke_handler(
                handler,
                Err(Error::InvalidOperation(
                    "client connection closed".to_string(),
                )),
            );
            return;
        }

        // Request ids wrap; skip 0 and ids still outstanding.
        let request_id = loop {
            let candidate = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !self.outstanding.lock().contains_key(&candidate) {
                break candidate;
            }
        };
        entry.request_id = request_id;

        self.outstanding.lock().insert(
            request_id,
            OutstandingRequest {
                handler,
                timer: None,
            },
        );

        // Arm the timeout after registration so a fast fire cannot race a
        // missing record.
        if let Some(timeout) = timeout {
            let timer = self.ep.node().and_then(|n| n.timer_queue()).map(|timers| {
                let weak = self.weak_self.clone();
                timers.schedule_once(timeout, move || {
                    if let Some(client) = weak.upgrade() {
                        client.complete_request(
                            request_id,
                            Err(Error::ConnectionError(format!(
                                "request {} timed out",
                                request_id
                            ))),
                        );
                    }
                })
            });
            match timer {
                Ok(timer) => {
                    let mut outstanding = self.outstanding.lock();
                    match outstanding.get_mut(&request_id) {
                        Some(record) => record.timer = Some(timer),
                        // Completed before the timer was attached.
                        None => {
                            timer.cancel();
                        }
                    }
                }
                Err(err) => {
                    self.complete_request(request_id, Err(err));
                    return;
                }
            }
        }

        let message = Message::from_entry(entry);
        if let Err(err) = self.ep.send_message(message) {
            self.complete_request(request_id, Err(err));
        }
    }

    /// Complete an outstanding request. First caller wins; later completions
    /// for the same id (late responses, racing timers) are discarded.
    fn complete_request(&self, request_id: u32, result: Result<MessageEntry>) {
        let record = self.outstanding.lock().remove(&request_id);
        let Some(record) = record else {
            log::debug!(
                "[ClientContext::complete_request] late completion for {} discarded",
                request_id
            );
            return;
        };
        if let Some(timer) = record.timer {
            timer.cancel();
        }
        self.invoke_handler(record.handler, result);
    }

    /// Hand a completion to the worker pool; runs inline only when the node
    /// is already gone, so the handler is never lost.
    fn invoke_handler(&self, handler: ResponseHandler, result: Result<MessageEntry>) {
        match self.ep.node() {
            Ok(node) => node.post_handler(Box::new(move || handler(result))),
            Err(_) => handler(result),
        }
    }

    // ========================================================================
    // Member operation helpers
    // ========================================================================

    /// Read a property member.
    pub fn property_get(&self, service_path: &str, name: &str) -> Result<ElementData> {
        let entry = MessageEntry::with_member(EntryType::PropertyGetReq, service_path, name);
        let response = self.process_request(entry)?;
        Ok(response.element_or_err("value")?.data.clone())
    }

    /// Write a property member.
    pub fn property_set(&self, service_path: &str, name: &str, value: ElementData) -> Result<()> {
        let mut entry = MessageEntry::with_member(EntryType::PropertySetReq, service_path, name);
        entry.add_element(MessageElement::new("value", value));
        self.process_request(entry)?;
        Ok(())
    }

    /// Call a function member; returns the "return" element when present.
    pub fn function_call(
        &self,
        service_path: &str,
        name: &str,
        args: Vec<MessageElement>,
    ) -> Result<Option<ElementData>> {
        let mut entry = MessageEntry::with_member(EntryType::FunctionCallReq, service_path, name);
        entry.elements = args;
        let response = self.process_request(entry)?;
        Ok(response.element("return").map(|e| e.data.clone()))
    }

    /// Resolve the qualified type of an object within the service.
    pub fn object_type_name(&self, service_path: &str) -> Result<String> {
        let entry = MessageEntry::with_member(EntryType::ObjectTypeName, service_path, "");
        let response = self.process_request(entry)?;
        Ok(response
            .element_or_err("objecttype")?
            .data
            .as_str()?
            .to_string())
    }

    /// Fetch the service attribute elements.
    pub fn service_attributes(&self) -> Result<Vec<MessageElement>> {
        let entry = MessageEntry::with_member(
            EntryType::GetServiceAttributes,
            self.service_name(),
            "",
        );
        let response = self.process_request(entry)?;
        Ok(response.element_or_err("attributes")?.data.as_elements()?.to_vec())
    }

    /// Request an object lock on a service path for this endpoint.
    pub fn lock_object(&self, service_path: &str) -> Result<()> {
        let entry = MessageEntry::with_member(EntryType::ObjectLockReq, service_path, "");
        self.process_request(entry)?;
        Ok(())
    }

    /// Release an object lock held by this endpoint.
    pub fn unlock_object(&self, service_path: &str) -> Result<()> {
        let entry = MessageEntry::with_member(EntryType::ObjectUnlockReq, service_path, "");
        self.process_request(entry)?;
        Ok(())
    }

    /// Handle for a generator returned by a function call.
    pub fn generator(
        &self,
        service_path: &str,
        member_name: &str,
        generator_id: i32,
    ) -> GeneratorClient {
        GeneratorClient {
            client: self.weak_self.clone(),
            service_path: service_path.to_string(),
            member_name: member_name.to_string(),
            generator_id,
        }
    }

    /// Pipe member accessor; creates the client-side pipe on first use.
    pub fn pipe(self: &Arc<Self>, service_path: &str, member_name: &str) -> Arc<PipeClient> {
        let key = (service_path.to_string(), member_name.to_string());
        let mut pipes = self.pipes.lock();
        pipes
            .entry(key)
            .or_insert_with(|| PipeClient::new(self, service_path, member_name))
            .clone()
    }

    fn find_pipe(&self, service_path: &str, member_name: &str) -> Option<Arc<PipeClient>> {
        self.pipes
            .lock()
            .get(&(service_path.to_string(), member_name.to_string()))
            .cloned()
    }

    // ========================================================================
    // Connect handshake
    // ========================================================================

    /// Multi-step connect pipeline. Any failing step tears the transport
    /// connection and the endpoint down so partially constructed endpoints
    /// never leak into the node's table.
    pub(crate) fn async_connect(
        node: &Arc<Node>,
        url: ParsedUrl,
        username: Option<&str>,
        credentials: Vec<MessageElement>,
        handler: Box<dyn FnOnce(Result<Arc<ClientContext>>) + Send + 'static>,
    ) {
        // Step 1: pick a transport able to service the URL.
        let transport = node
            .transports_for_url(&url)
            .into_iter()
            .next();
        let Some(transport) = transport else {
            handler(Err(Error::ConnectionError(format!(
                "no transport registered for scheme \"{}\"",
                url.scheme
            ))));
            return;
        };

        // Step 2: register the client endpoint.
        let mut created: Option<Arc<ClientContext>> = None;
        let registered = node.register_endpoint(|id| {
            let client = ClientContext::new(node, id);
            created = Some(client.clone());
            client as Arc<dyn EndpointHandler>
        });
        let (endpoint_id, _) = match registered {
            Ok(r) => r,
            Err(err) => {
                handler(Err(err));
                return;
            }
        };
        let Some(client) = created else {
            handler(Err(Error::InternalError(
                "client endpoint factory did not run".to_string(),
            )));
            return;
        };

        *client.service_name.lock() = url.service.clone();
        if let Some(expected) = url.node_id {
            client.ep.set_remote_node_id(expected);
        }
        client.ep.set_remote_node_name(url.node_name.clone());

        // Step 3: open the transport connection.
        let connection = match transport.create_transport_connection(&url, endpoint_id) {
            Ok(c) => c,
            Err(err) => {
                node.delete_endpoint(endpoint_id);
                handler(Err(err));
                return;
            }
        };
        client
            .ep
            .set_connection(connection, transport.transport_id());

        // Step 4: combined connect request (object type + credentials +
        // service definition in one round trip).
        let mut entry =
            MessageEntry::with_member(EntryType::ConnectClientCombined, &url.service, "");
        if let Some(username) = username {
            entry.add_element(MessageElement::new(
                "username",
                ElementData::Str(username.to_string()),
            ));
            entry.add_element(MessageElement::new("credentials", ElementData::Map(credentials)));
        }
        entry.add_element(MessageElement::new("returnservicedef", ElementData::Void));

        let connect_timeout = node.config().connect_timeout;
        let client2 = client.clone();
        client.start_request(
            entry,
            Box::new(move |result| match result {
                Ok(response) => {
                    // Step 5: record the root object type and finish.
                    if let Some(el) = response.element("objecttype") {
                        if let Ok(t) = el.data.as_str() {
                            *client2.root_object_type.lock() = t.to_string();
                        }
                    }
                    client2.connected.store(true, Ordering::Release);
                    client2.fire_event(ClientEvent::Connected);
                    log::debug!(
                        "[ClientContext::async_connect] endpoint {} connected to \"{}\"",
                        client2.local_endpoint(),
                        client2.service_name()
                    );
                    handler(Ok(client2.clone()));
                }
                Err(err) => {
                    client2.teardown(
                        Error::ConnectionError("connect handshake failed".to_string()),
                        None,
                    );
                    handler(Err(err));
                }
            }),
            Some(connect_timeout),
            false,
        );
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Graceful close (blocking): best-effort DisconnectClient round trip,
    /// then local teardown.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let done = Arc::new(AutoResetEvent::new());
        let done2 = Arc::clone(&done);
        self.async_close(Box::new(move || {
            done2.set();
        }));
        done.wait_one(None);
        Ok(())
    }

    /// Graceful close; the handler runs after teardown completes.
    pub fn async_close(self: &Arc<Self>, handler: Box<dyn FnOnce() + Send + 'static>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            // Already closing: report completion through the pool.
            match self.ep.node() {
                Ok(node) => node.post_handler(handler),
                Err(_) => handler(),
            }
            return;
        }

        if !self.connected.load(Ordering::Acquire) {
            self.teardown(
                Error::ConnectionError("connection closed".to_string()),
                Some(ClientEvent::Closed),
            );
            match self.ep.node() {
                Ok(node) => node.post_handler(handler),
                Err(_) => handler(),
            }
            return;
        }

        let me = self.clone();
        let entry =
            MessageEntry::with_member(EntryType::DisconnectClient, self.service_name(), "");
        self.start_request(
            entry,
            Box::new(move |_result| {
                // Teardown regardless of whether the remote answered.
                me.teardown(
                    Error::ConnectionError("connection closed".to_string()),
                    Some(ClientEvent::Closed),
                );
                handler();
            }),
            Some(DISCONNECT_TIMEOUT),
            true,
        );
    }

    /// One-shot local teardown: completes every outstanding request with
    /// `reason`, shuts pipes, drops the connection, and leaves the node's
    /// endpoint table.
    fn teardown(&self, reason: Error, event: Option<ClientEvent>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closing.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);

        let pending: Vec<(u32, OutstandingRequest)> =
            self.outstanding.lock().drain().collect();
        for (id, record) in pending {
            log::debug!(
                "[ClientContext::teardown] request {} completed with close error",
                id
            );
            if let Some(timer) = record.timer {
                timer.cancel();
            }
            self.invoke_handler(record.handler, Err(reason.clone()));
        }

        let pipes: Vec<Arc<PipeClient>> = self.pipes.lock().drain().map(|(_, p)| p).collect();
        for pipe in pipes {
            pipe.shutdown();
        }

        if let Some(connection) = self.ep.take_connection() {
            connection.close();
        }

        if let Ok(node) = self.ep.node() {
            node.delete_endpoint(self.ep.local_endpoint());
        }

        if let Some(event) = event {
            self.fire_event(event);
        }
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    fn dispatch_entry(&self, entry: MessageEntry) {
        let entry_type = entry.entry_type;
        match entry_type {
            EntryType::PipePacket => {
                if let Some(pipe) = self.find_pipe(&entry.service_path, &entry.member_name) {
                    pipe.packet_received(&entry);
                } else {
                    log::debug!(
                        "[ClientContext::dispatch_entry] packet for unknown pipe {}.{}",
                        entry.service_path,
                        entry.member_name
                    );
                }
            }
            EntryType::PipePacketRet => {
                if let Some(pipe) = self.find_pipe(&entry.service_path, &entry.member_name) {
                    pipe.ack_received(&entry);
                }
            }
            EntryType::PipeClosed => {
                if let Some(pipe) = self.find_pipe(&entry.service_path, &entry.member_name) {
                    pipe.remote_closed(&entry);
                }
            }
            EntryType::PipeClosedRet => {
                if let Some(pipe) = self.find_pipe(&entry.service_path, &entry.member_name) {
                    pipe.closed_ret(&entry);
                }
            }
            EntryType::EventReq => {
                let listeners: Vec<_> = self.event_listeners.lock().clone();
                if listeners.is_empty() {
                    return;
                }
                if let Ok(node) = self.ep.node() {
                    let entry = Arc::new(entry);
                    for listener in listeners {
                        let entry = Arc::clone(&entry);
                        node.post_handler(Box::new(move || listener(&entry)));
                    }
                }
            }
            t if t.is_response() => {
                let result = match entry.extract_error() {
                    Some(err) => Err(err),
                    None => Ok(entry.clone()),
                };
                self.complete_request(entry.request_id, result);
            }
            t if t.is_request() => {
                // Clients do not serve member requests.
                let response = entry.make_error_response(&Error::InvalidOperation(
                    "request sent to a client endpoint".to_string(),
                ));
                if let Err(err) = self.ep.send_entry(response, false) {
                    log::debug!("[ClientContext::dispatch_entry] error reply failed: {}", err);
                }
            }
            other => {
                log::debug!("[ClientContext::dispatch_entry] ignored {:?}", other);
            }
        }
    }
}

impl EndpointHandler for ClientContext {
    fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    fn message_received(&self, message: Message) {
        // The connect response teaches us the peer endpoint id.
        if self.ep.remote_endpoint() == 0 && message.header.sender_endpoint != 0 {
            self.ep.set_remote_endpoint(message.header.sender_endpoint);
            self.ep.set_remote_node_id(message.header.sender_node_id);
            self.ep
                .set_remote_node_name(message.header.sender_node_name.clone());
        }

        // Entries are processed in message order.
        for entry in message.entries {
            self.dispatch_entry(entry);
        }
    }

    fn transport_connection_closed(&self, reason: Option<Error>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let reason = reason.unwrap_or_else(|| {
            Error::ConnectionError("transport connection lost".to_string())
        });
        log::debug!(
            "[ClientContext::transport_connection_closed] endpoint {}: {}",
            self.ep.local_endpoint(),
            reason
        );
        self.teardown(reason, Some(ClientEvent::ConnectionLost));
    }

    fn force_close(&self) {
        self.teardown(
            Error::ConnectionError("connection closed: node shutdown".to_string()),
            Some(ClientEvent::Closed),
        );
    }
}

// ============================================================================
// GENERATOR CLIENT
// ============================================================================

/// Client handle for a generator member: a server-streamed iterator built on
/// request/response pairs.
pub struct GeneratorClient {
    client: Weak<ClientContext>,
    service_path: String,
    member_name: String,
    generator_id: i32,
}

impl GeneratorClient {
    fn client(&self) -> Result<Arc<ClientContext>> {
        self.client
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("client connection released".to_string()))
    }

    /// Generator id assigned by the server.
    #[must_use]
    pub fn generator_id(&self) -> i32 {
        self.generator_id
    }

    /// Advance the generator. `Err(Error::StopIteration)` signals normal
    /// exhaustion.
    pub fn next(&self, parameter: Option<ElementData>) -> Result<Option<ElementData>> {
        let mut entry = MessageEntry::with_member(
            EntryType::GeneratorNextReq,
            &self.service_path,
            &self.member_name,
        );
        entry.add_element(MessageElement::new(
            "index",
            ElementData::scalar_i32(self.generator_id),
        ));
        if let Some(parameter) = parameter {
            entry.add_element(MessageElement::new("parameter", parameter));
        }
        let response = self.client()?.process_request(entry)?;
        Ok(response.element("return").map(|e| e.data.clone()))
    }

    /// Abort the generator; the server discards remaining values.
    pub fn abort(&self) -> Result<()> {
        self.terminate(&Error::OperationAborted("generator aborted".to_string()))
    }

    /// Close the generator cleanly.
    pub fn close(&self) -> Result<()> {
        self.terminate(&Error::StopIteration)
    }

    /// Termination is a GeneratorNextReq carrying the sentinel as its error;
    /// the matching sentinel in the response confirms completion.
    fn terminate(&self, sentinel: &Error) -> Result<()> {
        let mut entry = MessageEntry::with_member(
            EntryType::GeneratorNextReq,
            &self.service_path,
            &self.member_name,
        );
        entry.add_element(MessageElement::new(
            "index",
            ElementData::scalar_i32(self.generator_id),
        ));
        entry.set_error(sentinel);
        match self.client()?.process_request(entry) {
            Ok(_) => Ok(()),
            Err(err) if err.is_sentinel() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
