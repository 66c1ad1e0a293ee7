// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Process-wide node hub.
//!
//! The [`Node`] is the single point of truth for "which local endpoint owns
//! this message" and "which transport sends for this endpoint". It owns the
//! endpoint table, the transport table, the registered services, the worker
//! pool, and the timer queue. Construct one explicitly and pass
//! `Arc<Node>` to every component; the core has no global instance.
//!
//! Inbound flow: a transport delivers a [`Message`] to
//! [`Node::message_received`], which validates the receiver node id,
//! handles special requests centrally, and otherwise forwards to the owning
//! endpoint. Table lookups hold their lock only for the lookup; dispatch and
//! handler code run outside so slow endpoints never block ingestion for
//! other endpoints.

mod thread_pool;

pub use thread_pool::WorkerPool;

use crate::config::NodeConfig;
use crate::endpoint::client::ClientContext;
use crate::endpoint::server::{service_root, ServerContext, ServiceSkel};
use crate::endpoint::EndpointHandler;
use crate::error::{Error, Result};
use crate::message::{ElementData, Message, MessageElement, MessageEntry, NodeId};
use crate::sync::{TimerHandle, TimerQueue};
use crate::transport::{parse_connection_url, Transport, TransportSource};
use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Callback receiving every error that reaches the node boundary
/// (panicking handlers, per-subscriber fan-out failures).
pub type ExceptionHandler = Box<dyn Fn(&Error) + Send + Sync>;

/// Completion callback for [`Node::async_connect_service`].
pub type ConnectHandler = Box<dyn FnOnce(Result<Arc<ClientContext>>) + Send + 'static>;

/// Capability names answered by `NodeCheckCapability`.
///
/// The connect handshake is negotiable: peers probe these before choosing a
/// handshake or codec generation.
pub const CAPABILITY_CONNECT_COMBINED: &str = "connectclientcombined";
/// Unreliable pipe delivery supported.
pub const CAPABILITY_PIPE_UNRELIABLE: &str = "pipe.unreliable";
/// v4 wire codec supported.
pub const CAPABILITY_CODEC_V4: &str = "codec.v4";

/// Process-wide RPC participant.
pub struct Node {
    weak_self: Weak<Node>,

    node_id: Mutex<Option<NodeId>>,
    node_name: Mutex<String>,
    config: ArcSwap<NodeConfig>,

    endpoints: DashMap<u32, Arc<dyn EndpointHandler>>,
    /// Recently freed endpoint ids and when they were freed. Ids stay
    /// reserved for the retention window so a stale in-flight message cannot
    /// be misrouted to a newly registered endpoint.
    recent_endpoints: Mutex<HashMap<u32, Instant>>,
    /// Serializes endpoint id draws.
    endpoint_register_lock: Mutex<()>,

    transports: DashMap<u32, Arc<dyn Transport>>,
    next_transport_id: AtomicU32,

    services: DashMap<String, Arc<ServerContext>>,

    thread_pool: Mutex<Option<Arc<WorkerPool>>>,
    timer_queue: Mutex<Option<Arc<TimerQueue>>>,
    cleanup_timer: Mutex<Option<TimerHandle>>,

    exception_handler: ArcSwapOption<ExceptionHandler>,
    shutdown_listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,

    shutdown_started: AtomicBool,
    is_shutdown: AtomicBool,
}

impl Node {
    /// Create a node with default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(NodeConfig::default())
    }

    /// Create a node with explicit configuration.
    #[must_use]
    pub fn with_config(config: NodeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            node_id: Mutex::new(None),
            node_name: Mutex::new(String::new()),
            config: ArcSwap::from_pointee(config),
            endpoints: DashMap::new(),
            recent_endpoints: Mutex::new(HashMap::new()),
            endpoint_register_lock: Mutex::new(()),
            transports: DashMap::new(),
            next_transport_id: AtomicU32::new(1),
            services: DashMap::new(),
            thread_pool: Mutex::new(None),
            timer_queue: Mutex::new(None),
            cleanup_timer: Mutex::new(None),
            exception_handler: ArcSwapOption::from(None),
            shutdown_listeners: Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
            is_shutdown: AtomicBool::new(false),
        })
    }

    fn arc(&self) -> Result<Arc<Node>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("node has been released".to_string()))
    }

    pub(crate) fn weak(&self) -> Weak<Node> {
        self.weak_self.clone()
    }

    // ========================================================================
    // Identity and configuration
    // ========================================================================

    /// Node id; generated randomly on first access when not configured.
    pub fn node_id(&self) -> NodeId {
        let mut guard = self.node_id.lock();
        *guard.get_or_insert_with(NodeId::random)
    }

    /// Pin the node id. Fails once the id has been read or set.
    pub fn set_node_id(&self, id: NodeId) -> Result<()> {
        let mut guard = self.node_id.lock();
        if guard.is_some() {
            return Err(Error::InvalidOperation("node id already set".to_string()));
        }
        *guard = Some(id);
        Ok(())
    }

    /// Node name ("" when unset).
    pub fn node_name(&self) -> String {
        self.node_name.lock().clone()
    }

    /// Set the node name used in message headers and discovery.
    pub fn set_node_name(&self, name: &str) -> Result<()> {
        if name.len() > 1024 {
            return Err(Error::InvalidArgument("node name too long".to_string()));
        }
        *self.node_name.lock() = name.to_string();
        Ok(())
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<NodeConfig> {
        self.config.load_full()
    }

    /// Replace the configuration.
    pub fn set_config(&self, config: NodeConfig) {
        self.config.store(Arc::new(config));
    }

    // ========================================================================
    // Worker pool, timers, exception routing
    // ========================================================================

    /// Worker pool; first use forces initialization with the configured
    /// thread count.
    pub fn thread_pool(&self) -> Result<Arc<WorkerPool>> {
        let mut guard = self.thread_pool.lock();
        if guard.is_none() {
            // No recreation once shutdown has begun: a pool created after
            // the teardown took the old one would leak its workers.
            if self.shutdown_started.load(Ordering::Acquire) {
                return Err(Error::InvalidOperation("node is shut down".to_string()));
            }
            let weak = self.weak();
            let sink: thread_pool::PanicSink = Arc::new(move |err: &Error| {
                if let Some(node) = weak.upgrade() {
                    node.handle_exception(err);
                }
            });
            *guard = Some(Arc::new(WorkerPool::new(
                self.config().thread_pool_size,
                sink,
            )));
        }
        Ok(guard.clone().expect("pool initialized above"))
    }

    /// Timer queue; first use forces initialization.
    pub(crate) fn timer_queue(&self) -> Result<Arc<TimerQueue>> {
        let mut guard = self.timer_queue.lock();
        if guard.is_none() {
            if self.shutdown_started.load(Ordering::Acquire) {
                return Err(Error::InvalidOperation("node is shut down".to_string()));
            }
            *guard = Some(Arc::new(TimerQueue::new()));
        }
        Ok(guard.clone().expect("timer queue initialized above"))
    }

    /// Post a closure to the worker pool.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.thread_pool()?.post(task)
    }

    /// Post a completion handler; falls back to running it inline when the
    /// pool is unavailable, so completions are delivered exactly once even
    /// across shutdown races.
    pub(crate) fn post_handler(&self, task: thread_pool::PoolTask) {
        match self.thread_pool() {
            Ok(pool) => {
                if let Some(task) = pool.post_or_return(task) {
                    task();
                }
            }
            Err(_) => task(),
        }
    }

    /// Install the single node-wide exception callback.
    pub fn set_exception_handler(&self, handler: Option<ExceptionHandler>) {
        self.exception_handler.store(handler.map(Arc::new));
    }

    /// Route an error that reached the node boundary: logged, then handed to
    /// the exception callback. Never propagates.
    pub fn handle_exception(&self, err: &Error) {
        log::error!("[Node::handle_exception] {}", err);
        if let Some(handler) = self.exception_handler.load_full() {
            handler(err);
        }
    }

    // ========================================================================
    // Transport table
    // ========================================================================

    /// Register a transport and assign its id.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> Result<u32> {
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("node is shut down".to_string()));
        }
        let id = self.next_transport_id.fetch_add(1, Ordering::Relaxed);
        transport.set_transport_id(id);
        self.transports.insert(id, transport);
        Ok(id)
    }

    /// Transport by registration id.
    pub fn transport(&self, id: u32) -> Option<Arc<dyn Transport>> {
        self.transports.get(&id).map(|t| t.value().clone())
    }

    /// Client transports able to service a parsed URL.
    pub(crate) fn transports_for_url(
        &self,
        url: &crate::transport::ParsedUrl,
    ) -> Vec<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|t| t.value().is_client() && t.value().can_connect_url(url))
            .map(|t| t.value().clone())
            .collect()
    }

    // ========================================================================
    // Service table
    // ========================================================================

    /// Register a service under `name`, exposing `skel` as its root object.
    pub fn register_service(
        &self,
        name: &str,
        skel: Arc<dyn ServiceSkel>,
    ) -> Result<Arc<ServerContext>> {
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("node is shut down".to_string()));
        }
        if name.is_empty() || name.contains('.') {
            return Err(Error::InvalidArgument(format!(
                "invalid service name \"{}\"",
                name
            )));
        }
        if self.services.contains_key(name) {
            return Err(Error::InvalidOperation(format!(
                "service \"{}\" already registered",
                name
            )));
        }
        let node = self.arc()?;
        let ctx = ServerContext::new(&node, name, skel);
        self.services.insert(name.to_string(), ctx.clone());
        log::debug!("[Node::register_service] registered \"{}\"", name);
        Ok(ctx)
    }

    /// Look up a registered service.
    pub fn service(&self, name: &str) -> Option<Arc<ServerContext>> {
        self.services.get(name).map(|s| s.value().clone())
    }

    /// Close and remove a registered service.
    pub fn close_service(&self, name: &str) -> Result<()> {
        let (_, ctx) = self
            .services
            .remove(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        ctx.close();
        Ok(())
    }

    // ========================================================================
    // Endpoint table
    // ========================================================================

    /// Register a new endpoint. The id is drawn uniformly from the 32-bit
    /// space, redrawing on collision with a live or recently freed id.
    pub(crate) fn register_endpoint<F>(
        &self,
        mut factory: F,
    ) -> Result<(u32, Arc<dyn EndpointHandler>)>
    where
        F: FnMut(u32) -> Arc<dyn EndpointHandler>,
    {
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("node is shut down".to_string()));
        }
        let _guard = self.endpoint_register_lock.lock();
        let id = loop {
            let candidate = fastrand::u32(1..=u32::MAX);
            if self.endpoints.contains_key(&candidate) {
                continue;
            }
            if self.recent_endpoints.lock().contains_key(&candidate) {
                continue;
            }
            break candidate;
        };
        let handler = factory(id);
        self.endpoints.insert(id, handler.clone());
        self.ensure_cleanup_timer();
        log::debug!("[Node::register_endpoint] endpoint {} registered", id);
        Ok((id, handler))
    }

    /// Remove an endpoint from the table; its id enters the retention set.
    pub(crate) fn delete_endpoint(&self, id: u32) {
        if self.endpoints.remove(&id).is_some() {
            self.recent_endpoints.lock().insert(id, Instant::now());
            log::debug!("[Node::delete_endpoint] endpoint {} deleted", id);
        }
    }

    /// Remove an endpoint and force its local teardown.
    pub(crate) fn close_endpoint(&self, id: u32) {
        if let Some((_, handler)) = self.endpoints.remove(&id) {
            self.recent_endpoints.lock().insert(id, Instant::now());
            handler.force_close();
        }
    }

    /// Endpoint handler by id.
    pub(crate) fn endpoint(&self, id: u32) -> Option<Arc<dyn EndpointHandler>> {
        self.endpoints.get(&id).map(|e| e.value().clone())
    }

    /// Number of live endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn ensure_cleanup_timer(&self) {
        let mut guard = self.cleanup_timer.lock();
        if guard.is_some() {
            return;
        }
        let Ok(timers) = self.timer_queue() else {
            return;
        };
        let weak = self.weak();
        let handle = timers.schedule_periodic(self.config().cleanup_period, move || {
            if let Some(node) = weak.upgrade() {
                node.purge_recent_endpoints();
            }
        });
        *guard = Some(handle);
    }

    fn purge_recent_endpoints(&self) {
        let retention = self.config().endpoint_retention;
        let now = Instant::now();
        self.recent_endpoints
            .lock()
            .retain(|_, freed| now.duration_since(*freed) < retention);
    }

    /// True when `id` is in the recently freed retention set.
    pub(crate) fn endpoint_recently_freed(&self, id: u32) -> bool {
        self.recent_endpoints.lock().contains_key(&id)
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    /// Inbound message entry point for transports.
    pub fn message_received(&self, message: Message, source: &TransportSource) {
        if self.is_shutdown() {
            log::debug!("[Node::message_received] dropped: node shut down");
            return;
        }

        let receiver_node = message.header.receiver_node_id;
        if !receiver_node.is_any() && receiver_node != self.node_id() {
            log::debug!(
                "[Node::message_received] wrong receiver node {}",
                receiver_node
            );
            self.send_error_reply(
                &message,
                source,
                &Error::NodeNotFound(format!("message for node {}", receiver_node)),
            );
            return;
        }

        if message
            .entries
            .first()
            .is_some_and(|e| e.entry_type.is_special_request())
        {
            self.process_special_request(&message, source);
            return;
        }

        // Short-lived table lookup; the endpoint processes outside the lock.
        let handler = self.endpoint(message.header.receiver_endpoint);
        match handler {
            Some(handler) => {
                handler.endpoint().note_received();
                handler.message_received(message);
            }
            None => {
                log::debug!(
                    "[Node::message_received] unknown endpoint {}",
                    message.header.receiver_endpoint
                );
                self.send_error_reply(
                    &message,
                    source,
                    &Error::InvalidEndpoint(format!(
                        "endpoint {}",
                        message.header.receiver_endpoint
                    )),
                );
            }
        }
    }

    /// Outbound message entry point. The sender endpoint must be live and
    /// its transport still registered.
    pub fn send_message(&self, message: Message) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::InvalidOperation("node is shut down".to_string()));
        }
        if message.header.sender_node_id != self.node_id() {
            // Hard precondition: a mismatched sender id is a programming
            // error in the caller, not a routing condition.
            return Err(Error::InternalError(
                "send_message called with foreign sender node id".to_string(),
            ));
        }

        let handler = self
            .endpoint(message.header.sender_endpoint)
            .ok_or_else(|| {
                Error::InvalidEndpoint(format!(
                    "sender endpoint {}",
                    message.header.sender_endpoint
                ))
            })?;

        let transport_id = handler.endpoint().transport_id();
        if !self.transports.contains_key(&transport_id) {
            return Err(Error::ConnectionError(format!(
                "transport {} has been removed",
                transport_id
            )));
        }

        handler.endpoint().connection()?.send_message(message)
    }

    /// Wrap one entry in a message and send it from `local_endpoint`.
    pub(crate) fn send_entry(
        &self,
        local_endpoint: u32,
        entry: MessageEntry,
        unreliable: bool,
    ) -> Result<()> {
        let handler = self
            .endpoint(local_endpoint)
            .ok_or_else(|| Error::InvalidEndpoint(format!("endpoint {}", local_endpoint)))?;
        handler.endpoint().send_entry(entry, unreliable)
    }

    /// Synthesize error responses for every request entry of `message` and
    /// send them back through the originating connection. Never throws
    /// across the transport boundary.
    fn send_error_reply(&self, message: &Message, source: &TransportSource, err: &Error) {
        let mut reply = Message::new();
        reply.header.sender_node_id = self.node_id();
        reply.header.sender_node_name = self.node_name();
        reply.header.sender_endpoint = message.header.receiver_endpoint;
        reply.header.receiver_node_id = message.header.sender_node_id;
        reply.header.receiver_node_name = message.header.sender_node_name.clone();
        reply.header.receiver_endpoint = message.header.sender_endpoint;

        for entry in &message.entries {
            if entry.entry_type.is_request() {
                reply.entries.push(entry.make_error_response(err));
            }
        }
        if reply.entries.is_empty() {
            return;
        }
        if let Err(send_err) = source.connection.send_message(reply) {
            log::debug!("[Node::send_error_reply] reply failed: {}", send_err);
        }
    }

    // ========================================================================
    // Special requests (node-to-node control plane)
    // ========================================================================

    fn process_special_request(&self, message: &Message, source: &TransportSource) {
        let mut reply = Message::new();
        let mut reply_sender_endpoint = message.header.receiver_endpoint;

        for entry in &message.entries {
            let result = if entry.entry_type.is_special_request() {
                self.handle_special_entry(entry, message, source, &mut reply_sender_endpoint)
            } else {
                Err(Error::ProtocolError(format!(
                    "{:?} entry batched with special requests",
                    entry.entry_type
                )))
            };
            match result {
                Ok(resp) => reply.entries.push(resp),
                Err(err) => {
                    log::debug!(
                        "[Node::process_special_request] {:?} failed: {}",
                        entry.entry_type,
                        err
                    );
                    reply.entries.push(entry.make_error_response(&err));
                }
            }
        }

        reply.header.sender_node_id = self.node_id();
        reply.header.sender_node_name = self.node_name();
        reply.header.sender_endpoint = reply_sender_endpoint;
        reply.header.receiver_node_id = message.header.sender_node_id;
        reply.header.receiver_node_name = message.header.sender_node_name.clone();
        reply.header.receiver_endpoint = message.header.sender_endpoint;

        if let Err(err) = source.connection.send_message(reply) {
            log::debug!("[Node::process_special_request] reply failed: {}", err);
        }
    }

    fn handle_special_entry(
        &self,
        entry: &MessageEntry,
        message: &Message,
        source: &TransportSource,
        reply_sender_endpoint: &mut u32,
    ) -> Result<MessageEntry> {
        use crate::message::EntryType;

        match entry.entry_type {
            EntryType::GetNodeInfo => {
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "nodeid",
                    ElementData::Str(self.node_id().to_string()),
                ));
                resp.add_element(MessageElement::new(
                    "nodename",
                    ElementData::Str(self.node_name()),
                ));
                Ok(resp)
            }
            EntryType::ConnectionTest => entry.make_response(),
            EntryType::NodeCheckCapability => {
                let name = entry.element_or_err("capability")?.data.as_str()?.to_string();
                let value = match name.as_str() {
                    CAPABILITY_CONNECT_COMBINED | CAPABILITY_PIPE_UNRELIABLE
                    | CAPABILITY_CODEC_V4 => 1u32,
                    _ => 0u32,
                };
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new("value", ElementData::scalar_u32(value)));
                Ok(resp)
            }
            EntryType::ObjectTypeName => {
                let ctx = self.service_for_path(&entry.service_path)?;
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "objecttype",
                    ElementData::Str(ctx.object_type()),
                ));
                Ok(resp)
            }
            EntryType::GetServiceDesc => {
                let ctx = self.service_for_path(&entry.service_path)?;
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "servicedef",
                    ElementData::Str(ctx.service_def()),
                ));
                Ok(resp)
            }
            EntryType::GetServiceAttributes => {
                let ctx = self.service_for_path(&entry.service_path)?;
                let mut resp = entry.make_response()?;
                resp.add_element(MessageElement::new(
                    "attributes",
                    ElementData::Map(ctx.attributes()),
                ));
                Ok(resp)
            }
            EntryType::ConnectClient | EntryType::ConnectClientCombined => {
                self.handle_connect_client(entry, message, source, reply_sender_endpoint)
            }
            EntryType::DisconnectClient => {
                let ctx = self.service_for_path(&entry.service_path)?;
                let endpoint = message.header.receiver_endpoint;
                ctx.client_disconnected(endpoint);
                // Table removal only: the client owns the transport
                // connection and closes it after it sees our reply.
                self.delete_endpoint(endpoint);
                entry.make_response()
            }
            other => Err(Error::ProtocolError(format!(
                "unhandled special request {:?}",
                other
            ))),
        }
    }

    fn service_for_path(&self, service_path: &str) -> Result<Arc<ServerContext>> {
        let root = service_root(service_path);
        self.service(root)
            .ok_or_else(|| Error::ServiceNotFound(root.to_string()))
    }

    fn handle_connect_client(
        &self,
        entry: &MessageEntry,
        message: &Message,
        source: &TransportSource,
        reply_sender_endpoint: &mut u32,
    ) -> Result<MessageEntry> {
        use crate::endpoint::server::ServerEndpoint;
        use crate::message::EntryType;

        let service_name = service_root(&entry.service_path).to_string();
        let ctx = self
            .service(&service_name)
            .ok_or_else(|| Error::ServiceNotFound(service_name.clone()))?;

        // Authenticate before any endpoint state is created.
        let user = if ctx.requires_auth() {
            let username = entry
                .element("username")
                .ok_or_else(|| {
                    Error::AuthenticationError("service requires credentials".to_string())
                })?
                .data
                .as_str()?
                .to_string();
            let credentials = match entry.element("credentials") {
                Some(el) => el.data.as_elements()?.to_vec(),
                None => Vec::new(),
            };
            Some(ctx.authenticate(&username, &credentials)?)
        } else {
            None
        };

        let node = self.arc()?;
        let mut created = None;
        let (endpoint_id, _) = self.register_endpoint(|id| {
            let se = ServerEndpoint::new(&node, id, &service_name);
            created = Some(se.clone());
            se as Arc<dyn EndpointHandler>
        })?;
        let se = created.ok_or_else(|| {
            Error::InternalError("server endpoint factory did not run".to_string())
        })?;

        se.endpoint()
            .set_connection(source.connection.clone(), source.transport_id);
        se.endpoint().set_remote_endpoint(message.header.sender_endpoint);
        se.endpoint().set_remote_node_id(message.header.sender_node_id);
        se.endpoint()
            .set_remote_node_name(message.header.sender_node_name.clone());
        se.set_user(user.clone());
        source.connection.attach_endpoint(endpoint_id);
        ctx.client_connected(endpoint_id, user);

        // The reply header's sender endpoint teaches the client its peer id.
        *reply_sender_endpoint = endpoint_id;

        let mut resp = entry.make_response()?;
        resp.add_element(MessageElement::new(
            "objecttype",
            ElementData::Str(ctx.object_type()),
        ));
        if entry.entry_type == EntryType::ConnectClientCombined
            && entry.element("returnservicedef").is_some()
        {
            resp.add_element(MessageElement::new(
                "servicedef",
                ElementData::Str(ctx.service_def()),
            ));
        }
        log::debug!(
            "[Node::handle_connect_client] client endpoint {} connected to \"{}\"",
            endpoint_id,
            service_name
        );
        Ok(resp)
    }

    // ========================================================================
    // Client connections
    // ========================================================================

    /// Connect to a remote service (blocking).
    pub fn connect_service(self: &Arc<Self>, url: &str) -> Result<Arc<ClientContext>> {
        self.connect_service_with(url, None, Vec::new())
    }

    /// Connect with credentials (blocking).
    pub fn connect_service_with(
        self: &Arc<Self>,
        url: &str,
        username: Option<&str>,
        credentials: Vec<MessageElement>,
    ) -> Result<Arc<ClientContext>> {
        use crate::sync::AutoResetEvent;

        let done = Arc::new(AutoResetEvent::new());
        let slot: Arc<Mutex<Option<Result<Arc<ClientContext>>>>> = Arc::new(Mutex::new(None));

        let done2 = Arc::clone(&done);
        let slot2 = Arc::clone(&slot);
        self.async_connect_service(
            url,
            username,
            credentials,
            Box::new(move |result| {
                *slot2.lock() = Some(result);
                done2.set();
            }),
        )?;

        done.wait_one(None);
        let result = slot
            .lock()
            .take()
            .unwrap_or_else(|| Err(Error::InternalError("connect completed empty".to_string())));
        result
    }

    /// Connect to a remote service; the handler observes the outcome.
    pub fn async_connect_service(
        self: &Arc<Self>,
        url: &str,
        username: Option<&str>,
        credentials: Vec<MessageElement>,
        handler: ConnectHandler,
    ) -> Result<()> {
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("node is shut down".to_string()));
        }
        let parsed = parse_connection_url(url)?;
        ClientContext::async_connect(self, parsed, username, credentials, handler);
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// True once [`Node::shutdown`] has completed.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Register a callback fired at the end of shutdown.
    pub fn add_shutdown_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown_listeners.lock().push(Box::new(listener));
    }

    /// Idempotent one-shot shutdown.
    ///
    /// Order: close services, close remaining endpoints, clear the endpoint
    /// table, close transports, stop the cleanup timer and timer queue,
    /// drain and stop the worker pool, fire shutdown listeners. Requests
    /// outstanding at shutdown complete with an error before the pool stops.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[Node::shutdown] begin");

        // Services first: their client endpoints get closed through the
        // server contexts.
        let service_names: Vec<String> =
            self.services.iter().map(|e| e.key().clone()).collect();
        for name in service_names {
            if let Some((_, ctx)) = self.services.remove(&name) {
                ctx.close();
            }
        }

        // Remaining endpoints (client contexts). Forced teardown completes
        // every outstanding request with an error.
        let endpoint_ids: Vec<u32> = self.endpoints.iter().map(|e| *e.key()).collect();
        for id in endpoint_ids {
            if let Some((_, handler)) = self.endpoints.remove(&id) {
                handler.force_close();
            }
        }
        self.endpoints.clear();
        self.recent_endpoints.lock().clear();

        let transport_ids: Vec<u32> = self.transports.iter().map(|e| *e.key()).collect();
        for id in transport_ids {
            if let Some((_, transport)) = self.transports.remove(&id) {
                transport.close();
            }
        }

        if let Some(timer) = self.cleanup_timer.lock().take() {
            timer.cancel();
        }
        if let Some(timers) = self.timer_queue.lock().take() {
            timers.shutdown();
        }
        if let Some(pool) = self.thread_pool.lock().take() {
            pool.shutdown();
        }

        self.is_shutdown.store(true, Ordering::Release);

        let listeners = std::mem::take(&mut *self.shutdown_listeners.lock());
        for listener in listeners {
            listener();
        }
        log::debug!("[Node::shutdown] complete");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::message::Message;

    struct NullHandler {
        ep: Endpoint,
    }

    impl EndpointHandler for NullHandler {
        fn endpoint(&self) -> &Endpoint {
            &self.ep
        }
        fn message_received(&self, _message: Message) {}
        fn transport_connection_closed(&self, _reason: Option<Error>) {}
        fn force_close(&self) {}
    }

    fn register_null_endpoint(node: &Arc<Node>) -> u32 {
        let node2 = node.clone();
        let (id, _) = node
            .register_endpoint(move |id| {
                Arc::new(NullHandler {
                    ep: Endpoint::new(&node2, id),
                }) as Arc<dyn EndpointHandler>
            })
            .expect("register endpoint");
        id
    }

    #[test]
    fn node_id_is_stable_once_read() {
        let node = Node::new();
        let id = node.node_id();
        assert_eq!(node.node_id(), id);
        assert!(node.set_node_id(NodeId::random()).is_err());
        node.shutdown();
    }

    #[test]
    fn explicit_node_id_wins() {
        let node = Node::new();
        let id = NodeId::random();
        node.set_node_id(id).expect("set id before first read");
        assert_eq!(node.node_id(), id);
        node.shutdown();
    }

    #[test]
    fn endpoint_ids_are_distinct() {
        let node = Node::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let id = register_null_endpoint(&node);
            assert!(seen.insert(id), "endpoint id {} reused", id);
            assert_ne!(id, 0);
        }
        assert_eq!(node.endpoint_count(), 64);
        node.shutdown();
    }

    #[test]
    fn deleted_endpoint_id_enters_retention() {
        let node = Node::new();
        let id = register_null_endpoint(&node);
        node.delete_endpoint(id);
        assert!(node.endpoint(id).is_none());
        assert!(node.endpoint_recently_freed(id));
        node.shutdown();
    }

    #[test]
    fn send_message_rejects_foreign_sender_node() {
        let node = Node::new();
        let mut message = Message::new();
        message.header.sender_node_id = NodeId::random();
        let err = node.send_message(message).expect_err("foreign sender id");
        assert!(matches!(err, Error::InternalError(_)));
        node.shutdown();
    }

    #[test]
    fn send_message_rejects_unknown_endpoint() {
        let node = Node::new();
        let mut message = Message::new();
        message.header.sender_node_id = node.node_id();
        message.header.sender_endpoint = 12345;
        let err = node.send_message(message).expect_err("unknown endpoint");
        assert!(matches!(err, Error::InvalidEndpoint(_)));
        node.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_fails_fast_afterwards() {
        let node = Node::new();
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let f = Arc::clone(&fired);
        node.add_shutdown_listener(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        node.shutdown();
        node.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(node.is_shutdown());

        let mut message = Message::new();
        message.header.sender_node_id = node.node_id();
        assert!(matches!(
            node.send_message(message),
            Err(Error::InvalidOperation(_))
        ));
        assert!(node.connect_service("rr+intra:///?service=x&nodename=y").is_err());
    }

    #[test]
    fn thread_pool_lazy_init_uses_config() {
        let node = Node::with_config(NodeConfig::new().with_thread_pool_size(2));
        let pool = node.thread_pool().expect("pool");
        assert_eq!(pool.thread_count(), 2);
        node.shutdown();
    }
}
