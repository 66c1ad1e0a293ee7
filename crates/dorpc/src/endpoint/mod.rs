// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Endpoint base abstraction.
//!
//! An [`Endpoint`] represents one logical connection to a remote party,
//! identified by a 32-bit id unique within the owning node's endpoint table.
//! The node owns every endpoint through `Arc<dyn EndpointHandler>`; all
//! other components hold `(Weak<Node>, endpoint id)` and resolve through the
//! node on each use, so a torn-down endpoint is observed as a lookup miss
//! instead of a dangling reference.

pub mod client;
pub mod server;

use crate::error::{Error, Result};
use crate::message::{Message, MessageEntry, MessageHeader, NodeId, MESSAGE_FLAG_UNRELIABLE};
use crate::node::Node;
use crate::transport::TransportConnection;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Behavior shared by both roles of an endpoint (client context and server
/// endpoint). The node dispatches inbound messages and lifecycle events
/// through this trait.
pub trait EndpointHandler: Send + Sync {
    /// Base endpoint state.
    fn endpoint(&self) -> &Endpoint;

    /// Inbound message addressed to this endpoint. Runs outside the node's
    /// table lock; entry order within the message must be preserved.
    fn message_received(&self, message: Message);

    /// The transport connection carrying this endpoint was lost.
    fn transport_connection_closed(&self, reason: Option<Error>);

    /// Forced local teardown (node shutdown, table eviction). Must be
    /// idempotent and must not require network traffic.
    fn force_close(&self);
}

/// Base state of one logical connection.
pub struct Endpoint {
    node: Weak<Node>,
    local_endpoint: u32,
    remote_endpoint: AtomicU32,
    remote_node_id: Mutex<NodeId>,
    remote_node_name: Mutex<String>,
    transport_id: AtomicU32,
    connection: Mutex<Option<Arc<dyn TransportConnection>>>,
    last_message_received: Mutex<Instant>,
    last_message_sent: Mutex<Instant>,
}

impl Endpoint {
    pub(crate) fn new(node: &Arc<Node>, local_endpoint: u32) -> Self {
        Self {
            node: Arc::downgrade(node),
            local_endpoint,
            remote_endpoint: AtomicU32::new(0),
            remote_node_id: Mutex::new(NodeId::ANY),
            remote_node_name: Mutex::new(String::new()),
            transport_id: AtomicU32::new(0),
            connection: Mutex::new(None),
            last_message_received: Mutex::new(Instant::now()),
            last_message_sent: Mutex::new(Instant::now()),
        }
    }

    /// Id of this endpoint in the owning node's table.
    #[must_use]
    pub fn local_endpoint(&self) -> u32 {
        self.local_endpoint
    }

    /// Peer endpoint id (0 until the connect handshake learns it).
    #[must_use]
    pub fn remote_endpoint(&self) -> u32 {
        self.remote_endpoint.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_endpoint(&self, id: u32) {
        self.remote_endpoint.store(id, Ordering::Release);
    }

    /// Peer node id.
    #[must_use]
    pub fn remote_node_id(&self) -> NodeId {
        *self.remote_node_id.lock()
    }

    pub(crate) fn set_remote_node_id(&self, id: NodeId) {
        *self.remote_node_id.lock() = id;
    }

    /// Peer node name.
    #[must_use]
    pub fn remote_node_name(&self) -> String {
        self.remote_node_name.lock().clone()
    }

    pub(crate) fn set_remote_node_name(&self, name: String) {
        *self.remote_node_name.lock() = name;
    }

    /// Registration id of the transport carrying this endpoint.
    #[must_use]
    pub fn transport_id(&self) -> u32 {
        self.transport_id.load(Ordering::Acquire)
    }

    /// Owning node, or an error once the node has been released.
    pub(crate) fn node(&self) -> Result<Arc<Node>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("node has been released".to_string()))
    }

    pub(crate) fn weak_node(&self) -> Weak<Node> {
        self.node.clone()
    }

    /// Bind the transport connection carrying this endpoint.
    pub(crate) fn set_connection(&self, connection: Arc<dyn TransportConnection>, transport_id: u32) {
        self.transport_id.store(transport_id, Ordering::Release);
        *self.connection.lock() = Some(connection);
    }

    /// Current transport connection.
    pub(crate) fn connection(&self) -> Result<Arc<dyn TransportConnection>> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| Error::ConnectionError("endpoint has no transport connection".to_string()))
    }

    /// Drop the connection binding (teardown).
    pub(crate) fn take_connection(&self) -> Option<Arc<dyn TransportConnection>> {
        self.connection.lock().take()
    }

    /// Stamp routing fields on an outgoing header.
    pub(crate) fn stamp_header(&self, header: &mut MessageHeader, node: &Node) {
        header.sender_node_id = node.node_id();
        header.sender_node_name = node.node_name();
        header.sender_endpoint = self.local_endpoint;
        header.receiver_node_id = self.remote_node_id();
        header.receiver_node_name = self.remote_node_name();
        header.receiver_endpoint = self.remote_endpoint();
    }

    /// Stamp and send a message through the owning node.
    pub(crate) fn send_message(&self, mut message: Message) -> Result<()> {
        let node = self.node()?;
        self.stamp_header(&mut message.header, &node);
        node.send_message(message)?;
        *self.last_message_sent.lock() = Instant::now();
        Ok(())
    }

    /// Wrap one entry in a message and send it.
    pub(crate) fn send_entry(&self, entry: MessageEntry, unreliable: bool) -> Result<()> {
        let mut message = Message::from_entry(entry);
        if unreliable {
            message.header.flags |= MESSAGE_FLAG_UNRELIABLE;
        }
        self.send_message(message)
    }

    /// Record inbound traffic for inactivity accounting.
    pub(crate) fn note_received(&self) {
        *self.last_message_received.lock() = Instant::now();
    }

    /// Instant of the most recent inbound message.
    #[must_use]
    pub fn last_message_received(&self) -> Instant {
        *self.last_message_received.lock()
    }

    /// Instant of the most recent outbound message.
    #[must_use]
    pub fn last_message_sent(&self) -> Instant {
        *self.last_message_sent.lock()
    }
}
