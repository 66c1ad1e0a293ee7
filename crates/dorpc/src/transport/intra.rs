// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! In-process transport.
//!
//! Connects two nodes living in the same process without packing bytes: the
//! message tree is handed across directly and delivery is posted to the
//! receiving node's worker pool, so the sender never runs receiver code on
//! its own stack. Peers are discovered through a process-global name
//! registry; a node wanting to accept in-process clients calls
//! [`IntraTransport::start_server`] with its peer name.
//!
//! URL form: `rr+intra:///?service=NAME&nodename=PEER`.

use super::{ParsedUrl, SendHandler, Transport, TransportConnection, TransportSource};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::node::Node;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

struct IntraPeer {
    node: Weak<Node>,
    transport: Weak<IntraTransport>,
}

/// Process-global peer registry (one per process, like an OS socket
/// namespace).
fn intra_registry() -> &'static Mutex<HashMap<String, IntraPeer>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, IntraPeer>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// In-process transport; acts as client, server, or both.
pub struct IntraTransport {
    node: Weak<Node>,
    transport_id: AtomicU32,
    server_name: Mutex<Option<String>>,
    connections: Mutex<Vec<Weak<IntraConnection>>>,
    closed: AtomicBool,
}

impl IntraTransport {
    /// Create and register the transport on `node`.
    pub fn new(node: &Arc<Node>) -> Result<Arc<Self>> {
        let transport = Arc::new(Self {
            node: Arc::downgrade(node),
            transport_id: AtomicU32::new(0),
            server_name: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        node.register_transport(transport.clone())?;
        Ok(transport)
    }

    /// Accept in-process clients under `name`.
    pub fn start_server(self: &Arc<Self>, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty peer name".to_string()));
        }
        let mut registry = intra_registry().lock();
        if let Some(existing) = registry.get(name) {
            if existing.node.upgrade().is_some() {
                return Err(Error::InvalidOperation(format!(
                    "peer name \"{}\" already in use",
                    name
                )));
            }
        }
        registry.insert(
            name.to_string(),
            IntraPeer {
                node: self.node.clone(),
                transport: Arc::downgrade(self),
            },
        );
        *self.server_name.lock() = Some(name.to_string());
        log::debug!("[IntraTransport::start_server] accepting as \"{}\"", name);
        Ok(())
    }

    fn track(&self, connection: &Arc<IntraConnection>) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.upgrade().is_some());
        connections.push(Arc::downgrade(connection));
    }
}

impl Transport for IntraTransport {
    fn scheme(&self) -> &str {
        "rr+intra"
    }

    fn is_client(&self) -> bool {
        true
    }

    fn is_server(&self) -> bool {
        self.server_name.lock().is_some()
    }

    fn transport_id(&self) -> u32 {
        self.transport_id.load(Ordering::Acquire)
    }

    fn set_transport_id(&self, id: u32) {
        self.transport_id.store(id, Ordering::Release);
    }

    fn can_connect_url(&self, url: &ParsedUrl) -> bool {
        url.scheme == "rr+intra" && !self.closed.load(Ordering::Acquire)
    }

    fn create_transport_connection(
        &self,
        url: &ParsedUrl,
        local_endpoint: u32,
    ) -> Result<Arc<dyn TransportConnection>> {
        if url.node_name.is_empty() {
            return Err(Error::InvalidArgument(
                "rr+intra URL must name a peer via nodename".to_string(),
            ));
        }

        let (peer_node, peer_transport) = {
            let registry = intra_registry().lock();
            let peer = registry.get(&url.node_name).ok_or_else(|| {
                Error::ConnectionError(format!(
                    "in-process peer \"{}\" not found",
                    url.node_name
                ))
            })?;
            let node = peer.node.upgrade().ok_or_else(|| {
                Error::ConnectionError(format!(
                    "in-process peer \"{}\" has been released",
                    url.node_name
                ))
            })?;
            let transport = peer.transport.upgrade().ok_or_else(|| {
                Error::ConnectionError(format!(
                    "in-process peer \"{}\" transport closed",
                    url.node_name
                ))
            })?;
            (node, transport)
        };

        if let Some(expected) = url.node_id {
            let actual = peer_node.node_id();
            if expected != actual {
                return Err(Error::NodeNotFound(format!(
                    "peer \"{}\" has node id {}, URL pinned {}",
                    url.node_name, actual, expected
                )));
            }
        }

        let local = Arc::new(IntraConnection {
            node: self.node.clone(),
            transport_id: self.transport_id(),
            local_endpoint: AtomicU32::new(local_endpoint),
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let remote = Arc::new(IntraConnection {
            node: Arc::downgrade(&peer_node),
            transport_id: peer_transport.transport_id(),
            local_endpoint: AtomicU32::new(0),
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        *local.peer.lock() = Some(remote.clone());
        *remote.peer.lock() = Some(local.clone());

        self.track(&local);
        peer_transport.track(&remote);

        Ok(local)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(name) = self.server_name.lock().take() {
            intra_registry().lock().remove(&name);
        }
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in connections.into_iter().filter_map(|c| c.upgrade()) {
            connection.close();
        }
    }
}

impl Drop for IntraTransport {
    fn drop(&mut self) {
        if let Some(name) = self.server_name.lock().take() {
            intra_registry().lock().remove(&name);
        }
    }
}

/// One side of an in-process connection pair.
pub struct IntraConnection {
    /// Node on this side; inbound messages from the peer are delivered
    /// through it.
    node: Weak<Node>,
    transport_id: u32,
    local_endpoint: AtomicU32,
    peer: Mutex<Option<Arc<IntraConnection>>>,
    closed: AtomicBool,
}

impl IntraConnection {
    fn notify_endpoint_closed(&self) {
        let endpoint = self.local_endpoint.load(Ordering::Acquire);
        if endpoint == 0 {
            return;
        }
        let Some(node) = self.node.upgrade() else {
            return;
        };
        if let Some(handler) = node.endpoint(endpoint) {
            handler.transport_connection_closed(None);
        }
    }

    fn close_internal(&self, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peer = self.peer.lock().take();
        self.notify_endpoint_closed();
        if notify_peer {
            if let Some(peer) = peer {
                peer.close_internal(false);
            }
        }
    }
}

impl TransportConnection for IntraConnection {
    fn send_message(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionError("connection closed".to_string()));
        }
        let peer = self
            .peer
            .lock()
            .clone()
            .ok_or_else(|| Error::ConnectionError("connection closed".to_string()))?;
        let peer_node = peer.node.upgrade().ok_or_else(|| {
            Error::ConnectionError("peer node has been released".to_string())
        })?;

        // Delivery runs on the receiving node's worker pool: the sender
        // never executes receiver dispatch on its own stack.
        let source = TransportSource {
            transport_id: peer.transport_id,
            connection: peer.clone(),
        };
        let delivery_node = peer_node.clone();
        peer_node
            .post(move || {
                delivery_node.message_received(message, &source);
            })
            .map_err(|_| Error::ConnectionError("peer node shut down".to_string()))
    }

    fn async_send_message(&self, message: Message, handler: SendHandler) {
        let result = self.send_message(message);
        match self.node.upgrade() {
            Some(node) => node.post_handler(Box::new(move || handler(result))),
            None => handler(result),
        }
    }

    fn check_connection(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.peer.lock().is_none() {
            return Err(Error::ConnectionError("connection closed".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.close_internal(true);
    }

    fn local_endpoint(&self) -> u32 {
        self.local_endpoint.load(Ordering::Acquire)
    }

    fn remote_endpoint(&self) -> u32 {
        self.peer
            .lock()
            .as_ref()
            .map(|p| p.local_endpoint())
            .unwrap_or(0)
    }

    fn attach_endpoint(&self, local_endpoint: u32) {
        self.local_endpoint.store(local_endpoint, Ordering::Release);
    }
}
