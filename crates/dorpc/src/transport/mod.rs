// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Transport layer interfaces.
//!
//! The core never assumes a specific transport: it requires message-in /
//! message-out semantics plus connection-closed notification, expressed by
//! [`Transport`] (per-scheme factory registered on a node) and
//! [`TransportConnection`] (one live connection). Concrete network transports
//! (TCP, websocket, local socket) plug in behind these traits; this crate
//! ships the in-process [`intra::IntraTransport`] used by same-process node
//! pairs and the test suite.

pub mod intra;
mod url;

pub use url::{parse_connection_url, ParsedUrl};

use crate::error::Result;
use crate::message::Message;
use std::sync::Arc;

/// Completion callback for [`TransportConnection::async_send_message`].
pub type SendHandler = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Origin of an inbound message: which transport registration it entered
/// through and the connection it arrived on. The node needs the connection
/// to reply to pre-connect special requests and to bind freshly created
/// server endpoints.
#[derive(Clone)]
pub struct TransportSource {
    pub transport_id: u32,
    pub connection: Arc<dyn TransportConnection>,
}

/// Per-scheme transport registered on a node.
pub trait Transport: Send + Sync {
    /// URL scheme served by this transport (for example `rr+intra`).
    fn scheme(&self) -> &str;

    /// True when this transport can originate connections.
    fn is_client(&self) -> bool;

    /// True when this transport accepts connections.
    fn is_server(&self) -> bool;

    /// Registration id assigned by the node.
    fn transport_id(&self) -> u32;

    /// Called once by the node at registration time.
    fn set_transport_id(&self, id: u32);

    /// True when this transport can service the given parsed URL.
    fn can_connect_url(&self, url: &ParsedUrl) -> bool;

    /// Open a connection for a client endpoint.
    fn create_transport_connection(
        &self,
        url: &ParsedUrl,
        local_endpoint: u32,
    ) -> Result<Arc<dyn TransportConnection>>;

    /// Close every connection owned by this transport.
    fn close(&self);
}

/// One live connection carrying messages for a pair of endpoints.
pub trait TransportConnection: Send + Sync {
    /// Deliver a message to the remote node. Fails with a connection error
    /// when the connection has been closed.
    fn send_message(&self, message: Message) -> Result<()>;

    /// Asynchronous send; the handler observes the delivery outcome.
    fn async_send_message(&self, message: Message, handler: SendHandler);

    /// Probe liveness without sending.
    fn check_connection(&self) -> Result<()>;

    /// Close the connection and notify both sides' endpoints.
    fn close(&self);

    /// Local endpoint id bound to this connection (0 before binding).
    fn local_endpoint(&self) -> u32;

    /// Remote endpoint id, when known.
    fn remote_endpoint(&self) -> u32;

    /// Bind a freshly registered endpoint to this connection. Called by the
    /// node when a `ConnectClient` special request creates a server
    /// endpoint on an incoming connection.
    fn attach_endpoint(&self, local_endpoint: u32);
}

impl std::fmt::Debug for dyn TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("local_endpoint", &self.local_endpoint())
            .field("remote_endpoint", &self.remote_endpoint())
            .finish()
    }
}
