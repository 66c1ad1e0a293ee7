// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Server-side endpoint context.
//!
//! One [`ServerContext`] exists per registered service; one
//! [`ServerEndpoint`] exists per connected client. The server endpoint
//! routes member operations to the service skeleton and batches the
//! responses for one inbound message into one reply message, preserving
//! entry order.
//!
//! "Current endpoint" and "current user" are not thread-local state: the
//! dispatch path threads them explicitly through [`SkelRequest`].

use super::{Endpoint, EndpointHandler};
use crate::error::{Error, Result};
use crate::message::{EntryType, Message, MessageElement, MessageEntry};
use crate::node::Node;
use crate::pipe::PipeServer;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Root service name of a service path ("camera.lens" -> "camera").
pub(crate) fn service_root(service_path: &str) -> &str {
    service_path.split('.').next().unwrap_or(service_path)
}

/// True when `service_path` equals `lock_path` or lies in its subtree.
fn path_covers(lock_path: &str, service_path: &str) -> bool {
    service_path == lock_path
        || (service_path.len() > lock_path.len()
            && service_path.starts_with(lock_path)
            && service_path.as_bytes()[lock_path.len()] == b'.')
}

/// Explicit per-call context handed to skeleton dispatch.
pub struct SkelRequest<'a> {
    /// Local endpoint id of the calling client.
    pub endpoint: u32,
    /// Target object path.
    pub service_path: &'a str,
    /// Target member.
    pub member_name: &'a str,
    /// Authenticated username, when the service requires authentication.
    pub user: Option<&'a str>,
}

/// Server-side dispatcher for one service object tree.
///
/// Implementations unpack the request entry, perform the operation, and
/// build the response entry (usually starting from
/// [`MessageEntry::make_response`]). Generated skeletons implement this
/// trait; hand-written ones are equally valid.
pub trait ServiceSkel: Send + Sync {
    /// Qualified type of the service root object.
    fn object_type(&self) -> &str;

    /// Dispatch one member operation.
    fn call(&self, request: &SkelRequest<'_>, entry: &MessageEntry) -> Result<MessageEntry>;
}

/// Authenticated identity attached to a client endpoint.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub username: String,
    pub privileges: Vec<String>,
}

/// Credential check hook installed on a service.
pub trait UserAuthenticator: Send + Sync {
    /// Validate credentials; an `Err` rejects the connect handshake.
    fn authenticate(
        &self,
        username: &str,
        credentials: &[MessageElement],
    ) -> Result<AuthenticatedUser>;
}

/// One registered service: skeleton, per-client lifecycle, attributes,
/// authentication, and object locks.
pub struct ServerContext {
    node: Weak<Node>,
    service_name: String,
    skel: Arc<dyn ServiceSkel>,
    service_def: Mutex<String>,
    attributes: Mutex<Vec<MessageElement>>,
    authenticator: Mutex<Option<Arc<dyn UserAuthenticator>>>,
    clients: Mutex<HashSet<u32>>,
    /// service path -> endpoint holding the lock.
    object_locks: Mutex<HashMap<String, u32>>,
    pipe_servers: Mutex<HashMap<(String, String), Arc<PipeServer>>>,
    closed: AtomicBool,
}

impl ServerContext {
    pub(crate) fn new(node: &Arc<Node>, service_name: &str, skel: Arc<dyn ServiceSkel>) -> Arc<Self> {
        Arc::new(Self {
            node: Arc::downgrade(node),
            service_name: service_name.to_string(),
            skel,
            service_def: Mutex::new(String::new()),
            attributes: Mutex::new(Vec::new()),
            authenticator: Mutex::new(None),
            clients: Mutex::new(HashSet::new()),
            object_locks: Mutex::new(HashMap::new()),
            pipe_servers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn node(&self) -> Result<Arc<Node>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("node has been released".to_string()))
    }

    /// Service name this context was registered under.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Qualified type of the root object.
    pub fn object_type(&self) -> String {
        self.skel.object_type().to_string()
    }

    /// Service definition text served to clients (opaque to the core).
    pub fn service_def(&self) -> String {
        self.service_def.lock().clone()
    }

    /// Install the service definition text.
    pub fn set_service_def(&self, def: &str) {
        *self.service_def.lock() = def.to_string();
    }

    /// Service attribute elements served by `GetServiceAttributes`.
    pub fn attributes(&self) -> Vec<MessageElement> {
        self.attributes.lock().clone()
    }

    /// Replace the service attributes.
    pub fn set_attributes(&self, attributes: Vec<MessageElement>) {
        *self.attributes.lock() = attributes;
    }

    /// Require authentication for new clients.
    pub fn set_authenticator(&self, authenticator: Arc<dyn UserAuthenticator>) {
        *self.authenticator.lock() = Some(authenticator);
    }

    /// True when connects must carry credentials.
    pub fn requires_auth(&self) -> bool {
        self.authenticator.lock().is_some()
    }

    pub(crate) fn authenticate(
        &self,
        username: &str,
        credentials: &[MessageElement],
    ) -> Result<AuthenticatedUser> {
        let authenticator = self.authenticator.lock().clone().ok_or_else(|| {
            Error::InternalError("authenticate called without authenticator".to_string())
        })?;
        authenticator.authenticate(username, credentials)
    }

    /// Register a pipe member server. Must happen before clients connect to
    /// the pipe.
    pub fn register_pipe(&self, pipe: Arc<PipeServer>) -> Result<()> {
        let key = (
            pipe.service_path().to_string(),
            pipe.member_name().to_string(),
        );
        let mut pipes = self.pipe_servers.lock();
        if pipes.contains_key(&key) {
            return Err(Error::InvalidOperation(format!(
                "pipe member {}.{} already registered",
                key.0, key.1
            )));
        }
        pipes.insert(key, pipe);
        Ok(())
    }

    fn pipe_server(&self, service_path: &str, member_name: &str) -> Result<Arc<PipeServer>> {
        self.pipe_servers
            .lock()
            .get(&(service_path.to_string(), member_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::MemberNotFound(format!("pipe member {}.{}", service_path, member_name))
            })
    }

    /// Connected client endpoint count.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub(crate) fn client_connected(&self, endpoint: u32, user: Option<AuthenticatedUser>) {
        self.clients.lock().insert(endpoint);
        log::debug!(
            "[ServerContext::client_connected] \"{}\" client {} (user {:?})",
            self.service_name,
            endpoint,
            user.as_ref().map(|u| u.username.as_str())
        );
    }

    /// Per-client cleanup: locks released, pipe endpoints closed. Idempotent.
    pub(crate) fn client_disconnected(&self, endpoint: u32) {
        if !self.clients.lock().remove(&endpoint) {
            return;
        }
        self.object_locks.lock().retain(|_, owner| *owner != endpoint);
        let pipes: Vec<Arc<PipeServer>> =
            self.pipe_servers.lock().values().cloned().collect();
        for pipe in pipes {
            pipe.endpoint_closed(endpoint);
        }
        log::debug!(
            "[ServerContext::client_disconnected] \"{}\" client {}",
            self.service_name,
            endpoint
        );
    }

    // ========================================================================
    // Object locks
    // ========================================================================

    fn lock_object(&self, service_path: &str, endpoint: u32) -> Result<()> {
        let mut locks = self.object_locks.lock();
        for (path, owner) in locks.iter() {
            if *owner != endpoint
                && (path_covers(path, service_path) || path_covers(service_path, path))
            {
                return Err(Error::ObjectLocked(format!(
                    "{} locked by endpoint {}",
                    path, owner
                )));
            }
        }
        locks.insert(service_path.to_string(), endpoint);
        Ok(())
    }

    fn unlock_object(&self, service_path: &str, endpoint: u32) -> Result<()> {
        let mut locks = self.object_locks.lock();
        match locks.get(service_path) {
            Some(owner) if *owner == endpoint => {
                locks.remove(service_path);
                Ok(())
            }
            Some(owner) => Err(Error::ObjectLocked(format!(
                "{} locked by endpoint {}",
                service_path, owner
            ))),
            None => Err(Error::InvalidOperation(format!(
                "{} is not locked",
                service_path
            ))),
        }
    }

    fn check_lock(&self, service_path: &str, endpoint: u32) -> Result<()> {
        let locks = self.object_locks.lock();
        for (path, owner) in locks.iter() {
            if *owner != endpoint && path_covers(path, service_path) {
                return Err(Error::ObjectLocked(format!(
                    "{} locked by endpoint {}",
                    path, owner
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route one entry. `Ok(None)` means the entry produces no direct
    /// response (pipe packets, acks, close notifications).
    pub(crate) fn dispatch(
        &self,
        entry: &MessageEntry,
        endpoint: u32,
        user: Option<&str>,
    ) -> Result<Option<MessageEntry>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ServiceNotFound(self.service_name.clone()));
        }

        match entry.entry_type {
            EntryType::ObjectLockReq => {
                self.lock_object(&entry.service_path, endpoint)?;
                entry.make_response().map(Some)
            }
            EntryType::ObjectUnlockReq => {
                self.unlock_object(&entry.service_path, endpoint)?;
                entry.make_response().map(Some)
            }
            EntryType::PipeConnectReq => {
                let pipe = self.pipe_server(&entry.service_path, &entry.member_name)?;
                pipe.connect_requested(endpoint, entry).map(Some)
            }
            EntryType::PipeDisconnectReq => {
                let pipe = self.pipe_server(&entry.service_path, &entry.member_name)?;
                pipe.disconnect_requested(endpoint, entry).map(Some)
            }
            EntryType::PipePacket => {
                let pipe = self.pipe_server(&entry.service_path, &entry.member_name)?;
                pipe.packet_received(endpoint, entry);
                Ok(None)
            }
            EntryType::PipePacketRet => {
                let pipe = self.pipe_server(&entry.service_path, &entry.member_name)?;
                pipe.ack_received(endpoint, entry);
                Ok(None)
            }
            EntryType::PipeClosed => {
                let pipe = self.pipe_server(&entry.service_path, &entry.member_name)?;
                pipe.remote_closed(endpoint, entry);
                Ok(None)
            }
            EntryType::PipeClosedRet => {
                let pipe = self.pipe_server(&entry.service_path, &entry.member_name)?;
                pipe.closed_ret(endpoint, entry);
                Ok(None)
            }
            EntryType::PropertyGetReq
            | EntryType::PropertySetReq
            | EntryType::FunctionCallReq
            | EntryType::GeneratorNextReq => {
                self.check_lock(&entry.service_path, endpoint)?;
                let request = SkelRequest {
                    endpoint,
                    service_path: &entry.service_path,
                    member_name: &entry.member_name,
                    user,
                };
                self.skel.call(&request, entry).map(Some)
            }
            t if t.is_response() => {
                log::debug!("[ServerContext::dispatch] ignored response {:?}", t);
                Ok(None)
            }
            other => Err(Error::ProtocolError(format!(
                "entry type {:?} not valid for a service endpoint",
                other
            ))),
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Fire an event entry at every connected client. A failing client is
    /// logged and skipped; the fan-out continues.
    pub fn send_event(
        &self,
        service_path: &str,
        member_name: &str,
        elements: Vec<MessageElement>,
    ) {
        let Ok(node) = self.node() else {
            return;
        };
        let mut entry = MessageEntry::with_member(EntryType::EventReq, service_path, member_name);
        entry.elements = elements;

        let clients: Vec<u32> = self.clients.lock().iter().copied().collect();
        for endpoint in clients {
            if let Err(err) = node.send_entry(endpoint, entry.clone(), false) {
                log::debug!(
                    "[ServerContext::send_event] client {} skipped: {}",
                    endpoint,
                    err
                );
                node.handle_exception(&err);
            }
        }
    }

    /// Close the service: every connected client endpoint is torn down.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let clients: Vec<u32> = self.clients.lock().iter().copied().collect();
        if let Ok(node) = self.node() {
            for endpoint in clients {
                self.client_disconnected(endpoint);
                node.close_endpoint(endpoint);
            }
        }
        let pipes: Vec<Arc<PipeServer>> =
            std::mem::take(&mut *self.pipe_servers.lock()).into_values().collect();
        for pipe in pipes {
            pipe.shutdown();
        }
        log::debug!("[ServerContext::close] \"{}\" closed", self.service_name);
    }
}

/// Server-side endpoint for one connected client.
pub struct ServerEndpoint {
    ep: Endpoint,
    service_name: String,
    user: Mutex<Option<AuthenticatedUser>>,
}

impl ServerEndpoint {
    pub(crate) fn new(node: &Arc<Node>, local_endpoint: u32, service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            ep: Endpoint::new(node, local_endpoint),
            service_name: service_name.to_string(),
            user: Mutex::new(None),
        })
    }

    /// Service this client connected to.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub(crate) fn set_user(&self, user: Option<AuthenticatedUser>) {
        *self.user.lock() = user;
    }

    /// Authenticated user bound to this endpoint.
    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.user.lock().clone()
    }

    fn context(&self) -> Option<Arc<ServerContext>> {
        self.ep.node().ok()?.service(&self.service_name)
    }
}

impl EndpointHandler for ServerEndpoint {
    fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    fn message_received(&self, message: Message) {
        let endpoint = self.ep.local_endpoint();
        let user = self.user.lock().clone();
        let username = user.map(|u| u.username);

        let mut responses = Vec::new();
        for entry in &message.entries {
            let result = match self.context() {
                Some(ctx) if service_root(&entry.service_path) == self.service_name => {
                    ctx.dispatch(entry, endpoint, username.as_deref())
                }
                _ => Err(Error::ServiceNotFound(
                    service_root(&entry.service_path).to_string(),
                )),
            };
            match result {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(err) => {
                    log::debug!(
                        "[ServerEndpoint::message_received] {:?} failed: {}",
                        entry.entry_type,
                        err
                    );
                    if entry.entry_type.is_request() {
                        responses.push(entry.make_error_response(&err));
                    }
                }
            }
        }

        // Responses for one inbound message batch into one reply message.
        if !responses.is_empty() {
            let mut reply = Message::new();
            reply.entries = responses;
            if let Err(err) = self.ep.send_message(reply) {
                log::debug!("[ServerEndpoint::message_received] reply failed: {}", err);
            }
        }
    }

    fn transport_connection_closed(&self, reason: Option<Error>) {
        log::debug!(
            "[ServerEndpoint::transport_connection_closed] endpoint {}: {:?}",
            self.ep.local_endpoint(),
            reason
        );
        if let Some(ctx) = self.context() {
            ctx.client_disconnected(self.ep.local_endpoint());
        }
        self.ep.take_connection();
        if let Ok(node) = self.ep.node() {
            node.delete_endpoint(self.ep.local_endpoint());
        }
    }

    fn force_close(&self) {
        if let Some(ctx) = self.context() {
            ctx.client_disconnected(self.ep.local_endpoint());
        }
        // Closing the connection is what tells the remote client this
        // endpoint is gone (service closed, node shutting down).
        if let Some(connection) = self.ep.take_connection() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_root_splits_paths() {
        assert_eq!(service_root("camera"), "camera");
        assert_eq!(service_root("camera.lens.focus"), "camera");
        assert_eq!(service_root(""), "");
    }

    #[test]
    fn path_cover_rules() {
        assert!(path_covers("a.b", "a.b"));
        assert!(path_covers("a.b", "a.b.c"));
        assert!(!path_covers("a.b", "a.bc"));
        assert!(!path_covers("a.b.c", "a.b"));
        assert!(!path_covers("a.b", "z.b"));
    }
}
