// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Server side of a pipe member.
//!
//! Owns one [`PipeEndpoint`] per connected `(client endpoint, index)` pair.
//! The server picks the index on connect (disambiguating multiple endpoints
//! of the same pipe from one client) and swaps the direction: the server's
//! "read" serves the client's "write" and vice versa.

use super::{parse_pipe_packet_element, PipeEndpoint};
use crate::error::{Error, Result};
use crate::message::{ElementData, EntryType, MessageElement, MessageEntry};
use crate::node::Node;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type ConnectListener = Arc<dyn Fn(&Arc<PipeEndpoint>) + Send + Sync>;
type CloseListener = Arc<dyn Fn(u32, i32) + Send + Sync>;

/// Server-side pipe member.
pub struct PipeServer {
    node: Weak<Node>,
    service_path: String,
    member_name: String,
    unreliable_allowed: bool,
    endpoints: Mutex<HashMap<(u32, i32), Arc<PipeEndpoint>>>,
    connect_listener: Mutex<Option<ConnectListener>>,
    close_listener: Mutex<Option<CloseListener>>,
}

impl PipeServer {
    /// Create a pipe member server for `service_path.member_name`.
    #[must_use]
    pub fn new(
        node: &Arc<Node>,
        service_path: &str,
        member_name: &str,
        unreliable_allowed: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: Arc::downgrade(node),
            service_path: service_path.to_string(),
            member_name: member_name.to_string(),
            unreliable_allowed,
            endpoints: Mutex::new(HashMap::new()),
            connect_listener: Mutex::new(None),
            close_listener: Mutex::new(None),
        })
    }

    /// Object path of the owning service object.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Member name of this pipe.
    #[must_use]
    pub fn member_name(&self) -> &str {
        &self.member_name
    }

    /// Observe newly connected pipe endpoints.
    pub fn set_connect_listener<F>(&self, listener: F)
    where
        F: Fn(&Arc<PipeEndpoint>) + Send + Sync + 'static,
    {
        *self.connect_listener.lock() = Some(Arc::new(listener));
    }

    /// Observe pipe endpoint closes as `(client endpoint, index)`.
    pub fn set_close_listener<F>(&self, listener: F)
    where
        F: Fn(u32, i32) + Send + Sync + 'static,
    {
        *self.close_listener.lock() = Some(Arc::new(listener));
    }

    /// Connected endpoint by `(client endpoint, index)`.
    #[must_use]
    pub fn endpoint(&self, client_endpoint: u32, index: i32) -> Option<Arc<PipeEndpoint>> {
        self.endpoints
            .lock()
            .get(&(client_endpoint, index))
            .cloned()
    }

    /// Number of connected pipe endpoints across all clients.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    // ========================================================================
    // Protocol (called by ServerContext dispatch)
    // ========================================================================

    /// `PipeConnectReq`: pick an index, create the endpoint, reply.
    pub(crate) fn connect_requested(
        &self,
        client_endpoint: u32,
        entry: &MessageEntry,
    ) -> Result<MessageEntry> {
        let requested = match entry.element("index") {
            Some(el) => el.data.as_i32()?,
            None => -1,
        };
        let unreliable_requested = entry
            .element("unreliable")
            .map(|e| e.data.as_u32().unwrap_or(0) != 0)
            .unwrap_or(false);
        let unreliable = unreliable_requested && self.unreliable_allowed;

        let pipe_ep = {
            let mut endpoints = self.endpoints.lock();
            let index = if requested >= 0 {
                if endpoints.contains_key(&(client_endpoint, requested)) {
                    return Err(Error::InvalidOperation(format!(
                        "pipe index {} already connected",
                        requested
                    )));
                }
                requested
            } else {
                // Smallest unused index for this client.
                let mut index = 0;
                while endpoints.contains_key(&(client_endpoint, index)) {
                    index += 1;
                }
                index
            };

            let pipe_ep = PipeEndpoint::new(
                self.node.clone(),
                client_endpoint,
                &self.service_path,
                &self.member_name,
                index,
                unreliable,
            );
            pipe_ep.set_connected();
            endpoints.insert((client_endpoint, index), pipe_ep.clone());
            pipe_ep
        };

        log::debug!(
            "[PipeServer::connect_requested] {}.{} endpoint ({}, {}) connected{}",
            self.service_path,
            self.member_name,
            client_endpoint,
            pipe_ep.index(),
            if unreliable { " (unreliable)" } else { "" }
        );

        // Hand the new endpoint to the application outside the map lock.
        let listener = self.connect_listener.lock().clone();
        if let Some(listener) = listener {
            listener(&pipe_ep);
        }

        let mut response = entry.make_response()?;
        response.add_element(MessageElement::new(
            "index",
            ElementData::scalar_i32(pipe_ep.index()),
        ));
        if unreliable {
            response.add_element(MessageElement::new(
                "unreliable",
                ElementData::scalar_u32(1),
            ));
        }
        Ok(response)
    }

    /// `PipeDisconnectReq`: close the endpoint and confirm.
    pub(crate) fn disconnect_requested(
        &self,
        client_endpoint: u32,
        entry: &MessageEntry,
    ) -> Result<MessageEntry> {
        let index = entry.element_or_err("index")?.data.as_i32()?;
        let pipe_ep = self
            .endpoints
            .lock()
            .remove(&(client_endpoint, index))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("pipe index {} not connected", index))
            })?;
        pipe_ep.finalize_close();
        self.notify_closed(client_endpoint, index);
        entry.make_response()
    }

    /// `PipePacket` from a client: route per element, batch acks into one
    /// `PipePacketRet` back to that client.
    pub(crate) fn packet_received(&self, client_endpoint: u32, entry: &MessageEntry) {
        let mut acks: Vec<(i32, u32)> = Vec::new();

        for element in &entry.elements {
            match parse_pipe_packet_element(element) {
                Ok(fields) => {
                    let pipe_ep = self
                        .endpoints
                        .lock()
                        .get(&(client_endpoint, fields.index))
                        .cloned();
                    match pipe_ep {
                        Some(pipe_ep) => {
                            pipe_ep.packet_received(fields.packet_number, fields.data);
                            if fields.request_ack {
                                acks.push((fields.index, fields.packet_number));
                            }
                        }
                        None => log::debug!(
                            "[PipeServer::packet_received] packet for unconnected ({}, {})",
                            client_endpoint,
                            fields.index
                        ),
                    }
                }
                Err(err) => {
                    log::debug!("[PipeServer::packet_received] malformed element: {}", err);
                }
            }
        }

        if !acks.is_empty() {
            let mut ret = MessageEntry::with_member(
                EntryType::PipePacketRet,
                &self.service_path,
                &self.member_name,
            );
            for (index, packet_number) in &acks {
                ret.add_element(MessageElement::numbered(
                    *index,
                    ElementData::scalar_u32(*packet_number),
                ));
            }
            if let Some(node) = self.node.upgrade() {
                if let Err(err) = node.send_entry(client_endpoint, ret, false) {
                    log::debug!("[PipeServer::packet_received] ack send failed: {}", err);
                }
            }
        }
    }

    /// `PipePacketRet` from a client: acks for our sends.
    pub(crate) fn ack_received(&self, client_endpoint: u32, entry: &MessageEntry) {
        for element in &entry.elements {
            let Some(index) = element.number() else { continue };
            let Ok(packet_number) = element.data.as_u32() else {
                continue;
            };
            let pipe_ep = self.endpoints.lock().get(&(client_endpoint, index)).cloned();
            if let Some(pipe_ep) = pipe_ep {
                pipe_ep.ack_received(packet_number);
            }
        }
    }

    /// `PipeClosed` notification from a client.
    pub(crate) fn remote_closed(&self, client_endpoint: u32, entry: &MessageEntry) {
        let Ok(index) = entry
            .element_or_err("index")
            .and_then(|e| e.data.as_i32())
        else {
            log::debug!("[PipeServer::remote_closed] malformed close notification");
            return;
        };

        if let Some(pipe_ep) = self.endpoints.lock().remove(&(client_endpoint, index)) {
            pipe_ep.remote_close();
            self.notify_closed(client_endpoint, index);
        }

        let mut ret = MessageEntry::with_member(
            EntryType::PipeClosedRet,
            &self.service_path,
            &self.member_name,
        );
        ret.add_element(MessageElement::new("index", ElementData::scalar_i32(index)));
        if let Some(node) = self.node.upgrade() {
            if let Err(err) = node.send_entry(client_endpoint, ret, false) {
                log::debug!("[PipeServer::remote_closed] confirm failed: {}", err);
            }
        }
    }

    /// `PipeClosedRet` confirmation for a close we notified.
    pub(crate) fn closed_ret(&self, client_endpoint: u32, entry: &MessageEntry) {
        let Ok(index) = entry
            .element_or_err("index")
            .and_then(|e| e.data.as_i32())
        else {
            return;
        };
        if let Some(pipe_ep) = self.endpoints.lock().remove(&(client_endpoint, index)) {
            pipe_ep.closed_ret_received();
            self.notify_closed(client_endpoint, index);
        }
    }

    /// A client endpoint went away: close all its pipe endpoints.
    pub(crate) fn endpoint_closed(&self, client_endpoint: u32) {
        let removed: Vec<((u32, i32), Arc<PipeEndpoint>)> = {
            let mut endpoints = self.endpoints.lock();
            let keys: Vec<(u32, i32)> = endpoints
                .keys()
                .filter(|(ep, _)| *ep == client_endpoint)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| endpoints.remove(&key).map(|v| (key, v)))
                .collect()
        };
        for ((endpoint, index), pipe_ep) in removed {
            pipe_ep.finalize_close();
            self.notify_closed(endpoint, index);
        }
    }

    /// Service shutdown: close everything.
    pub(crate) fn shutdown(&self) {
        let removed: Vec<((u32, i32), Arc<PipeEndpoint>)> =
            self.endpoints.lock().drain().collect();
        for ((endpoint, index), pipe_ep) in removed {
            pipe_ep.finalize_close();
            self.notify_closed(endpoint, index);
        }
    }

    fn notify_closed(&self, client_endpoint: u32, index: i32) {
        let listener = self.close_listener.lock().clone();
        if let Some(listener) = listener {
            listener(client_endpoint, index);
        }
    }
}
