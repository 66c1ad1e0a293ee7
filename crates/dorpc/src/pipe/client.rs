// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Client side of a pipe member.
//!
//! Owns the client's [`PipeEndpoint`]s for one pipe member, keyed by index.
//! Connect/disconnect ride the client context's request correlation; packet
//! traffic and close notifications are routed here by the client context's
//! entry dispatch.

use super::{parse_pipe_packet_element, PipeEndpoint};
use crate::endpoint::client::ClientContext;
use crate::endpoint::EndpointHandler;
use crate::error::{Error, Result};
use crate::message::{ElementData, EntryType, MessageElement, MessageEntry};
use crate::node::Node;
use crate::sync::AutoResetEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Completion callback for an asynchronous pipe connect.
pub type PipeConnectHandler = Box<dyn FnOnce(Result<Arc<PipeEndpoint>>) + Send + 'static>;

/// Client-side pipe member.
pub struct PipeClient {
    node: Weak<Node>,
    client: Weak<ClientContext>,
    endpoint_id: u32,
    service_path: String,
    member_name: String,
    /// Shared so connect completions can insert from the worker pool.
    endpoints: Arc<Mutex<HashMap<i32, Arc<PipeEndpoint>>>>,
}

impl PipeClient {
    pub(crate) fn new(
        client: &Arc<ClientContext>,
        service_path: &str,
        member_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: client.endpoint().weak_node(),
            client: Arc::downgrade(client),
            endpoint_id: client.endpoint().local_endpoint(),
            service_path: service_path.to_string(),
            member_name: member_name.to_string(),
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn client(&self) -> Result<Arc<ClientContext>> {
        self.client
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("client connection released".to_string()))
    }

    /// Member name of this pipe.
    #[must_use]
    pub fn member_name(&self) -> &str {
        &self.member_name
    }

    /// Connect a pipe endpoint (blocking). `index` -1 lets the server
    /// choose.
    pub fn connect(&self, index: i32) -> Result<Arc<PipeEndpoint>> {
        self.connect_ex(index, false)
    }

    /// Connect requesting unreliable delivery (blocking). The server may
    /// decline; check [`PipeEndpoint::unreliable`] on the result.
    pub fn connect_unreliable(&self, index: i32) -> Result<Arc<PipeEndpoint>> {
        self.connect_ex(index, true)
    }

    fn connect_ex(&self, index: i32, unreliable: bool) -> Result<Arc<PipeEndpoint>> {
        let done = Arc::new(AutoResetEvent::new());
        let slot: Arc<Mutex<Option<Result<Arc<PipeEndpoint>>>>> = Arc::new(Mutex::new(None));

        let done2 = Arc::clone(&done);
        let slot2 = Arc::clone(&slot);
        self.async_connect(
            index,
            unreliable,
            Box::new(move |result| {
                *slot2.lock() = Some(result);
                done2.set();
            }),
        );

        done.wait_one(None);
        let result = slot.lock().take().unwrap_or_else(|| {
            Err(Error::InternalError("pipe connect completed empty".to_string()))
        });
        result
    }

    /// Connect a pipe endpoint; the handler observes the outcome.
    pub fn async_connect(&self, index: i32, unreliable: bool, handler: PipeConnectHandler) {
        let client = match self.client() {
            Ok(c) => c,
            Err(err) => {
                handler(Err(err));
                return;
            }
        };

        let mut entry = MessageEntry::with_member(
            EntryType::PipeConnectReq,
            &self.service_path,
            &self.member_name,
        );
        entry.add_element(MessageElement::new("index", ElementData::scalar_i32(index)));
        if unreliable {
            entry.add_element(MessageElement::new(
                "unreliable",
                ElementData::scalar_u32(1),
            ));
        }

        let node = self.node.clone();
        let endpoint_id = self.endpoint_id;
        let service_path = self.service_path.clone();
        let member_name = self.member_name.clone();
        let endpoints = Arc::clone(&self.endpoints);
        let timeout = self.node.upgrade().map(|n| n.config().request_timeout);
        client.async_process_request(
            entry,
            Box::new(move |result| match result {
                Ok(response) => {
                    let parsed = (|| -> Result<Arc<PipeEndpoint>> {
                        let index = response.element_or_err("index")?.data.as_i32()?;
                        let unreliable = response
                            .element("unreliable")
                            .map(|e| e.data.as_u32().unwrap_or(0) != 0)
                            .unwrap_or(false);
                        let pipe_ep = PipeEndpoint::new(
                            node,
                            endpoint_id,
                            &service_path,
                            &member_name,
                            index,
                            unreliable,
                        );
                        pipe_ep.set_connected();
                        endpoints.lock().insert(index, pipe_ep.clone());
                        Ok(pipe_ep)
                    })();
                    handler(parsed);
                }
                Err(err) => handler(Err(err)),
            }),
            timeout,
        );
    }

    /// Connected endpoint by index.
    #[must_use]
    pub fn endpoint(&self, index: i32) -> Option<Arc<PipeEndpoint>> {
        self.endpoints.lock().get(&index).cloned()
    }

    /// Gracefully disconnect one endpoint through the request path.
    pub fn close_endpoint(&self, index: i32) -> Result<()> {
        let pipe_ep = self
            .endpoints
            .lock()
            .remove(&index)
            .ok_or_else(|| Error::InvalidArgument(format!("pipe index {} not connected", index)))?;

        let mut entry = MessageEntry::with_member(
            EntryType::PipeDisconnectReq,
            &self.service_path,
            &self.member_name,
        );
        entry.add_element(MessageElement::new("index", ElementData::scalar_i32(index)));
        let result = self.client()?.process_request(entry);
        pipe_ep.finalize_close();
        result.map(|_| ())
    }

    // ========================================================================
    // Entry dispatch (called by ClientContext)
    // ========================================================================

    /// `PipePacket` entry: route each element to its endpoint, batch one ack
    /// per acked packet into a single `PipePacketRet`.
    pub(crate) fn packet_received(&self, entry: &MessageEntry) {
        let mut acks: Vec<(i32, u32)> = Vec::new();

        for element in &entry.elements {
            match parse_pipe_packet_element(element) {
                Ok(fields) => {
                    let endpoint = self.endpoints.lock().get(&fields.index).cloned();
                    match endpoint {
                        Some(pipe_ep) => {
                            pipe_ep.packet_received(fields.packet_number, fields.data);
                            if fields.request_ack {
                                acks.push((fields.index, fields.packet_number));
                            }
                        }
                        None => log::debug!(
                            "[PipeClient::packet_received] packet for unconnected index {}",
                            fields.index
                        ),
                    }
                }
                Err(err) => {
                    log::debug!("[PipeClient::packet_received] malformed element: {}", err);
                }
            }
        }

        if !acks.is_empty() {
            self.send_acks(&acks);
        }
    }

    fn send_acks(&self, acks: &[(i32, u32)]) {
        let mut entry = MessageEntry::with_member(
            EntryType::PipePacketRet,
            &self.service_path,
            &self.member_name,
        );
        for (index, packet_number) in acks {
            entry.add_element(MessageElement::numbered(
                *index,
                ElementData::scalar_u32(*packet_number),
            ));
        }
        let result = self
            .node
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("node has been released".to_string()))
            .and_then(|node| node.send_entry(self.endpoint_id, entry, false));
        if let Err(err) = result {
            log::debug!("[PipeClient::send_acks] ack send failed: {}", err);
        }
    }

    /// `PipePacketRet` entry: acknowledgements for our sends.
    pub(crate) fn ack_received(&self, entry: &MessageEntry) {
        for element in &entry.elements {
            let Some(index) = element.number() else { continue };
            let Ok(packet_number) = element.data.as_u32() else {
                continue;
            };
            if let Some(pipe_ep) = self.endpoints.lock().get(&index).cloned() {
                pipe_ep.ack_received(packet_number);
            }
        }
    }

    /// `PipeClosed` notification from the server side.
    pub(crate) fn remote_closed(&self, entry: &MessageEntry) {
        let Ok(index) = entry
            .element_or_err("index")
            .and_then(|e| e.data.as_i32())
        else {
            log::debug!("[PipeClient::remote_closed] malformed close notification");
            return;
        };

        if let Some(pipe_ep) = self.endpoints.lock().remove(&index) {
            pipe_ep.remote_close();
        }

        // Confirm so the remote can finalize.
        let mut ret = MessageEntry::with_member(
            EntryType::PipeClosedRet,
            &self.service_path,
            &self.member_name,
        );
        ret.add_element(MessageElement::new("index", ElementData::scalar_i32(index)));
        if let Some(node) = self.node.upgrade() {
            if let Err(err) = node.send_entry(self.endpoint_id, ret, false) {
                log::debug!("[PipeClient::remote_closed] confirm failed: {}", err);
            }
        }
    }

    /// `PipeClosedRet` confirmation for a close we notified.
    pub(crate) fn closed_ret(&self, entry: &MessageEntry) {
        let Ok(index) = entry
            .element_or_err("index")
            .and_then(|e| e.data.as_i32())
        else {
            return;
        };
        if let Some(pipe_ep) = self.endpoints.lock().remove(&index) {
            pipe_ep.closed_ret_received();
        }
    }

    /// Owning client connection went away: close every endpoint locally so
    /// blocked receivers wake with a closed result.
    pub(crate) fn shutdown(&self) {
        let endpoints: Vec<Arc<PipeEndpoint>> =
            self.endpoints.lock().drain().map(|(_, ep)| ep).collect();
        for pipe_ep in endpoints {
            pipe_ep.finalize_close();
        }
    }
}
