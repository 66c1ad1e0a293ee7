// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Server-side pipe fan-out with backlog-based backpressure.
//!
//! One subscriber record per connected pipe endpoint, each with its own
//! backlog of unacknowledged packet numbers. With a backlog cap configured,
//! sends request acks and a subscriber at the cap is skipped - never queued
//! unbounded: slow consumers lose data, not memory. Acks that arrive before
//! the send that produced them is recorded land in a forward backlog and are
//! consumed silently when the send completes, never double counted.

use super::{PipeEndpoint, PipeServer};
use crate::error::{Error, Result};
use crate::message::ElementData;
use crate::node::Node;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Per-subscriber veto called before each send as
/// `(client endpoint, index) -> send?`.
pub type SendPredicate = Box<dyn Fn(u32, i32) -> bool + Send + Sync>;

struct Subscriber {
    endpoint: u32,
    index: i32,
    pipe_ep: Arc<PipeEndpoint>,
    /// Packet numbers sent and not yet acknowledged.
    backlog: VecDeque<u32>,
    /// Acks that arrived before their send was recorded.
    forward_backlog: VecDeque<u32>,
}

/// Broadcast sender over every endpoint of one pipe member.
pub struct PipeBroadcaster {
    node: Weak<Node>,
    pipe: Arc<PipeServer>,
    /// `None` disables backlog tracking and acks entirely.
    max_backlog: Mutex<Option<usize>>,
    subscribers: Mutex<Vec<Subscriber>>,
    predicate: Mutex<Option<SendPredicate>>,
}

impl PipeBroadcaster {
    /// Wrap a pipe server; newly connecting endpoints subscribe
    /// automatically, closing endpoints unsubscribe.
    #[must_use]
    pub fn new(
        node: &Arc<Node>,
        pipe: Arc<PipeServer>,
        max_backlog: Option<usize>,
    ) -> Arc<Self> {
        let broadcaster = Arc::new(Self {
            node: Arc::downgrade(node),
            pipe: pipe.clone(),
            max_backlog: Mutex::new(max_backlog),
            subscribers: Mutex::new(Vec::new()),
            predicate: Mutex::new(None),
        });

        let weak = Arc::downgrade(&broadcaster);
        pipe.set_connect_listener(move |pipe_ep| {
            if let Some(b) = weak.upgrade() {
                b.attach(pipe_ep);
            }
        });
        let weak = Arc::downgrade(&broadcaster);
        pipe.set_close_listener(move |endpoint, index| {
            if let Some(b) = weak.upgrade() {
                b.detach(endpoint, index);
            }
        });

        broadcaster
    }

    fn attach(self: &Arc<Self>, pipe_ep: &Arc<PipeEndpoint>) {
        let endpoint = pipe_ep.endpoint_id();
        let index = pipe_ep.index();

        let weak = Arc::downgrade(self);
        pipe_ep.set_ack_listener(Arc::new(move |packet_number| {
            if let Some(b) = weak.upgrade() {
                b.handle_ack(endpoint, index, packet_number);
            }
        }));

        self.subscribers.lock().push(Subscriber {
            endpoint,
            index,
            pipe_ep: pipe_ep.clone(),
            backlog: VecDeque::new(),
            forward_backlog: VecDeque::new(),
        });
        log::debug!(
            "[PipeBroadcaster::attach] subscriber ({}, {})",
            endpoint,
            index
        );
    }

    fn detach(&self, endpoint: u32, index: i32) {
        self.subscribers
            .lock()
            .retain(|s| !(s.endpoint == endpoint && s.index == index));
        log::debug!(
            "[PipeBroadcaster::detach] subscriber ({}, {})",
            endpoint,
            index
        );
    }

    /// The wrapped pipe member server.
    #[must_use]
    pub fn pipe(&self) -> &Arc<PipeServer> {
        &self.pipe
    }

    /// Connected subscriber count.
    #[must_use]
    pub fn active_endpoint_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Current backlog cap.
    #[must_use]
    pub fn max_backlog(&self) -> Option<usize> {
        *self.max_backlog.lock()
    }

    /// Change the backlog cap. Only allowed while zero endpoints are
    /// connected; changing policy under live traffic is rejected.
    pub fn set_max_backlog(&self, max_backlog: Option<usize>) -> Result<()> {
        let subscribers = self.subscribers.lock();
        if !subscribers.is_empty() {
            return Err(Error::InvalidOperation(
                "cannot change maximum backlog while endpoints are connected".to_string(),
            ));
        }
        *self.max_backlog.lock() = max_backlog;
        Ok(())
    }

    /// Install a per-subscriber send veto (rate limiting and similar).
    pub fn set_predicate(&self, predicate: Option<SendPredicate>) {
        *self.predicate.lock() = predicate;
    }

    /// Fan a packet out to every subscriber.
    ///
    /// Per subscriber, in order: predicate veto, backlog cap check, send.
    /// A subscriber at its cap is skipped for this send. A failing
    /// subscriber is caught, routed to the node exception handler, and
    /// skipped; the fan-out continues.
    pub fn send_packet(&self, data: &ElementData) {
        let cap = self.max_backlog();
        let request_ack = cap.is_some();

        let targets: Vec<(u32, i32, Arc<PipeEndpoint>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|s| match cap {
                    Some(k) => s.backlog.len() < k,
                    None => true,
                })
                .map(|s| (s.endpoint, s.index, s.pipe_ep.clone()))
                .collect()
        };

        for (endpoint, index, pipe_ep) in targets {
            {
                let predicate = self.predicate.lock();
                if let Some(predicate) = predicate.as_ref() {
                    if !predicate(endpoint, index) {
                        continue;
                    }
                }
            }

            let result = if request_ack {
                pipe_ep.send_packet_with_ack(data.clone())
            } else {
                pipe_ep.send_packet(data.clone())
            };

            match result {
                Ok(packet_number) => {
                    if request_ack {
                        self.record_send(endpoint, index, packet_number);
                    }
                }
                Err(err) => {
                    log::debug!(
                        "[PipeBroadcaster::send_packet] subscriber ({}, {}) skipped: {}",
                        endpoint,
                        index,
                        err
                    );
                    if let Some(node) = self.node.upgrade() {
                        node.handle_exception(&err);
                    }
                }
            }
        }
    }

    /// Asynchronous fan-out; the handler runs after every subscriber has
    /// been attempted.
    pub fn async_send_packet(
        self: &Arc<Self>,
        data: ElementData,
        handler: Box<dyn FnOnce() + Send + 'static>,
    ) {
        let me = Arc::clone(self);
        match self.node.upgrade() {
            Some(node) => node.post_handler(Box::new(move || {
                me.send_packet(&data);
                handler();
            })),
            None => handler(),
        }
    }

    /// Record a completed send, reconciling with acks that raced ahead of
    /// it: an ack already in the forward backlog consumes the send silently
    /// instead of entering the backlog.
    fn record_send(&self, endpoint: u32, index: i32, packet_number: u32) {
        let mut subscribers = self.subscribers.lock();
        let Some(sub) = subscribers
            .iter_mut()
            .find(|s| s.endpoint == endpoint && s.index == index)
        else {
            return;
        };
        if let Some(pos) = sub
            .forward_backlog
            .iter()
            .position(|&pn| pn == packet_number)
        {
            sub.forward_backlog.remove(pos);
        } else {
            sub.backlog.push_back(packet_number);
        }
    }

    /// Ack from a subscriber: frees backlog capacity by exactly one, or
    /// lands in the forward backlog when it beats its own send record.
    fn handle_ack(&self, endpoint: u32, index: i32, packet_number: u32) {
        let mut subscribers = self.subscribers.lock();
        let Some(sub) = subscribers
            .iter_mut()
            .find(|s| s.endpoint == endpoint && s.index == index)
        else {
            return;
        };
        if let Some(pos) = sub.backlog.iter().position(|&pn| pn == packet_number) {
            sub.backlog.remove(pos);
        } else {
            sub.forward_backlog.push_back(packet_number);
        }
    }

    #[cfg(test)]
    fn backlog_state(&self, endpoint: u32, index: i32) -> Option<(usize, usize)> {
        let subscribers = self.subscribers.lock();
        subscribers
            .iter()
            .find(|s| s.endpoint == endpoint && s.index == index)
            .map(|s| (s.backlog.len(), s.forward_backlog.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EntryType, MessageElement, MessageEntry};
    use crate::node::Node;

    fn connect_entry(index: i32) -> MessageEntry {
        let mut entry = MessageEntry::with_member(EntryType::PipeConnectReq, "svc", "frames");
        entry.add_element(MessageElement::new("index", ElementData::scalar_i32(index)));
        entry
    }

    #[test]
    fn subscribers_attach_and_detach_with_pipe_endpoints() {
        let node = Node::new();
        let pipe = PipeServer::new(&node, "svc", "frames", false);
        let broadcaster = PipeBroadcaster::new(&node, pipe.clone(), Some(3));

        pipe.connect_requested(11, &connect_entry(-1))
            .expect("connect");
        pipe.connect_requested(22, &connect_entry(-1))
            .expect("connect");
        assert_eq!(broadcaster.active_endpoint_count(), 2);

        pipe.endpoint_closed(11);
        assert_eq!(broadcaster.active_endpoint_count(), 1);
        node.shutdown();
    }

    #[test]
    fn max_backlog_change_rejected_while_connected() {
        let node = Node::new();
        let pipe = PipeServer::new(&node, "svc", "frames", false);
        let broadcaster = PipeBroadcaster::new(&node, pipe.clone(), Some(3));

        assert!(broadcaster.set_max_backlog(Some(5)).is_ok());

        pipe.connect_requested(11, &connect_entry(-1))
            .expect("connect");
        let err = broadcaster
            .set_max_backlog(Some(8))
            .expect_err("cap change with live endpoint");
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(broadcaster.max_backlog(), Some(5));
        node.shutdown();
    }

    #[test]
    fn early_ack_lands_in_forward_backlog_and_consumes_the_send() {
        let node = Node::new();
        let pipe = PipeServer::new(&node, "svc", "frames", false);
        let broadcaster = PipeBroadcaster::new(&node, pipe.clone(), Some(3));
        pipe.connect_requested(11, &connect_entry(-1))
            .expect("connect");

        // Ack arrives before its send is recorded.
        broadcaster.handle_ack(11, 0, 7);
        assert_eq!(broadcaster.backlog_state(11, 0), Some((0, 1)));

        // The racing send is consumed silently, never double counted.
        broadcaster.record_send(11, 0, 7);
        assert_eq!(broadcaster.backlog_state(11, 0), Some((0, 0)));
        node.shutdown();
    }

    #[test]
    fn ack_frees_backlog_capacity_by_one() {
        let node = Node::new();
        let pipe = PipeServer::new(&node, "svc", "frames", false);
        let broadcaster = PipeBroadcaster::new(&node, pipe.clone(), Some(3));
        pipe.connect_requested(11, &connect_entry(-1))
            .expect("connect");

        broadcaster.record_send(11, 0, 1);
        broadcaster.record_send(11, 0, 2);
        assert_eq!(broadcaster.backlog_state(11, 0), Some((2, 0)));

        broadcaster.handle_ack(11, 0, 1);
        assert_eq!(broadcaster.backlog_state(11, 0), Some((1, 0)));
        node.shutdown();
    }
}
