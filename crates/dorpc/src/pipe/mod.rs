// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Pipe streaming-member protocol.
//!
//! A pipe is an ordered or unreliable packet stream between a client pipe
//! connection and its server counterpart, addressed by
//! `(transport endpoint id, pipe index)`. Reliable mode delivers packets to
//! the consumer in strict send order, buffering out-of-order arrivals until
//! the gaps fill; unreliable mode delivers in arrival order with duplicates
//! preserved.
//!
//! Wire shape of one packet: a `PipePacket` entry holding one element per
//! packet, keyed by pipe endpoint index, whose value is the list
//! `[packetnumber, packet, requestack?]`. Acks batch into one
//! `PipePacketRet` entry per received message.

mod broadcaster;
mod client;
mod server;

pub use broadcaster::{PipeBroadcaster, SendPredicate};
pub use client::{PipeClient, PipeConnectHandler};
pub use server::PipeServer;

use crate::error::{Error, Result};
use crate::message::{ElementData, EntryType, MessageElement, MessageEntry};
use crate::node::Node;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Pipe endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Completion callback for an asynchronous packet send.
pub type PacketSendHandler = Box<dyn FnOnce(Result<u32>) + Send + 'static>;

// ============================================================================
// PACKET ELEMENT LAYOUT
// ============================================================================

/// Decoded fields of one pipe packet element.
pub(crate) struct PipePacketFields {
    pub index: i32,
    pub packet_number: u32,
    pub data: ElementData,
    pub request_ack: bool,
}

/// Build the index-keyed element carrying one packet.
pub(crate) fn build_pipe_packet_element(
    index: i32,
    packet_number: u32,
    data: ElementData,
    request_ack: bool,
) -> MessageElement {
    let mut fields = vec![
        MessageElement::new("packetnumber", ElementData::scalar_u32(packet_number)),
        MessageElement::new("packet", data),
    ];
    if request_ack {
        fields.push(MessageElement::new("requestack", ElementData::scalar_u32(1)));
    }
    MessageElement::numbered(index, ElementData::List(fields))
}

/// Decode one pipe packet element.
pub(crate) fn parse_pipe_packet_element(element: &MessageElement) -> Result<PipePacketFields> {
    let index = element.number().ok_or_else(|| {
        Error::ProtocolError("pipe packet element is not index-keyed".to_string())
    })?;
    let fields = element.data.as_elements()?;

    let packet_number = fields
        .iter()
        .find(|e| e.name_str() == Some("packetnumber"))
        .ok_or_else(|| Error::ProtocolError("pipe packet missing packetnumber".to_string()))?
        .data
        .as_u32()?;
    let data = fields
        .iter()
        .find(|e| e.name_str() == Some("packet"))
        .ok_or_else(|| Error::ProtocolError("pipe packet missing payload".to_string()))?
        .data
        .clone();
    let request_ack = fields.iter().any(|e| e.name_str() == Some("requestack"));

    Ok(PipePacketFields {
        index,
        packet_number,
        data,
        request_ack,
    })
}

// ============================================================================
// SIGNAL COALESCING
// ============================================================================

/// Single-flight notification guard: while a listener round is in flight,
/// further triggers only mark another round pending instead of spawning a
/// second concurrent task. Prevents callback storms when packets arrive
/// back-to-back.
struct SignalSemaphore {
    pending: AtomicBool,
    running: AtomicBool,
}

impl SignalSemaphore {
    fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// PIPE ENDPOINT
// ============================================================================

struct RecvQueues {
    /// Last packet number delivered in order (reliable mode).
    recv_packet_number: u32,
    /// In-order delivered, not yet consumed.
    recv_packets: VecDeque<ElementData>,
    /// Received ahead of sequence, held until the gaps fill.
    out_of_order: BTreeMap<u32, ElementData>,
}

/// One directional/bidirectional stream between a client pipe connection
/// and its server counterpart.
pub struct PipeEndpoint {
    node: Weak<Node>,
    endpoint_id: u32,
    service_path: String,
    member_name: String,
    index: i32,
    unreliable: bool,

    state: Mutex<PipeState>,
    send_packet_number: Mutex<u32>,
    queues: Mutex<RecvQueues>,
    recv_cond: Condvar,

    packet_listener: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    ack_listener: Mutex<Option<Arc<dyn Fn(u32) + Send + Sync>>>,
    signal: SignalSemaphore,
}

impl std::fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEndpoint")
            .field("endpoint_id", &self.endpoint_id)
            .field("service_path", &self.service_path)
            .field("member_name", &self.member_name)
            .field("index", &self.index)
            .field("unreliable", &self.unreliable)
            .finish()
    }
}

impl PipeEndpoint {
    pub(crate) fn new(
        node: Weak<Node>,
        endpoint_id: u32,
        service_path: &str,
        member_name: &str,
        index: i32,
        unreliable: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            endpoint_id,
            service_path: service_path.to_string(),
            member_name: member_name.to_string(),
            index,
            unreliable,
            state: Mutex::new(PipeState::Connecting),
            send_packet_number: Mutex::new(0),
            queues: Mutex::new(RecvQueues {
                recv_packet_number: 0,
                recv_packets: VecDeque::new(),
                out_of_order: BTreeMap::new(),
            }),
            recv_cond: Condvar::new(),
            packet_listener: Mutex::new(None),
            ack_listener: Mutex::new(None),
            signal: SignalSemaphore::new(),
        })
    }

    fn node(&self) -> Result<Arc<Node>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("node has been released".to_string()))
    }

    /// Pipe endpoint index within its member, assigned by the server.
    #[must_use]
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Transport endpoint carrying this pipe endpoint.
    #[must_use]
    pub fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    /// True when the pipe was negotiated unreliable.
    #[must_use]
    pub fn unreliable(&self) -> bool {
        self.unreliable
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipeState {
        *self.state.lock()
    }

    pub(crate) fn set_connected(&self) {
        let mut state = self.state.lock();
        if *state == PipeState::Connecting {
            *state = PipeState::Connected;
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), PipeState::Closing | PipeState::Closed)
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Send a packet; returns its packet number.
    pub fn send_packet(&self, data: ElementData) -> Result<u32> {
        self.send_packet_ex(data, false)
    }

    /// Send a packet and request an acknowledgement from the receiver.
    pub(crate) fn send_packet_with_ack(&self, data: ElementData) -> Result<u32> {
        self.send_packet_ex(data, true)
    }

    /// Asynchronous send; the handler observes the assigned packet number
    /// or the send error.
    pub fn async_send_packet(&self, data: ElementData, handler: PacketSendHandler) {
        let result = self.send_packet_ex(data, false);
        match self.node() {
            Ok(node) => node.post_handler(Box::new(move || handler(result))),
            Err(_) => handler(result),
        }
    }

    fn send_packet_ex(&self, data: ElementData, request_ack: bool) -> Result<u32> {
        if self.state() != PipeState::Connected {
            return Err(Error::InvalidOperation(
                "pipe endpoint is not connected".to_string(),
            ));
        }

        let packet_number = {
            let mut n = self.send_packet_number.lock();
            *n = n.wrapping_add(1);
            *n
        };

        let mut entry = MessageEntry::with_member(
            EntryType::PipePacket,
            &self.service_path,
            &self.member_name,
        );
        entry.add_element(build_pipe_packet_element(
            self.index,
            packet_number,
            data,
            request_ack,
        ));

        // The unreliable flag is a transport hint: such messages may be
        // dropped or reordered en route.
        self.node()?
            .send_entry(self.endpoint_id, entry, self.unreliable)?;
        Ok(packet_number)
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Packets delivered and not yet consumed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.queues.lock().recv_packets.len()
    }

    /// Non-blocking receive. `Ok(None)` when no packet is ready.
    pub fn try_receive_packet(&self) -> Result<Option<ElementData>> {
        let mut queues = self.queues.lock();
        if let Some(data) = queues.recv_packets.pop_front() {
            return Ok(Some(data));
        }
        if self.is_closed() {
            return Err(Error::InvalidOperation("pipe endpoint closed".to_string()));
        }
        Ok(None)
    }

    /// Blocking receive; errors once the endpoint is closed and drained.
    pub fn receive_packet(&self) -> Result<ElementData> {
        match self.receive_internal(None)? {
            Some(data) => Ok(data),
            None => Err(Error::InternalError(
                "infinite receive wait returned empty".to_string(),
            )),
        }
    }

    /// Blocking receive with timeout; `Ok(None)` on timeout.
    pub fn receive_packet_timeout(&self, timeout: Duration) -> Result<Option<ElementData>> {
        self.receive_internal(Some(timeout))
    }

    fn receive_internal(&self, timeout: Option<Duration>) -> Result<Option<ElementData>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queues = self.queues.lock();
        loop {
            if let Some(data) = queues.recv_packets.pop_front() {
                return Ok(Some(data));
            }
            // A close while blocked must wake the waiter with a closed
            // result rather than hang.
            if self.is_closed() {
                return Err(Error::InvalidOperation("pipe endpoint closed".to_string()));
            }
            match deadline {
                None => self.recv_cond.wait(&mut queues),
                Some(deadline) => {
                    if self.recv_cond.wait_until(&mut queues, deadline).timed_out() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Coalesced "packet available" callback: at most one invocation round
    /// is in flight however many packets arrive back-to-back.
    pub fn set_packet_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.packet_listener.lock() = Some(Arc::new(listener));
    }

    pub(crate) fn set_ack_listener(&self, listener: Arc<dyn Fn(u32) + Send + Sync>) {
        *self.ack_listener.lock() = Some(listener);
    }

    // ========================================================================
    // Inbound protocol
    // ========================================================================

    /// Record a received packet. Reliable mode enforces strict sequencing
    /// with out-of-order buffering; unreliable mode appends directly.
    pub(crate) fn packet_received(self: &Arc<Self>, packet_number: u32, data: ElementData) {
        let mut delivered = false;
        {
            let mut queues = self.queues.lock();
            if self.unreliable {
                queues.recv_packets.push_back(data);
                delivered = true;
            } else {
                let expected = queues.recv_packet_number.wrapping_add(1);
                if packet_number == expected {
                    queues.recv_packets.push_back(data);
                    queues.recv_packet_number = expected;
                    // Release the contiguous run the gap was holding back.
                    loop {
                        let next = queues.recv_packet_number.wrapping_add(1);
                        match queues.out_of_order.remove(&next) {
                            Some(held) => {
                                queues.recv_packets.push_back(held);
                                queues.recv_packet_number = next;
                            }
                            None => break,
                        }
                    }
                    delivered = true;
                } else if packet_number.wrapping_sub(expected) < u32::MAX / 2 {
                    // Ahead of sequence: buffer until the gap fills.
                    queues.out_of_order.insert(packet_number, data);
                } else {
                    log::debug!(
                        "[PipeEndpoint::packet_received] stale packet {} dropped (expected {})",
                        packet_number,
                        expected
                    );
                }
            }
        }

        if delivered {
            self.recv_cond.notify_all();
            self.fire_packet_listener();
        }
    }

    /// Record an acknowledgement for a packet this endpoint sent.
    pub(crate) fn ack_received(&self, packet_number: u32) {
        let listener = self.ack_listener.lock().clone();
        if let Some(listener) = listener {
            listener(packet_number);
        }
    }

    fn fire_packet_listener(self: &Arc<Self>) {
        let Some(listener) = self.packet_listener.lock().clone() else {
            return;
        };
        self.signal.pending.store(true, Ordering::Release);
        if self.signal.running.swap(true, Ordering::AcqRel) {
            // A round is in flight; it will observe the pending flag.
            return;
        }
        let Ok(node) = self.node() else {
            self.signal.running.store(false, Ordering::Release);
            return;
        };
        let me = Arc::clone(self);
        node.post_handler(Box::new(move || {
            while me.signal.pending.swap(false, Ordering::AcqRel) {
                listener();
            }
            me.signal.running.store(false, Ordering::Release);
            // A trigger may have slipped in between the last drain and the
            // running reset.
            if me.signal.pending.load(Ordering::Acquire)
                && !me.signal.running.swap(true, Ordering::AcqRel)
            {
                while me.signal.pending.swap(false, Ordering::AcqRel) {
                    listener();
                }
                me.signal.running.store(false, Ordering::Release);
            }
        }));
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close this endpoint: two-phase notify. Sends `PipeClosed` so the
    /// remote side abandons queued-but-unacked sends cleanly; the remote
    /// `PipeClosedRet` finalizes the state.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PipeState::Closing | PipeState::Closed => return Ok(()),
                _ => *state = PipeState::Closing,
            }
        }
        self.recv_cond.notify_all();

        let mut entry = MessageEntry::with_member(
            EntryType::PipeClosed,
            &self.service_path,
            &self.member_name,
        );
        entry.add_element(MessageElement::new(
            "index",
            ElementData::scalar_i32(self.index),
        ));
        match self.node().and_then(|node| {
            node.send_entry(self.endpoint_id, entry, false)
        }) {
            Ok(()) => {}
            Err(err) => {
                // Remote unreachable: finish locally.
                log::debug!("[PipeEndpoint::close] close notify failed: {}", err);
                self.finalize_close();
            }
        }
        Ok(())
    }

    /// Remote side closed: wake waiters, abandon unacked sends.
    pub(crate) fn remote_close(&self) {
        self.finalize_close();
    }

    /// `PipeClosedRet` arrived for our close notify.
    pub(crate) fn closed_ret_received(&self) {
        self.finalize_close();
    }

    /// Local teardown without network traffic (endpoint loss, shutdown).
    pub(crate) fn finalize_close(&self) {
        {
            let mut state = self.state.lock();
            if *state == PipeState::Closed {
                return;
            }
            *state = PipeState::Closed;
        }
        self.recv_cond.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn test_seed_recv_packet_number(&self, packet_number: u32) {
        self.queues.lock().recv_packet_number = packet_number;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn detached_endpoint(unreliable: bool) -> Arc<PipeEndpoint> {
        let ep = PipeEndpoint::new(Weak::new(), 1, "svc", "stream", 0, unreliable);
        ep.set_connected();
        ep
    }

    fn payload(tag: u32) -> ElementData {
        ElementData::scalar_u32(tag)
    }

    #[test]
    fn reliable_delivery_reorders_into_sequence() {
        let ep = detached_endpoint(false);
        // Send sequence 1..=4 arriving as [3, 1, 2, 4].
        for pn in [3u32, 1, 2, 4] {
            ep.packet_received(pn, payload(pn));
        }

        let mut received = Vec::new();
        while let Some(data) = ep.try_receive_packet().expect("open pipe") {
            received.push(data.as_u32().expect("payload tag"));
        }
        assert_eq!(received, vec![1, 2, 3, 4]);
    }

    #[test]
    fn reliable_delivery_all_permutations_of_four() {
        let orders: &[[u32; 4]] = &[
            [1, 2, 3, 4],
            [4, 3, 2, 1],
            [2, 1, 4, 3],
            [3, 4, 1, 2],
            [4, 1, 3, 2],
            [2, 4, 1, 3],
        ];
        for order in orders {
            let ep = detached_endpoint(false);
            for &pn in order {
                ep.packet_received(pn, payload(pn));
            }
            let mut received = Vec::new();
            while let Some(data) = ep.try_receive_packet().expect("open pipe") {
                received.push(data.as_u32().expect("payload tag"));
            }
            assert_eq!(received, vec![1, 2, 3, 4], "arrival order {:?}", order);
        }
    }

    #[test]
    fn reliable_out_of_order_packet_is_buffered_not_delivered_early() {
        let ep = detached_endpoint(false);
        ep.packet_received(2, payload(2));
        assert_eq!(ep.available(), 0, "gap must hold packet 2 back");
        ep.packet_received(1, payload(1));
        assert_eq!(ep.available(), 2, "filling the gap releases the run");
    }

    #[test]
    fn reliable_duplicate_is_dropped() {
        let ep = detached_endpoint(false);
        ep.packet_received(1, payload(1));
        ep.packet_received(1, payload(1));
        assert_eq!(ep.available(), 1);
    }

    #[test]
    fn unreliable_delivery_is_arrival_order_with_duplicates() {
        let ep = detached_endpoint(true);
        for pn in [2u32, 2, 1, 4] {
            ep.packet_received(pn, payload(pn));
        }
        let mut received = Vec::new();
        while let Ok(Some(data)) = ep.try_receive_packet() {
            received.push(data.as_u32().expect("payload tag"));
        }
        assert_eq!(received, vec![2, 2, 1, 4]);
    }

    #[test]
    fn sequence_numbers_wrap_at_u32_max() {
        let ep = detached_endpoint(false);
        ep.test_seed_recv_packet_number(u32::MAX - 1);
        // Expected sequence: MAX, 0, 1 - arriving out of order.
        ep.packet_received(0, payload(100));
        ep.packet_received(u32::MAX, payload(99));
        ep.packet_received(1, payload(101));

        let mut received = Vec::new();
        while let Ok(Some(data)) = ep.try_receive_packet() {
            received.push(data.as_u32().expect("payload tag"));
        }
        assert_eq!(received, vec![99, 100, 101]);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let ep = detached_endpoint(false);
        let ep2 = Arc::clone(&ep);

        let waiter = thread::spawn(move || ep2.receive_packet());
        thread::sleep(Duration::from_millis(20));
        ep.finalize_close();

        let result = waiter.join().expect("receiver thread");
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn receive_drains_queued_packets_then_reports_closed() {
        let ep = detached_endpoint(false);
        ep.packet_received(1, payload(7));
        ep.finalize_close();

        let first = ep.try_receive_packet().expect("drain allowed");
        assert_eq!(first, Some(payload(7)));
        assert!(ep.try_receive_packet().is_err());
    }

    #[test]
    fn receive_timeout_returns_none() {
        let ep = detached_endpoint(false);
        let got = ep
            .receive_packet_timeout(Duration::from_millis(20))
            .expect("open pipe");
        assert!(got.is_none());
    }

    #[test]
    fn send_on_closed_endpoint_fails() {
        let ep = detached_endpoint(false);
        ep.finalize_close();
        assert!(matches!(
            ep.send_packet(payload(1)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn packet_element_roundtrip() {
        let element = build_pipe_packet_element(3, 42, payload(9), true);
        let fields = parse_pipe_packet_element(&element).expect("roundtrip");
        assert_eq!(fields.index, 3);
        assert_eq!(fields.packet_number, 42);
        assert_eq!(fields.data, payload(9));
        assert!(fields.request_ack);

        let plain = build_pipe_packet_element(0, 1, payload(2), false);
        let fields = parse_pipe_packet_element(&plain).expect("roundtrip");
        assert!(!fields.request_ack);
    }
}
