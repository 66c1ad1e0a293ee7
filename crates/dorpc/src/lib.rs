// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! # dorpc - Distributed-object RPC middleware
//!
//! A pure Rust endpoint communication engine for distributed-object RPC:
//! nodes expose services (objects with properties, functions, events,
//! pipes) over pluggable transports, with request-response correlation,
//! timeouts, and an ordered/unreliable streaming pipe protocol with
//! acknowledgement and backpressure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dorpc::{Node, Result};
//! use dorpc::transport::intra::IntraTransport;
//!
//! fn main() -> Result<()> {
//!     // Client node connecting to an in-process peer
//!     let node = Node::new();
//!     IntraTransport::new(&node)?;
//!
//!     let client = node.connect_service("rr+intra:///?service=camera&nodename=robot")?;
//!     let exposure = client.property_get("camera", "exposure")?;
//!     println!("exposure: {:?}", exposure);
//!
//!     client.close()?;
//!     node.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Application Layer                            |
//! |     service skeletons (ServiceSkel) | client calls | pipes          |
//! +---------------------------------------------------------------------+
//! |                        Endpoint Layer                               |
//! |  ClientContext (request correlation, timeouts, connect handshake)   |
//! |  ServerContext/ServerEndpoint (dispatch, locks, authentication)     |
//! |  PipeEndpoint/PipeBroadcaster (sequencing, acks, backpressure)      |
//! +---------------------------------------------------------------------+
//! |                          Node Layer                                 |
//! |  endpoint table | transport table | worker pool | timers | shutdown |
//! +---------------------------------------------------------------------+
//! |                        Transport Layer                              |
//! |  Transport/TransportConnection traits | rr+intra in-process impl    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | Process-wide hub owning endpoints, transports, services |
//! | [`ClientContext`] | Client side of one service connection |
//! | [`ServerContext`] | One registered service with its skeleton |
//! | [`PipeEndpoint`] | One ordered or unreliable packet stream |
//! | [`PipeBroadcaster`] | Fan-out with per-subscriber backlog caps |
//! | [`Message`] | Wire message tree: header + entries + elements |
//!
//! ## Concurrency model
//!
//! A fixed worker pool drains a shared task queue; every async completion
//! is posted there, never invoked inside a lock or a transport callback
//! stack. Blocking calls are the async path plus a single-slot auto-reset
//! event, so both surfaces share one timeout and cancellation behavior.
//! Tables are guarded by fine-grained locks held only for the mutation;
//! cross-component references are `(Weak<Node>, integer id)` handles
//! resolved per use.

/// Node configuration and protocol constants.
pub mod config;
/// Endpoint abstractions: client contexts, server contexts, skeletons.
pub mod endpoint;
/// Error taxonomy and wire error codes.
pub mod error;
/// In-memory message model and codec interface.
pub mod message;
/// Process-wide node hub: routing, tables, worker pool, shutdown.
pub mod node;
/// Pipe streaming-member protocol.
pub mod pipe;
/// Blocking primitives (auto-reset event, timer queue).
pub mod sync;
/// Transport interfaces, URL parsing, in-process transport.
pub mod transport;

pub use config::NodeConfig;
pub use endpoint::client::{ClientContext, ClientEvent, GeneratorClient, ResponseHandler};
pub use endpoint::server::{
    AuthenticatedUser, ServerContext, ServerEndpoint, ServiceSkel, SkelRequest, UserAuthenticator,
};
pub use endpoint::{Endpoint, EndpointHandler};
pub use error::{Error, ErrorCode, Result};
pub use message::{
    ElementData, ElementName, EntryType, Message, MessageElement, MessageEntry, MessageHeader,
    NodeId,
};
pub use node::{Node, WorkerPool};
pub use pipe::{PipeBroadcaster, PipeClient, PipeEndpoint, PipeServer, PipeState};
pub use transport::{parse_connection_url, ParsedUrl, Transport, TransportConnection};

/// dorpc version string.
pub const VERSION: &str = "0.4.2";
