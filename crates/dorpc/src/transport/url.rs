// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Connection URL parsing.
//!
//! Canonical form:
//!
//! ```text
//! scheme://host[:port][/path]?service=NAME&nodeid=UUID&nodename=NAME
//! ```
//!
//! plus the legacy short form `tcp://nodeid_or_name/service`. Special
//! schemes imply default ports: 48653 for TCP variants, 80/443 for
//! websocket variants. In-process URLs (`rr+intra`) carry no authority and
//! address the peer by `nodename`.

use crate::config::{DEFAULT_TCP_PORT, DEFAULT_WSS_PORT, DEFAULT_WS_PORT};
use crate::error::{Error, Result};
use crate::message::NodeId;

/// Schemes understood by the parser.
const KNOWN_SCHEMES: &[&str] = &[
    "tcp", "rr+tcp", "rrs+tcp", "rr+ws", "rrs+ws", "rr+wss", "rr+local", "rr+intra",
];

/// Decomposed connection URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Expected node id of the peer, when pinned by the URL.
    pub node_id: Option<NodeId>,
    /// Expected node name of the peer ("" when unspecified).
    pub node_name: String,
    /// Service to connect to on the peer node.
    pub service: String,
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "tcp" | "rr+tcp" | "rrs+tcp" => DEFAULT_TCP_PORT,
        "rr+ws" => DEFAULT_WS_PORT,
        "rrs+ws" | "rr+wss" => DEFAULT_WSS_PORT,
        _ => 0,
    }
}

/// Parse a connection URL.
pub fn parse_connection_url(url: &str) -> Result<ParsedUrl> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::InvalidArgument(format!("missing scheme in URL: {}", url)))?;

    if !KNOWN_SCHEMES.contains(&scheme) {
        return Err(Error::InvalidArgument(format!(
            "unknown URL scheme \"{}\"",
            scheme
        )));
    }

    let (location, query) = match rest.split_once('?') {
        Some((l, q)) => (l, Some(q)),
        None => (rest, None),
    };

    let (authority, path) = match location.split_once('/') {
        Some((a, p)) => (a, format!("/{}", p)),
        None => (location, String::new()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid port in URL: {}", url)))?;
            (h.to_string(), port)
        }
        _ => (authority.to_string(), default_port(scheme)),
    };

    let mut node_id = None;
    let mut node_name = String::new();
    let mut service = String::new();

    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("malformed query parameter \"{}\"", pair))
            })?;
            match key {
                "service" => service = value.to_string(),
                "nodename" => node_name = value.to_string(),
                "nodeid" => node_id = Some(value.parse::<NodeId>()?),
                // Unknown parameters are ignored for forward compatibility.
                _ => {}
            }
        }
    }

    // Legacy short form: tcp://nodeid_or_name/service
    if scheme == "tcp" && service.is_empty() && path.len() > 1 {
        service = path[1..].to_string();
        match host.parse::<NodeId>() {
            Ok(id) => node_id = Some(id),
            Err(_) => node_name = host.clone(),
        }
        return Ok(ParsedUrl {
            scheme: scheme.to_string(),
            host: String::new(),
            port,
            path: String::new(),
            node_id,
            node_name,
            service,
        });
    }

    if service.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "URL does not name a service: {}",
            url
        )));
    }

    Ok(ParsedUrl {
        scheme: scheme.to_string(),
        host,
        port,
        path,
        node_id,
        node_name,
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tcp_url() {
        let u = parse_connection_url("rr+tcp://robot.local:2354/?service=camera")
            .expect("canonical URL parses");
        assert_eq!(u.scheme, "rr+tcp");
        assert_eq!(u.host, "robot.local");
        assert_eq!(u.port, 2354);
        assert_eq!(u.service, "camera");
        assert!(u.node_id.is_none());
    }

    #[test]
    fn default_ports_by_scheme() {
        let tcp = parse_connection_url("rr+tcp://h/?service=s").expect("tcp");
        assert_eq!(tcp.port, DEFAULT_TCP_PORT);
        let secure = parse_connection_url("rrs+tcp://h/?service=s").expect("rrs+tcp");
        assert_eq!(secure.port, DEFAULT_TCP_PORT);
        let ws = parse_connection_url("rr+ws://h/?service=s").expect("ws");
        assert_eq!(ws.port, DEFAULT_WS_PORT);
        let wss = parse_connection_url("rr+wss://h/?service=s").expect("wss");
        assert_eq!(wss.port, DEFAULT_WSS_PORT);
    }

    #[test]
    fn query_parameters() {
        let id = NodeId::random();
        let url = format!(
            "rr+tcp://10.0.0.5/?service=arm&nodeid={}&nodename=robot1",
            id
        );
        let u = parse_connection_url(&url).expect("URL with full query parses");
        assert_eq!(u.node_id, Some(id));
        assert_eq!(u.node_name, "robot1");
        assert_eq!(u.service, "arm");
    }

    #[test]
    fn legacy_short_form_by_name() {
        let u = parse_connection_url("tcp://robot1/camera").expect("legacy form parses");
        assert_eq!(u.node_name, "robot1");
        assert_eq!(u.service, "camera");
        assert_eq!(u.port, DEFAULT_TCP_PORT);
    }

    #[test]
    fn legacy_short_form_by_node_id() {
        let id = NodeId::random();
        let u = parse_connection_url(&format!("tcp://{}/camera", id)).expect("legacy id form");
        assert_eq!(u.node_id, Some(id));
        assert!(u.node_name.is_empty());
        assert_eq!(u.service, "camera");
    }

    #[test]
    fn intra_url() {
        let u = parse_connection_url("rr+intra:///?service=echo&nodename=server_node")
            .expect("intra URL parses");
        assert_eq!(u.scheme, "rr+intra");
        assert!(u.host.is_empty());
        assert_eq!(u.node_name, "server_node");
        assert_eq!(u.service, "echo");
    }

    #[test]
    fn rejects_unknown_scheme_and_missing_service() {
        assert!(parse_connection_url("ftp://h/?service=s").is_err());
        assert!(parse_connection_url("rr+tcp://h/").is_err());
        assert!(parse_connection_url("no-scheme-at-all").is_err());
    }
}
