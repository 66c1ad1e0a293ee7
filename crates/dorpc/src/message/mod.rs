// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! In-memory message model.
//!
//! A [`Message`] is the batching unit exchanged with transports: one header
//! plus an ordered list of [`MessageEntry`], each carrying one logical
//! operation (a property get, a function call, a pipe packet). Entries in one
//! message may address different members and service paths. Each entry holds
//! an ordered list of [`MessageElement`] tagged values.
//!
//! The wire binary codec is an external collaborator: it consumes and
//! produces this tree through the [`codec::WireCodec`] interface and the core
//! never inspects bytes.

pub mod codec;
mod entry_type;

pub use entry_type::EntryType;

use crate::error::{Error, ErrorCode, Result};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// NODE ID
// ============================================================================

/// 128-bit identifier of a node instance.
///
/// Immutable once assigned to a node; generated randomly when not
/// explicitly configured. The all-zero id is the "any" wildcard accepted as
/// a receiver by every node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    bytes: [u8; 16],
}

impl NodeId {
    /// The all-zero wildcard id.
    pub const ANY: NodeId = NodeId { bytes: [0; 16] };

    /// Generate a random node id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        for b in &mut bytes {
            *b = fastrand::u8(..);
        }
        // RFC 4122 version/variant bits, same shape as a v4 UUID
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self { bytes }
    }

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    /// Raw bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 16] {
        self.bytes
    }

    /// True for the all-zero wildcard.
    #[must_use]
    pub fn is_any(self) -> bool {
        self.bytes == [0; 16]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    /// Parse the canonical 8-4-4-4-12 hex form, with or without braces.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let hex: String = trimmed.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(Error::InvalidArgument(format!("invalid node id: {}", s)));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| Error::InvalidArgument(format!("invalid node id: {}", s)))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidArgument(format!("invalid node id: {}", s)))?;
        }
        Ok(Self { bytes })
    }
}

// ============================================================================
// MESSAGE FLAGS
// ============================================================================

/// Message may be dropped or reordered by the transport (pipe unreliable
/// mode hint).
pub const MESSAGE_FLAG_UNRELIABLE: u8 = 0x01;

// ============================================================================
// ELEMENTS
// ============================================================================

/// Tagged value carried by a message element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementData {
    /// No value.
    Void,
    /// Raw bytes / u8 array.
    Bytes(Vec<u8>),
    Int32Array(Vec<i32>),
    UInt32Array(Vec<u32>),
    Int64Array(Vec<i64>),
    UInt64Array(Vec<u64>),
    DoubleArray(Vec<f64>),
    SingleArray(Vec<f32>),
    /// UTF-8 string.
    Str(String),
    /// Nested named structure fields.
    Structure(Vec<MessageElement>),
    /// Nested ordered list.
    List(Vec<MessageElement>),
    /// Nested dictionary keyed by element name.
    Map(Vec<MessageElement>),
}

impl ElementData {
    /// Short type tag used in mismatch diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bytes(_) => "bytes",
            Self::Int32Array(_) => "int32[]",
            Self::UInt32Array(_) => "uint32[]",
            Self::Int64Array(_) => "int64[]",
            Self::UInt64Array(_) => "uint64[]",
            Self::DoubleArray(_) => "double[]",
            Self::SingleArray(_) => "single[]",
            Self::Str(_) => "string",
            Self::Structure(_) => "structure",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Single u32 scalar, or a mismatch error.
    pub fn as_u32(&self) -> Result<u32> {
        match self {
            Self::UInt32Array(v) if v.len() == 1 => Ok(v[0]),
            other => Err(Error::DataTypeMismatch(format!(
                "expected scalar uint32, got {}",
                other.kind()
            ))),
        }
    }

    /// Single i32 scalar, or a mismatch error.
    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Self::Int32Array(v) if v.len() == 1 => Ok(v[0]),
            other => Err(Error::DataTypeMismatch(format!(
                "expected scalar int32, got {}",
                other.kind()
            ))),
        }
    }

    /// String payload, or a mismatch error.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(Error::DataTypeMismatch(format!(
                "expected string, got {}",
                other.kind()
            ))),
        }
    }

    /// Nested element list for structure/list/map payloads.
    pub fn as_elements(&self) -> Result<&[MessageElement]> {
        match self {
            Self::Structure(v) | Self::List(v) | Self::Map(v) => Ok(v),
            other => Err(Error::DataTypeMismatch(format!(
                "expected nested elements, got {}",
                other.kind()
            ))),
        }
    }

    /// Convenience constructor for a scalar u32.
    #[must_use]
    pub fn scalar_u32(value: u32) -> Self {
        Self::UInt32Array(vec![value])
    }

    /// Convenience constructor for a scalar i32.
    #[must_use]
    pub fn scalar_i32(value: i32) -> Self {
        Self::Int32Array(vec![value])
    }
}

/// Element identifier: most elements are named, pipe packet elements are
/// keyed by the numeric pipe endpoint index instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementName {
    Str(String),
    Index(i32),
}

/// One tagged value inside a message entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageElement {
    pub name: ElementName,
    pub data: ElementData,
}

impl MessageElement {
    /// Named element.
    #[must_use]
    pub fn new(name: impl Into<String>, data: ElementData) -> Self {
        Self {
            name: ElementName::Str(name.into()),
            data,
        }
    }

    /// Index-keyed element (pipe endpoint index addressing).
    #[must_use]
    pub fn numbered(index: i32, data: ElementData) -> Self {
        Self {
            name: ElementName::Index(index),
            data,
        }
    }

    /// Name when the element is named.
    #[must_use]
    pub fn name_str(&self) -> Option<&str> {
        match &self.name {
            ElementName::Str(s) => Some(s),
            ElementName::Index(_) => None,
        }
    }

    /// Index when the element is index-keyed.
    #[must_use]
    pub fn number(&self) -> Option<i32> {
        match self.name {
            ElementName::Index(i) => Some(i),
            ElementName::Str(_) => None,
        }
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

/// One logical operation inside a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub entry_type: EntryType,
    /// Target object within the service ("servicename.subobject").
    pub service_path: String,
    /// Member addressed by this operation.
    pub member_name: String,
    /// Correlation id, unique within the sending endpoint's outstanding set.
    pub request_id: u32,
    /// Wire error code; 0 marks success.
    pub error_code: u16,
    pub metadata: String,
    pub elements: Vec<MessageElement>,
}

impl MessageEntry {
    /// Entry with only the type set.
    #[must_use]
    pub fn new(entry_type: EntryType) -> Self {
        Self {
            entry_type,
            service_path: String::new(),
            member_name: String::new(),
            request_id: 0,
            error_code: 0,
            metadata: String::new(),
            elements: Vec::new(),
        }
    }

    /// Entry addressing a member of a service path.
    #[must_use]
    pub fn with_member(
        entry_type: EntryType,
        service_path: impl Into<String>,
        member_name: impl Into<String>,
    ) -> Self {
        let mut e = Self::new(entry_type);
        e.service_path = service_path.into();
        e.member_name = member_name.into();
        e
    }

    /// Append an element.
    pub fn add_element(&mut self, element: MessageElement) -> &mut Self {
        self.elements.push(element);
        self
    }

    /// Find a named element.
    #[must_use]
    pub fn element(&self, name: &str) -> Option<&MessageElement> {
        self.elements.iter().find(|e| e.name_str() == Some(name))
    }

    /// Find a named element or fail with a protocol error.
    pub fn element_or_err(&self, name: &str) -> Result<&MessageElement> {
        self.element(name).ok_or_else(|| {
            Error::ProtocolError(format!(
                "missing element \"{}\" in {:?} entry",
                name, self.entry_type
            ))
        })
    }

    /// Find an index-keyed element.
    #[must_use]
    pub fn numbered_element(&self, index: i32) -> Option<&MessageElement> {
        self.elements.iter().find(|e| e.number() == Some(index))
    }

    /// Build the matching success response entry (type + 1, same
    /// correlation fields).
    pub fn make_response(&self) -> Result<MessageEntry> {
        let response_type = self.entry_type.response_type().ok_or_else(|| {
            Error::ProtocolError(format!("{:?} entry has no response type", self.entry_type))
        })?;
        let mut e = MessageEntry::with_member(
            response_type,
            self.service_path.clone(),
            self.member_name.clone(),
        );
        e.request_id = self.request_id;
        Ok(e)
    }

    /// Build an error response entry for this request.
    ///
    /// Falls back to a `Null` entry type when the entry is not a request, so
    /// error synthesis never fails at the transport boundary.
    #[must_use]
    pub fn make_error_response(&self, err: &Error) -> MessageEntry {
        let mut e = match self.make_response() {
            Ok(e) => e,
            Err(_) => {
                let mut e = MessageEntry::with_member(
                    EntryType::Null,
                    self.service_path.clone(),
                    self.member_name.clone(),
                );
                e.request_id = self.request_id;
                e
            }
        };
        e.set_error(err);
        e
    }

    /// Record an error on this entry as a `(code, name, description)` triple.
    pub fn set_error(&mut self, err: &Error) {
        self.error_code = err.code().as_u16();
        self.elements
            .push(MessageElement::new("errorname", ElementData::Str(err.error_name())));
        self.elements.push(MessageElement::new(
            "errorstring",
            ElementData::Str(err.description()),
        ));
    }

    /// Reconstruct the error recorded on this entry, if any.
    #[must_use]
    pub fn extract_error(&self) -> Option<Error> {
        if ErrorCode::from_u16(self.error_code) == ErrorCode::None {
            return None;
        }
        let name = self
            .element("errorname")
            .and_then(|e| e.data.as_str().ok())
            .unwrap_or("");
        let description = self
            .element("errorstring")
            .and_then(|e| e.data.as_str().ok())
            .unwrap_or("");
        Some(Error::from_wire(self.error_code, name, description))
    }
}

// ============================================================================
// HEADER AND MESSAGE
// ============================================================================

/// Routing header shared by all entries of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub sender_node_id: NodeId,
    pub receiver_node_id: NodeId,
    pub sender_endpoint: u32,
    pub receiver_endpoint: u32,
    pub sender_node_name: String,
    pub receiver_node_name: String,
    pub metadata: String,
    pub flags: u8,
    pub priority: u16,
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            sender_node_id: NodeId::ANY,
            receiver_node_id: NodeId::ANY,
            sender_endpoint: 0,
            receiver_endpoint: 0,
            sender_node_name: String::new(),
            receiver_node_name: String::new(),
            metadata: String::new(),
            flags: 0,
            priority: 0,
        }
    }
}

/// One wire message: header plus ordered entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: MessageHeader,
    pub entries: Vec<MessageEntry>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Message carrying a single entry.
    #[must_use]
    pub fn from_entry(entry: MessageEntry) -> Self {
        Self {
            header: MessageHeader::default(),
            entries: vec![entry],
        }
    }

    /// True when the unreliable transport hint is set.
    #[must_use]
    pub fn is_unreliable(&self) -> bool {
        self.header.flags & MESSAGE_FLAG_UNRELIABLE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_parse_roundtrip() {
        let id = NodeId::random();
        let text = id.to_string();
        let parsed: NodeId = text.parse().expect("canonical form parses");
        assert_eq!(parsed, id);

        let braced: NodeId = format!("{{{}}}", text).parse().expect("braced form parses");
        assert_eq!(braced, id);
    }

    #[test]
    fn node_id_rejects_garbage() {
        assert!("not-a-node-id".parse::<NodeId>().is_err());
        assert!("1234".parse::<NodeId>().is_err());
    }

    #[test]
    fn random_node_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
        assert!(!NodeId::random().is_any());
        assert!(NodeId::ANY.is_any());
    }

    #[test]
    fn entry_element_lookup() {
        let mut entry = MessageEntry::with_member(EntryType::FunctionCallReq, "svc", "do_thing");
        entry.add_element(MessageElement::new("a", ElementData::scalar_i32(7)));
        entry.add_element(MessageElement::numbered(3, ElementData::scalar_u32(9)));

        assert_eq!(
            entry.element("a").map(|e| &e.data),
            Some(&ElementData::scalar_i32(7))
        );
        assert!(entry.element("missing").is_none());
        assert!(entry.element_or_err("missing").is_err());
        assert_eq!(
            entry.numbered_element(3).map(|e| &e.data),
            Some(&ElementData::scalar_u32(9))
        );
    }

    #[test]
    fn response_synthesis_preserves_correlation() {
        let mut req = MessageEntry::with_member(EntryType::PropertyGetReq, "svc.sub", "position");
        req.request_id = 42;

        let res = req.make_response().expect("request has response type");
        assert_eq!(res.entry_type, EntryType::PropertyGetRes);
        assert_eq!(res.request_id, 42);
        assert_eq!(res.service_path, "svc.sub");
        assert_eq!(res.member_name, "position");
    }

    #[test]
    fn error_response_roundtrip() {
        let mut req = MessageEntry::with_member(EntryType::FunctionCallReq, "svc", "boom");
        req.request_id = 9;

        let err = Error::ObjectNotFound("svc.gone".to_string());
        let resp = req.make_error_response(&err);
        assert_eq!(resp.entry_type, EntryType::FunctionCallRes);
        assert_eq!(resp.request_id, 9);
        assert_eq!(resp.extract_error(), Some(err));
    }

    #[test]
    fn error_response_for_non_request_uses_null() {
        let res = MessageEntry::new(EntryType::PropertyGetRes);
        let resp = res.make_error_response(&Error::ProtocolError("bad".to_string()));
        assert_eq!(resp.entry_type, EntryType::Null);
        assert!(resp.extract_error().is_some());
    }

    #[test]
    fn unreliable_flag() {
        let mut m = Message::new();
        assert!(!m.is_unreliable());
        m.header.flags |= MESSAGE_FLAG_UNRELIABLE;
        assert!(m.is_unreliable());
    }
}
