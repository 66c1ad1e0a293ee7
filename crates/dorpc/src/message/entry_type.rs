// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Message entry type numbering.
//!
//! Entry types are stable wire values partitioned into ranges:
//!
//! | Range | Meaning |
//! |-------|---------|
//! | 100-199 | Special requests, handled centrally by the node |
//! | 1000-1099 | Member operations, routed to service skeletons |
//! | 1100-1119 | Pipe sub-protocol |
//! | 1120-1139 | Wire sub-protocol (reserved) |
//! | 1140-1159 | Memory sub-protocol (reserved) |
//!
//! Invariant: every response type equals its request type + 1. Requests are
//! odd, responses even, which lets generic error-return synthesis build a
//! response entry for any request without a per-type table.

/// Wire entry type of one logical operation inside a message.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Null = 0,

    // Special requests (node-to-node control plane)
    GetNodeInfo = 101,
    GetNodeInfoRet = 102,
    ObjectTypeName = 103,
    ObjectTypeNameRet = 104,
    GetServiceDesc = 105,
    GetServiceDescRet = 106,
    ConnectClient = 107,
    ConnectClientRet = 108,
    DisconnectClient = 109,
    DisconnectClientRet = 110,
    ConnectionTest = 111,
    ConnectionTestRet = 112,
    NodeCheckCapability = 113,
    NodeCheckCapabilityRet = 114,
    GetServiceAttributes = 115,
    GetServiceAttributesRet = 116,
    ConnectClientCombined = 117,
    ConnectClientCombinedRet = 118,

    // Member operations
    PropertyGetReq = 1001,
    PropertyGetRes = 1002,
    PropertySetReq = 1003,
    PropertySetRes = 1004,
    FunctionCallReq = 1011,
    FunctionCallRes = 1012,
    GeneratorNextReq = 1013,
    GeneratorNextRes = 1014,
    EventReq = 1021,
    EventRes = 1022,
    ObjectLockReq = 1031,
    ObjectLockRes = 1032,
    ObjectUnlockReq = 1033,
    ObjectUnlockRes = 1034,

    // Pipe sub-protocol
    PipeConnectReq = 1101,
    PipeConnectRet = 1102,
    PipeDisconnectReq = 1103,
    PipeDisconnectRet = 1104,
    PipePacket = 1105,
    PipePacketRet = 1106,
    PipeClosed = 1107,
    PipeClosedRet = 1108,

    // Wire sub-protocol (reserved, not implemented by this crate)
    WireConnectReq = 1121,
    WireConnectRet = 1122,
    WireDisconnectReq = 1123,
    WireDisconnectRet = 1124,
    WirePacket = 1125,
    WirePacketRet = 1126,

    // Memory sub-protocol (reserved, not implemented by this crate)
    MemoryReadReq = 1141,
    MemoryReadRet = 1142,
    MemoryWriteReq = 1143,
    MemoryWriteRet = 1144,
}

impl EntryType {
    /// Wire value.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Decode a wire value. Returns `None` for values outside the table.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        let t = match value {
            0 => Self::Null,
            101 => Self::GetNodeInfo,
            102 => Self::GetNodeInfoRet,
            103 => Self::ObjectTypeName,
            104 => Self::ObjectTypeNameRet,
            105 => Self::GetServiceDesc,
            106 => Self::GetServiceDescRet,
            107 => Self::ConnectClient,
            108 => Self::ConnectClientRet,
            109 => Self::DisconnectClient,
            110 => Self::DisconnectClientRet,
            111 => Self::ConnectionTest,
            112 => Self::ConnectionTestRet,
            113 => Self::NodeCheckCapability,
            114 => Self::NodeCheckCapabilityRet,
            115 => Self::GetServiceAttributes,
            116 => Self::GetServiceAttributesRet,
            117 => Self::ConnectClientCombined,
            118 => Self::ConnectClientCombinedRet,
            1001 => Self::PropertyGetReq,
            1002 => Self::PropertyGetRes,
            1003 => Self::PropertySetReq,
            1004 => Self::PropertySetRes,
            1011 => Self::FunctionCallReq,
            1012 => Self::FunctionCallRes,
            1013 => Self::GeneratorNextReq,
            1014 => Self::GeneratorNextRes,
            1021 => Self::EventReq,
            1022 => Self::EventRes,
            1031 => Self::ObjectLockReq,
            1032 => Self::ObjectLockRes,
            1033 => Self::ObjectUnlockReq,
            1034 => Self::ObjectUnlockRes,
            1101 => Self::PipeConnectReq,
            1102 => Self::PipeConnectRet,
            1103 => Self::PipeDisconnectReq,
            1104 => Self::PipeDisconnectRet,
            1105 => Self::PipePacket,
            1106 => Self::PipePacketRet,
            1107 => Self::PipeClosed,
            1108 => Self::PipeClosedRet,
            1121 => Self::WireConnectReq,
            1122 => Self::WireConnectRet,
            1123 => Self::WireDisconnectReq,
            1124 => Self::WireDisconnectRet,
            1125 => Self::WirePacket,
            1126 => Self::WirePacketRet,
            1141 => Self::MemoryReadReq,
            1142 => Self::MemoryReadRet,
            1143 => Self::MemoryWriteReq,
            1144 => Self::MemoryWriteRet,
            _ => return None,
        };
        Some(t)
    }

    /// True for request types (odd wire value, excluding `Null`).
    #[must_use]
    pub fn is_request(self) -> bool {
        self != Self::Null && self.as_u16() % 2 == 1
    }

    /// True for response types (even wire value, excluding `Null`).
    #[must_use]
    pub fn is_response(self) -> bool {
        self != Self::Null && self.as_u16() % 2 == 0
    }

    /// Matching response type for a request (request + 1).
    #[must_use]
    pub fn response_type(self) -> Option<Self> {
        if !self.is_request() {
            return None;
        }
        Self::from_u16(self.as_u16() + 1)
    }

    /// True for control-plane requests handled centrally by the node.
    #[must_use]
    pub fn is_special_request(self) -> bool {
        let v = self.as_u16();
        (100..200).contains(&v) && self.is_request()
    }

    /// True for entry types in the pipe-reserved range.
    #[must_use]
    pub fn is_pipe_op(self) -> bool {
        (1100..1120).contains(&self.as_u16())
    }

    /// True for member operations routed to service skeletons.
    #[must_use]
    pub fn is_member_op(self) -> bool {
        (1000..1100).contains(&self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_request_plus_one() {
        let requests = [
            EntryType::GetNodeInfo,
            EntryType::ConnectClientCombined,
            EntryType::PropertyGetReq,
            EntryType::FunctionCallReq,
            EntryType::PipeConnectReq,
            EntryType::PipePacket,
            EntryType::PipeClosed,
        ];
        for req in requests {
            let res = req.response_type().expect("request has a response type");
            assert_eq!(res.as_u16(), req.as_u16() + 1);
            assert!(res.is_response());
        }
    }

    #[test]
    fn responses_have_no_response_type() {
        assert!(EntryType::PropertyGetRes.response_type().is_none());
        assert!(EntryType::Null.response_type().is_none());
    }

    #[test]
    fn special_request_range() {
        assert!(EntryType::ConnectClient.is_special_request());
        assert!(EntryType::ConnectionTest.is_special_request());
        assert!(!EntryType::ConnectClientRet.is_special_request());
        assert!(!EntryType::PropertyGetReq.is_special_request());
        assert!(!EntryType::PipeConnectReq.is_special_request());
    }

    #[test]
    fn pipe_range() {
        assert!(EntryType::PipeConnectReq.is_pipe_op());
        assert!(EntryType::PipePacketRet.is_pipe_op());
        assert!(EntryType::PipeClosedRet.is_pipe_op());
        assert!(!EntryType::WirePacket.is_pipe_op());
        assert!(!EntryType::FunctionCallReq.is_pipe_op());
    }

    #[test]
    fn wire_value_roundtrip() {
        for v in 0..=2000u16 {
            if let Some(t) = EntryType::from_u16(v) {
                assert_eq!(t.as_u16(), v);
            }
        }
    }
}
