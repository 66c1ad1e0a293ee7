// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Error types for dorpc operations.
//!
//! One public [`Error`] enum covers the whole stack, grouped by category:
//! connection, protocol, service, control-flow sentinels, and internal
//! invariant violations. Remote errors travel as `(code, name, description)`
//! triples inside a message entry and are reconstructed into the equivalent
//! local variant on the receiving side; unknown remote names fall back to
//! [`Error::RemoteError`] rather than failing to deserialize.

use std::fmt;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by node, endpoint, and pipe operations.
///
/// Control-flow sentinels ([`Error::StopIteration`],
/// [`Error::OperationAborted`]) are not failures: they terminate generator
/// and pipe interactions by design and are mapped on the wire like every
/// other variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Connection-level
    // ========================================================================
    /// Transport failure or request timeout.
    ConnectionError(String),
    /// Stale or unknown endpoint id.
    InvalidEndpoint(String),
    /// Message addressed to a node id this node does not own.
    NodeNotFound(String),

    // ========================================================================
    // Protocol-level
    // ========================================================================
    /// Malformed command for a member type (missing element, bad entry type).
    ProtocolError(String),
    /// Wire payload cannot be interpreted at all.
    DataTypeError(String),
    /// Wire payload has a valid but unexpected shape.
    DataTypeMismatch(String),

    // ========================================================================
    // Service-level
    // ========================================================================
    /// Requested service is not registered on the node.
    ServiceNotFound(String),
    /// Service path does not resolve to an object.
    ObjectNotFound(String),
    /// Member name does not exist on the target object.
    MemberNotFound(String),
    /// Credentials rejected or authentication required.
    AuthenticationError(String),
    /// Service path is locked by another client endpoint.
    ObjectLocked(String),
    /// Write attempted on a read-only member.
    ReadOnlyMember(String),
    /// Read attempted on a write-only member.
    WriteOnlyMember(String),
    /// Caller-supplied argument rejected before any network interaction.
    InvalidArgument(String),

    // ========================================================================
    // Control-flow sentinels
    // ========================================================================
    /// Generator exhausted (terminates iteration, not a failure).
    StopIteration,
    /// Generator or pipe aborted by the caller.
    OperationAborted(String),

    // ========================================================================
    // Local state
    // ========================================================================
    /// Operation invalid for the object's current state (closed, shut down).
    InvalidOperation(String),

    // ========================================================================
    // Remote fallback
    // ========================================================================
    /// Remote error whose name has no local equivalent.
    RemoteError {
        /// Qualified error name as sent by the remote node.
        name: String,
        /// Human-readable description from the remote node.
        message: String,
    },

    // ========================================================================
    // Internal
    // ========================================================================
    /// Invariant violation inside the core. Indicates a dorpc bug, not a
    /// caller mistake.
    InternalError(String),
}

// ============================================================================
// WIRE ERROR CODES
// ============================================================================

/// Numeric error codes carried in message entries.
///
/// `None` (0) marks a successful response. Codes are stable wire values:
/// renumbering breaks interop with older peers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0,
    ConnectionError = 1,
    ProtocolError = 2,
    ServiceNotFound = 3,
    ObjectNotFound = 4,
    InvalidEndpoint = 5,
    MemberNotFound = 6,
    AuthenticationError = 7,
    ObjectLocked = 8,
    InvalidOperation = 9,
    InvalidArgument = 10,
    OperationAborted = 11,
    StopIteration = 12,
    DataTypeError = 13,
    DataTypeMismatch = 14,
    ReadOnlyMember = 15,
    WriteOnlyMember = 16,
    NodeNotFound = 17,
    RemoteError = 100,
    InternalError = 150,
}

impl ErrorCode {
    /// Decode a wire value. Unknown codes map to [`ErrorCode::RemoteError`]
    /// so newer peers never break older ones.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::None,
            1 => Self::ConnectionError,
            2 => Self::ProtocolError,
            3 => Self::ServiceNotFound,
            4 => Self::ObjectNotFound,
            5 => Self::InvalidEndpoint,
            6 => Self::MemberNotFound,
            7 => Self::AuthenticationError,
            8 => Self::ObjectLocked,
            9 => Self::InvalidOperation,
            10 => Self::InvalidArgument,
            11 => Self::OperationAborted,
            12 => Self::StopIteration,
            13 => Self::DataTypeError,
            14 => Self::DataTypeMismatch,
            15 => Self::ReadOnlyMember,
            16 => Self::WriteOnlyMember,
            17 => Self::NodeNotFound,
            150 => Self::InternalError,
            _ => Self::RemoteError,
        }
    }

    /// Wire value of this code.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl Error {
    /// Wire error code for this variant.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionError(_) => ErrorCode::ConnectionError,
            Self::InvalidEndpoint(_) => ErrorCode::InvalidEndpoint,
            Self::NodeNotFound(_) => ErrorCode::NodeNotFound,
            Self::ProtocolError(_) => ErrorCode::ProtocolError,
            Self::DataTypeError(_) => ErrorCode::DataTypeError,
            Self::DataTypeMismatch(_) => ErrorCode::DataTypeMismatch,
            Self::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
            Self::ObjectNotFound(_) => ErrorCode::ObjectNotFound,
            Self::MemberNotFound(_) => ErrorCode::MemberNotFound,
            Self::AuthenticationError(_) => ErrorCode::AuthenticationError,
            Self::ObjectLocked(_) => ErrorCode::ObjectLocked,
            Self::ReadOnlyMember(_) => ErrorCode::ReadOnlyMember,
            Self::WriteOnlyMember(_) => ErrorCode::WriteOnlyMember,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::StopIteration => ErrorCode::StopIteration,
            Self::OperationAborted(_) => ErrorCode::OperationAborted,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::RemoteError { .. } => ErrorCode::RemoteError,
            Self::InternalError(_) => ErrorCode::InternalError,
        }
    }

    /// Qualified error name carried on the wire.
    ///
    /// [`Error::RemoteError`] preserves the original remote name verbatim.
    #[must_use]
    pub fn error_name(&self) -> String {
        match self {
            Self::ConnectionError(_) => "dorpc.ConnectionError".to_string(),
            Self::InvalidEndpoint(_) => "dorpc.InvalidEndpoint".to_string(),
            Self::NodeNotFound(_) => "dorpc.NodeNotFound".to_string(),
            Self::ProtocolError(_) => "dorpc.ProtocolError".to_string(),
            Self::DataTypeError(_) => "dorpc.DataTypeError".to_string(),
            Self::DataTypeMismatch(_) => "dorpc.DataTypeMismatch".to_string(),
            Self::ServiceNotFound(_) => "dorpc.ServiceNotFound".to_string(),
            Self::ObjectNotFound(_) => "dorpc.ObjectNotFound".to_string(),
            Self::MemberNotFound(_) => "dorpc.MemberNotFound".to_string(),
            Self::AuthenticationError(_) => "dorpc.AuthenticationError".to_string(),
            Self::ObjectLocked(_) => "dorpc.ObjectLocked".to_string(),
            Self::ReadOnlyMember(_) => "dorpc.ReadOnlyMember".to_string(),
            Self::WriteOnlyMember(_) => "dorpc.WriteOnlyMember".to_string(),
            Self::InvalidArgument(_) => "dorpc.InvalidArgument".to_string(),
            Self::StopIteration => "dorpc.StopIteration".to_string(),
            Self::OperationAborted(_) => "dorpc.OperationAborted".to_string(),
            Self::InvalidOperation(_) => "dorpc.InvalidOperation".to_string(),
            Self::RemoteError { name, .. } => name.clone(),
            Self::InternalError(_) => "dorpc.InternalError".to_string(),
        }
    }

    /// Human-readable description carried on the wire.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::ConnectionError(m)
            | Self::InvalidEndpoint(m)
            | Self::NodeNotFound(m)
            | Self::ProtocolError(m)
            | Self::DataTypeError(m)
            | Self::DataTypeMismatch(m)
            | Self::ServiceNotFound(m)
            | Self::ObjectNotFound(m)
            | Self::MemberNotFound(m)
            | Self::AuthenticationError(m)
            | Self::ObjectLocked(m)
            | Self::ReadOnlyMember(m)
            | Self::WriteOnlyMember(m)
            | Self::InvalidArgument(m)
            | Self::OperationAborted(m)
            | Self::InvalidOperation(m)
            | Self::InternalError(m) => m.clone(),
            Self::StopIteration => String::new(),
            Self::RemoteError { message, .. } => message.clone(),
        }
    }

    /// Reconstruct an error from its wire `(code, name, description)` triple.
    ///
    /// Unknown codes and names fall back to [`Error::RemoteError`] so a peer
    /// with a richer taxonomy never breaks this node.
    #[must_use]
    pub fn from_wire(code: u16, name: &str, description: &str) -> Self {
        let msg = description.to_string();
        match ErrorCode::from_u16(code) {
            ErrorCode::None => {
                Self::InternalError("error reconstruction requested for code 0".to_string())
            }
            ErrorCode::ConnectionError => Self::ConnectionError(msg),
            ErrorCode::ProtocolError => Self::ProtocolError(msg),
            ErrorCode::ServiceNotFound => Self::ServiceNotFound(msg),
            ErrorCode::ObjectNotFound => Self::ObjectNotFound(msg),
            ErrorCode::InvalidEndpoint => Self::InvalidEndpoint(msg),
            ErrorCode::MemberNotFound => Self::MemberNotFound(msg),
            ErrorCode::AuthenticationError => Self::AuthenticationError(msg),
            ErrorCode::ObjectLocked => Self::ObjectLocked(msg),
            ErrorCode::InvalidOperation => Self::InvalidOperation(msg),
            ErrorCode::InvalidArgument => Self::InvalidArgument(msg),
            ErrorCode::OperationAborted => Self::OperationAborted(msg),
            ErrorCode::StopIteration => Self::StopIteration,
            ErrorCode::DataTypeError => Self::DataTypeError(msg),
            ErrorCode::DataTypeMismatch => Self::DataTypeMismatch(msg),
            ErrorCode::ReadOnlyMember => Self::ReadOnlyMember(msg),
            ErrorCode::WriteOnlyMember => Self::WriteOnlyMember(msg),
            ErrorCode::NodeNotFound => Self::NodeNotFound(msg),
            ErrorCode::InternalError => Self::InternalError(msg),
            ErrorCode::RemoteError => Self::RemoteError {
                name: name.to_string(),
                message: msg,
            },
        }
    }

    /// True for the control-flow sentinels that terminate an interaction
    /// without indicating a failure.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::StopIteration | Self::OperationAborted(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError(m) => write!(f, "Connection error: {}", m),
            Self::InvalidEndpoint(m) => write!(f, "Invalid endpoint: {}", m),
            Self::NodeNotFound(m) => write!(f, "Node not found: {}", m),
            Self::ProtocolError(m) => write!(f, "Protocol error: {}", m),
            Self::DataTypeError(m) => write!(f, "Data type error: {}", m),
            Self::DataTypeMismatch(m) => write!(f, "Data type mismatch: {}", m),
            Self::ServiceNotFound(m) => write!(f, "Service not found: {}", m),
            Self::ObjectNotFound(m) => write!(f, "Object not found: {}", m),
            Self::MemberNotFound(m) => write!(f, "Member not found: {}", m),
            Self::AuthenticationError(m) => write!(f, "Authentication error: {}", m),
            Self::ObjectLocked(m) => write!(f, "Object locked: {}", m),
            Self::ReadOnlyMember(m) => write!(f, "Read-only member: {}", m),
            Self::WriteOnlyMember(m) => write!(f, "Write-only member: {}", m),
            Self::InvalidArgument(m) => write!(f, "Invalid argument: {}", m),
            Self::StopIteration => write!(f, "Iteration complete"),
            Self::OperationAborted(m) => write!(f, "Operation aborted: {}", m),
            Self::InvalidOperation(m) => write!(f, "Invalid operation: {}", m),
            Self::RemoteError { name, message } => {
                write!(f, "Remote error {}: {}", name, message)
            }
            Self::InternalError(m) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip_all_variants() {
        let errors = [
            Error::ConnectionError("t".into()),
            Error::InvalidEndpoint("t".into()),
            Error::NodeNotFound("t".into()),
            Error::ProtocolError("t".into()),
            Error::DataTypeError("t".into()),
            Error::DataTypeMismatch("t".into()),
            Error::ServiceNotFound("t".into()),
            Error::ObjectNotFound("t".into()),
            Error::MemberNotFound("t".into()),
            Error::AuthenticationError("t".into()),
            Error::ObjectLocked("t".into()),
            Error::ReadOnlyMember("t".into()),
            Error::WriteOnlyMember("t".into()),
            Error::InvalidArgument("t".into()),
            Error::StopIteration,
            Error::OperationAborted("t".into()),
            Error::InvalidOperation("t".into()),
            Error::InternalError("t".into()),
        ];

        for err in errors {
            let rebuilt = Error::from_wire(
                err.code().as_u16(),
                &err.error_name(),
                &err.description(),
            );
            assert_eq!(rebuilt, err, "wire roundtrip changed {:?}", err);
        }
    }

    #[test]
    fn unknown_remote_name_falls_back_to_remote_error() {
        let err = Error::from_wire(100, "experimental.FluxCapacitorError", "underflow");
        assert_eq!(
            err,
            Error::RemoteError {
                name: "experimental.FluxCapacitorError".to_string(),
                message: "underflow".to_string(),
            }
        );
    }

    #[test]
    fn unknown_code_falls_back_to_remote_error() {
        let err = Error::from_wire(9999, "who.Knows", "future code");
        assert!(matches!(err, Error::RemoteError { .. }));
    }

    #[test]
    fn sentinels_are_not_failures() {
        assert!(Error::StopIteration.is_sentinel());
        assert!(Error::OperationAborted("done".into()).is_sentinel());
        assert!(!Error::ConnectionError("lost".into()).is_sentinel());
    }
}
