//! Structured error type for the crate.
//!
//! Every failure the protocol can report — locally or across the wire — is a
//! variant of [`RpcError`]. Provider-side failures travel as an
//! [`ErrorDescriptor`] inside an error response; the consumer reconstructs
//! them as [`RpcError::Remote`] carrying the matching [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The failure taxonomy shared by both sides of a channel.
///
/// Each kind has a stable short code used on the wire when a provider runs
/// with [`ErrorVerbosity::Codes`]:
///
/// | Code | Kind                |
/// |------|---------------------|
/// | E001 | invalid-message     |
/// | E002 | forbidden-property  |
/// | E003 | root-not-settable   |
/// | E004 | readonly-violation  |
/// | E005 | write-denied        |
/// | E006 | not-a-function      |
/// | E007 | unknown-operation   |
/// | E008 | resolution-failed   |
/// | E009 | user-thrown         |
/// | E010 | timeout             |
/// | E011 | disposed            |
/// | E012 | channel-id-invalid  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidMessage,
    ForbiddenProperty,
    RootNotSettable,
    ReadonlyViolation,
    WriteDenied,
    NotAFunction,
    UnknownOperation,
    ResolutionFailed,
    UserThrown,
    Timeout,
    Disposed,
    ChannelIdInvalid,
}

impl ErrorKind {
    /// Stable short code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidMessage => "E001",
            ErrorKind::ForbiddenProperty => "E002",
            ErrorKind::RootNotSettable => "E003",
            ErrorKind::ReadonlyViolation => "E004",
            ErrorKind::WriteDenied => "E005",
            ErrorKind::NotAFunction => "E006",
            ErrorKind::UnknownOperation => "E007",
            ErrorKind::ResolutionFailed => "E008",
            ErrorKind::UserThrown => "E009",
            ErrorKind::Timeout => "E010",
            ErrorKind::Disposed => "E011",
            ErrorKind::ChannelIdInvalid => "E012",
        }
    }

    /// Inverse of [`ErrorKind::code`].
    pub fn from_code(code: &str) -> Option<ErrorKind> {
        match code {
            "E001" => Some(ErrorKind::InvalidMessage),
            "E002" => Some(ErrorKind::ForbiddenProperty),
            "E003" => Some(ErrorKind::RootNotSettable),
            "E004" => Some(ErrorKind::ReadonlyViolation),
            "E005" => Some(ErrorKind::WriteDenied),
            "E006" => Some(ErrorKind::NotAFunction),
            "E007" => Some(ErrorKind::UnknownOperation),
            "E008" => Some(ErrorKind::ResolutionFailed),
            "E009" => Some(ErrorKind::UserThrown),
            "E010" => Some(ErrorKind::Timeout),
            "E011" => Some(ErrorKind::Disposed),
            "E012" => Some(ErrorKind::ChannelIdInvalid),
            _ => None,
        }
    }

    /// Kebab-case name, e.g. `forbidden-property`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidMessage => "invalid-message",
            ErrorKind::ForbiddenProperty => "forbidden-property",
            ErrorKind::RootNotSettable => "root-not-settable",
            ErrorKind::ReadonlyViolation => "readonly-violation",
            ErrorKind::WriteDenied => "write-denied",
            ErrorKind::NotAFunction => "not-a-function",
            ErrorKind::UnknownOperation => "unknown-operation",
            ErrorKind::ResolutionFailed => "resolution-failed",
            ErrorKind::UserThrown => "user-thrown",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Disposed => "disposed",
            ErrorKind::ChannelIdInvalid => "channel-id-invalid",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much detail a provider puts into error descriptors it sends out.
///
/// `Verbose` carries the full human-readable message; `Codes` replaces it
/// with the short code so internal structure does not leak to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorVerbosity {
    #[default]
    Verbose,
    Codes,
}

/// Wire shape of a provider-side failure.
///
/// A plain object with a `message` and, when available, the kind code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Structured error type covering the whole protocol taxonomy.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum RpcError {
    // --- Message / path validation ---
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("forbidden property segment: {segment}")]
    ForbiddenProperty { segment: String },

    #[error("unknown operation type: {operation}")]
    UnknownOperation { operation: String },

    // --- Write policy ---
    #[error("the provider root is not settable")]
    RootNotSettable,

    #[error("property '{path}' is not assignable")]
    ReadonlyViolation { path: String },

    #[error("writes are disabled on this provider")]
    WriteDenied,

    // --- Resolution / dispatch ---
    #[error("target at '{path}' is not callable")]
    NotAFunction { path: String },

    #[error("could not resolve '{path}': {reason}")]
    ResolutionFailed { path: String, reason: String },

    #[error("{message}")]
    UserThrown { message: String },

    // --- Consumer-local ---
    #[error("request timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("consumer disposed")]
    Disposed,

    #[error("invalid channel id: {channel_id:?}")]
    ChannelIdInvalid { channel_id: String },

    /// A failure reported by the peer, reconstructed from its descriptor.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl RpcError {
    /// The taxonomy kind of this error, whether local or remote.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::InvalidMessage { .. } => ErrorKind::InvalidMessage,
            RpcError::ForbiddenProperty { .. } => ErrorKind::ForbiddenProperty,
            RpcError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            RpcError::RootNotSettable => ErrorKind::RootNotSettable,
            RpcError::ReadonlyViolation { .. } => ErrorKind::ReadonlyViolation,
            RpcError::WriteDenied => ErrorKind::WriteDenied,
            RpcError::NotAFunction { .. } => ErrorKind::NotAFunction,
            RpcError::ResolutionFailed { .. } => ErrorKind::ResolutionFailed,
            RpcError::UserThrown { .. } => ErrorKind::UserThrown,
            RpcError::Timeout { .. } => ErrorKind::Timeout,
            RpcError::Disposed => ErrorKind::Disposed,
            RpcError::ChannelIdInvalid { .. } => ErrorKind::ChannelIdInvalid,
            RpcError::Remote { kind, .. } => *kind,
        }
    }

    /// Render this error as a wire descriptor under the given verbosity.
    pub fn descriptor(&self, verbosity: ErrorVerbosity) -> ErrorDescriptor {
        let kind = self.kind();
        let message = match verbosity {
            ErrorVerbosity::Verbose => self.to_string(),
            ErrorVerbosity::Codes => kind.code().to_string(),
        };
        ErrorDescriptor {
            message,
            code: Some(kind.code().to_string()),
        }
    }

    /// Reconstruct an error from a peer's descriptor.
    ///
    /// A descriptor with no recognisable code is treated as `user-thrown`.
    pub fn from_descriptor(descriptor: &ErrorDescriptor) -> RpcError {
        let kind = descriptor
            .code
            .as_deref()
            .and_then(ErrorKind::from_code)
            .unwrap_or(ErrorKind::UserThrown);
        RpcError::Remote {
            kind,
            message: descriptor.message.clone(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::InvalidMessage {
            reason: e.to_string(),
        }
    }
}
