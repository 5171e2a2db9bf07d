//! Error types for guest control operations.
//!
//! Every guest call and every host call ends in exactly one enumerated
//! outcome. Failures are [`GuestCtlError`] values; informational successes
//! (a cancelled wait, a warning-level "not found") are carried by
//! [`CallStatus`](crate::completion::CallStatus) so callers can branch on
//! them without treating them as errors.
//!
//! # Error Classification
//!
//! - **Protocol violations**: the caller broke the calling contract (wrong
//!   parameter shape, second blocking call, unknown function)
//! - **Conflicts**: the request is well formed but collides with current
//!   state (duplicate session id, registry full, already bound)
//! - **Transient**: expected outcomes such as an empty queue
//! - **Security**: requestor not entitled to the operation
//! - **Resource exhaustion**: allocation failure while copying payloads
//! - **Legacy**: soft failures that drive the old wait retry loop
//!
//! # Status Codes
//!
//! [`GuestCtlError::code`] maps each variant to the signed status code that
//! the transport hands back to the guest. The numbering is stable.

use std::fmt;

use thiserror::Error;

/// Status code reported for a plain success.
pub const STATUS_SUCCESS: i32 = 0;

/// Status code reported by a cancelled peek wait.
pub const STATUS_INFO_TRY_AGAIN: i32 = 52;

/// Status code reported when a warning-level lookup found nothing.
pub const STATUS_WARN_NOT_FOUND: i32 = 78;

/// Status code for "not supported".
///
/// Also the default result code a guest reports upstream when it skips a
/// message it cannot handle.
pub const STATUS_NOT_SUPPORTED: i32 = -37;

/// One receive buffer that was too small during a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShortfall {
    /// Parameter index of the buffer.
    pub index: usize,
    /// Bytes the source parameter holds.
    pub required: usize,
    /// Bytes the receiver offered.
    pub available: usize,
}

/// Errors produced by the guest control broker.
///
/// These are returned to the immediate caller: a guest call completion, or
/// the return value of a host call. They never cross the router boundary as
/// panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestCtlError {
    /// The call carried the wrong number of parameters.
    #[error("wrong parameter count: got {actual}")]
    WrongParameterCount {
        /// Number of parameters supplied.
        actual: usize,
    },

    /// A parameter had the wrong type.
    #[error("wrong parameter type at index {index}")]
    WrongParameterType {
        /// Index of the offending parameter.
        index: usize,
    },

    /// A parameter value is out of its permitted set.
    #[error("invalid parameter: {reason}")]
    InvalidParameter {
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// A numeric parameter is outside its permitted range.
    #[error("value {value} out of range")]
    OutOfRange {
        /// The rejected value.
        value: u64,
    },

    /// A buffer parameter is smaller than the minimum size.
    #[error("buffer underflow: {size} bytes, minimum {min}")]
    BufferUnderflow {
        /// Size supplied.
        size: usize,
        /// Minimum accepted size.
        min: usize,
    },

    /// One or more receive buffers were too small.
    ///
    /// Every short buffer is listed so the caller can resize all of them
    /// before retrying.
    #[error("buffer overflow in {} parameter(s)", .shortfalls.len())]
    BufferOverflow {
        /// The buffers that did not fit.
        shortfalls: Vec<BufferShortfall>,
    },

    /// A buffer parameter exceeds the maximum size.
    #[error("buffer too large: {size} bytes, maximum {max}")]
    BufferTooLarge {
        /// Size supplied.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The queue head does not match what the caller expected.
    #[error("message mismatch: expected {expected}, queued {actual}")]
    Mismatch {
        /// Message type the caller declared.
        expected: u32,
        /// Message type at the head of the queue.
        actual: u32,
    },

    /// A session key did not match the prepared key.
    #[error("session key mismatch for session {session_id}")]
    KeyMismatch {
        /// The session id being accepted.
        session_id: u32,
    },

    /// Nothing to retrieve right now.
    #[error("try again")]
    TryAgain,

    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,

    /// A second blocking call or second claim on a held resource.
    #[error("resource busy")]
    ResourceBusy,

    /// The entry already exists.
    #[error("duplicate: {what} {id}")]
    Duplicate {
        /// What kind of entity collided.
        what: &'static str,
        /// Identifier that collided.
        id: u32,
    },

    /// A fixed-capacity table is full.
    #[error("out of resources: limit {limit} reached")]
    OutOfResources {
        /// The capacity limit.
        limit: usize,
    },

    /// The requestor is not entitled to this operation.
    #[error("access denied")]
    AccessDenied,

    /// The requestor predates the protocol that this operation needs.
    #[error("requestor protocol version mismatch")]
    VersionMismatch,

    /// The call arrived in a state that does not permit it.
    #[error("wrong order: {reason}")]
    WrongOrder {
        /// What ordering rule was violated.
        reason: &'static str,
    },

    /// The function is recognised but deliberately not implemented.
    #[error("not implemented")]
    NotImplemented,

    /// The function number is not recognised.
    #[error("invalid function {function}")]
    InvalidFunction {
        /// The function number received.
        function: u32,
    },

    /// No host extension is registered to receive the notification.
    #[error("not supported")]
    NotSupported,

    /// Allocation failed while deep-copying parameters.
    #[error("out of memory")]
    NoMemory,

    /// The call names a client that is not connected.
    #[error("invalid client id {client_id}")]
    InvalidClientId {
        /// The unknown client id.
        client_id: u32,
    },

    /// The message does not fit; peek again for its shape.
    #[error("too much data")]
    TooMuchData,

    /// The guest side cancelled the call while it was being completed.
    #[error("cancelled")]
    Cancelled,

    /// The VM was restored since the guest last looked.
    #[error("vm restored: current session id {current:#x}")]
    VmRestored {
        /// The session id the guest should adopt.
        current: u64,
    },

    /// A saved-state blob has an unexpected layout version.
    #[error("saved state format changed: version {version}")]
    SavedStateFormatChanged {
        /// The version found in the blob.
        version: u32,
    },

    /// A host extension reported a failure with its own status code.
    #[error("host extension failed with status {status}")]
    Host {
        /// Status code returned by the extension.
        status: i32,
    },
}

impl GuestCtlError {
    /// Creates a wrong parameter count error.
    #[must_use]
    pub const fn wrong_count(actual: usize) -> Self {
        Self::WrongParameterCount { actual }
    }

    /// Creates a wrong parameter type error.
    #[must_use]
    pub const fn wrong_type(index: usize) -> Self {
        Self::WrongParameterType { index }
    }

    /// Creates a wrong order error.
    #[must_use]
    pub const fn wrong_order(reason: &'static str) -> Self {
        Self::WrongOrder { reason }
    }

    /// Returns the status code forwarded to the guest.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter { .. } => -2,
            Self::NoMemory => -8,
            Self::VersionMismatch => -11,
            Self::NotImplemented => -12,
            Self::WrongOrder { .. } => -22,
            Self::InvalidFunction { .. } => -36,
            Self::NotSupported => STATUS_NOT_SUPPORTED,
            Self::AccessDenied => -38,
            Self::BufferOverflow { .. } | Self::BufferTooLarge { .. } => -41,
            Self::TooMuchData => -42,
            Self::TryAgain => -52,
            Self::OutOfRange { .. } => -54,
            Self::Cancelled => -70,
            Self::NotFound => -78,
            Self::OutOfResources { .. } => -80,
            Self::Duplicate { .. } => -98,
            Self::ResourceBusy => -138,
            Self::SavedStateFormatChanged { .. } => -1843,
            Self::VmRestored { .. } => -1861,
            Self::WrongParameterCount { .. } => -2905,
            Self::WrongParameterType { .. } => -2906,
            Self::InvalidClientId { .. } => -2907,
            Self::Mismatch { .. } | Self::KeyMismatch { .. } => -22408,
            Self::BufferUnderflow { .. } => -22413,
            Self::Host { status } => *status,
        }
    }

    /// Returns `true` for expected, non-fatal outcomes that are not logged
    /// as errors.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TryAgain | Self::NotFound)
    }

    /// Returns the error classification for this error.
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            Self::WrongParameterCount { .. }
            | Self::WrongParameterType { .. }
            | Self::InvalidParameter { .. }
            | Self::OutOfRange { .. }
            | Self::BufferUnderflow { .. }
            | Self::BufferTooLarge { .. }
            | Self::ResourceBusy
            | Self::WrongOrder { .. }
            | Self::NotImplemented
            | Self::InvalidFunction { .. }
            | Self::InvalidClientId { .. } => ErrorClass::Protocol,
            Self::Duplicate { .. }
            | Self::OutOfResources { .. }
            | Self::Mismatch { .. }
            | Self::KeyMismatch { .. }
            | Self::BufferOverflow { .. }
            | Self::VmRestored { .. }
            | Self::SavedStateFormatChanged { .. } => ErrorClass::Conflict,
            Self::TryAgain | Self::NotFound | Self::Cancelled => ErrorClass::Transient,
            Self::AccessDenied | Self::VersionMismatch => ErrorClass::Security,
            Self::NoMemory => ErrorClass::ResourceExhaustion,
            Self::TooMuchData => ErrorClass::Legacy,
            Self::NotSupported | Self::Host { .. } => ErrorClass::Host,
        }
    }
}

/// Error classification for logging and host diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller broke the calling contract.
    Protocol,
    /// The request collides with existing state.
    Conflict,
    /// Expected, frequent, non-fatal.
    Transient,
    /// Requestor lacks the required privilege.
    Security,
    /// Allocation failure.
    ResourceExhaustion,
    /// Soft failure of the old wait protocol.
    Legacy,
    /// Failure reported by, or due to the absence of, the host extension.
    Host,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => write!(f, "protocol"),
            Self::Conflict => write!(f, "conflict"),
            Self::Transient => write!(f, "transient"),
            Self::Security => write!(f, "security"),
            Self::ResourceExhaustion => write!(f, "resource_exhaustion"),
            Self::Legacy => write!(f, "legacy"),
            Self::Host => write!(f, "host"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_for_every_error() {
        let samples = [
            GuestCtlError::wrong_count(0),
            GuestCtlError::wrong_type(1),
            GuestCtlError::TryAgain,
            GuestCtlError::NotFound,
            GuestCtlError::ResourceBusy,
            GuestCtlError::AccessDenied,
            GuestCtlError::TooMuchData,
            GuestCtlError::NoMemory,
            GuestCtlError::BufferOverflow { shortfalls: vec![] },
            GuestCtlError::InvalidFunction { function: 999 },
        ];
        for err in samples {
            assert!(err.code() < 0, "{err} must map to a failure code");
        }
    }

    #[test]
    fn not_supported_code_matches_default_skip_code() {
        assert_eq!(GuestCtlError::NotSupported.code(), STATUS_NOT_SUPPORTED);
    }

    #[test]
    fn host_status_passes_through() {
        assert_eq!(GuestCtlError::Host { status: -4242 }.code(), -4242);
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(GuestCtlError::TryAgain.is_transient());
        assert!(GuestCtlError::NotFound.is_transient());
        assert!(!GuestCtlError::AccessDenied.is_transient());
        assert_eq!(GuestCtlError::AccessDenied.error_class(), ErrorClass::Security);
        assert_eq!(
            GuestCtlError::InvalidFunction { function: 7 }.error_class(),
            ErrorClass::Protocol
        );
    }

    #[test]
    fn overflow_display_counts_shortfalls() {
        let err = GuestCtlError::BufferOverflow {
            shortfalls: vec![
                BufferShortfall {
                    index: 1,
                    required: 10,
                    available: 4,
                },
                BufferShortfall {
                    index: 3,
                    required: 8,
                    available: 0,
                },
            ],
        };
        assert_eq!(err.to_string(), "buffer overflow in 2 parameter(s)");
    }
}
