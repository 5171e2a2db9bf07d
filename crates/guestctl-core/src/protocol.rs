//! Function catalogs and identifier layouts shared with guest and host.
//!
//! # Context IDs
//!
//! A context id is a 32-bit correlation tag:
//!
//! ```text
//!  31      27 26          16 15                0
//! +----------+--------------+------------------+
//! | session  |    object    |      count       |
//! +----------+--------------+------------------+
//! ```
//!
//! # Destinations
//!
//! Host calls carry the context id in a 64-bit first parameter whose upper
//! bits select the delivery legs: [`DST_ROOT_SVC`] for the master client and
//! [`DST_SESSION`] for the client bound to the context's session.

use serde::{Deserialize, Serialize};

// ============================================================================
// Guest functions
// ============================================================================

/// Functions a guest client may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum GuestFn {
    /// Legacy blocking wait for the next message.
    Wait = 1,
    /// Cancel a blocked peek or wait.
    Cancel = 2,
    /// Host-bound notice that a client went away with work queued.
    Disconnected = 3,
    /// Legacy one-shot session filter.
    FilterSet = 4,
    /// Legacy filter removal, never implemented.
    FilterUnset = 5,
    /// Report the head message shape, or try-again.
    PeekNoWait = 6,
    /// Report the head message shape, blocking until one arrives.
    PeekWait = 7,
    /// Retrieve and consume the head message.
    Get = 8,
    /// Legacy skip.
    SkipOld = 9,
    /// Generic reply to a host command.
    Reply = 10,
    /// Progress update for a host command.
    ProgressUpdate = 11,
    /// Drop the head message and notify the host.
    Skip = 12,
    /// Claim the master role.
    MakeMeMaster = 13,
    /// Stage a session for another client to accept.
    SessionPrepare = 14,
    /// Withdraw a staged session.
    SessionCancelPrepared = 15,
    /// Accept a staged session.
    SessionAccept = 16,
    /// Ask the session's owner to close it.
    SessionClose = 17,
    /// Exchange feature words, master only.
    ReportFeatures = 18,
    /// Query host feature words.
    QueryFeatures = 19,
    /// Session status notification.
    SessionNotify = 20,
    /// Process output.
    ExecOutput = 100,
    /// Process status.
    ExecStatus = 101,
    /// Process input status.
    ExecInputStatus = 102,
    /// Process I/O notification.
    ExecIoNotify = 210,
    /// Directory notification.
    DirNotify = 230,
    /// File notification.
    FileNotify = 240,
}

impl GuestFn {
    /// Parses a raw function number.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Wait,
            2 => Self::Cancel,
            3 => Self::Disconnected,
            4 => Self::FilterSet,
            5 => Self::FilterUnset,
            6 => Self::PeekNoWait,
            7 => Self::PeekWait,
            8 => Self::Get,
            9 => Self::SkipOld,
            10 => Self::Reply,
            11 => Self::ProgressUpdate,
            12 => Self::Skip,
            13 => Self::MakeMeMaster,
            14 => Self::SessionPrepare,
            15 => Self::SessionCancelPrepared,
            16 => Self::SessionAccept,
            17 => Self::SessionClose,
            18 => Self::ReportFeatures,
            19 => Self::QueryFeatures,
            20 => Self::SessionNotify,
            100 => Self::ExecOutput,
            101 => Self::ExecStatus,
            102 => Self::ExecInputStatus,
            210 => Self::ExecIoNotify,
            230 => Self::DirNotify,
            240 => Self::FileNotify,
            _ => return None,
        })
    }

    /// Returns the raw function number.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Returns `true` for functions relayed verbatim to the host.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        matches!(
            self,
            Self::Reply
                | Self::ProgressUpdate
                | Self::SessionNotify
                | Self::ExecOutput
                | Self::ExecStatus
                | Self::ExecInputStatus
                | Self::ExecIoNotify
                | Self::DirNotify
                | Self::FileNotify
        )
    }

    /// Forwarded functions an unbound client may use in legacy mode.
    #[must_use]
    pub const fn is_legacy_unbound_allowed(self) -> bool {
        matches!(self, Self::ExecStatus | Self::SessionNotify)
    }
}

// ============================================================================
// Host messages
// ============================================================================

/// Host commands the broker knows by name.
///
/// Unlisted values are still routed; the list only drives skip handling and
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum HostMsg {
    /// Sentinel placed in a cancelled wait's first slot. Never queued.
    CancelPendingWaits = 0,
    /// Start a guest session.
    SessionCreate = 20,
    /// Close a guest session.
    SessionClose = 21,
    /// Start a process.
    ExecCmd = 100,
    /// Feed process input.
    ExecSetInput = 101,
    /// Read process output.
    ExecGetOutput = 102,
    /// Terminate a process.
    ExecTerminate = 110,
    /// Wait for a process event.
    ExecWaitFor = 120,
    /// Open a file.
    FileOpen = 240,
    /// Close a file.
    FileClose = 241,
    /// Read from the current offset.
    FileRead = 250,
    /// Read at an offset.
    FileReadAt = 251,
    /// Write at the current offset.
    FileWrite = 260,
    /// Write at an offset.
    FileWriteAt = 261,
    /// Seek.
    FileSeek = 270,
    /// Tell.
    FileTell = 271,
    /// Truncate or extend.
    FileSetSize = 272,
    /// Remove a directory.
    DirRemove = 320,
    /// Rename a path.
    PathRename = 330,
    /// Resolve the user documents directory.
    PathUserDocuments = 331,
    /// Resolve the user home directory.
    PathUserHome = 332,
}

impl HostMsg {
    /// Parses a raw message number.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::CancelPendingWaits,
            20 => Self::SessionCreate,
            21 => Self::SessionClose,
            100 => Self::ExecCmd,
            101 => Self::ExecSetInput,
            102 => Self::ExecGetOutput,
            110 => Self::ExecTerminate,
            120 => Self::ExecWaitFor,
            240 => Self::FileOpen,
            241 => Self::FileClose,
            250 => Self::FileRead,
            251 => Self::FileReadAt,
            260 => Self::FileWrite,
            261 => Self::FileWriteAt,
            270 => Self::FileSeek,
            271 => Self::FileTell,
            272 => Self::FileSetSize,
            320 => Self::DirRemove,
            330 => Self::PathRename,
            331 => Self::PathUserDocuments,
            332 => Self::PathUserHome,
            _ => return None,
        })
    }

    /// Returns the raw message number.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

// ============================================================================
// Context ids and destinations
// ============================================================================

/// Destination bit: deliver to the master (root service) client.
pub const DST_ROOT_SVC: u64 = 1 << 63;

/// Destination bit: deliver to the client bound to the context's session.
pub const DST_SESSION: u64 = 1 << 62;

/// Both destination bits.
pub const DST_BOTH: u64 = DST_ROOT_SVC | DST_SESSION;

/// Extracts the session id from a context id.
#[must_use]
pub const fn context_session(ctx: u32) -> u32 {
    (ctx >> 27) & 0x1f
}

/// Extracts the object id from a context id.
#[must_use]
pub const fn context_object(ctx: u32) -> u32 {
    (ctx >> 16) & 0x7ff
}

/// Extracts the sequence count from a context id.
#[must_use]
pub const fn context_count(ctx: u32) -> u32 {
    ctx & 0xffff
}

/// Builds a context id.
#[must_use]
pub const fn make_context(session: u32, object: u32, count: u32) -> u32 {
    ((session & 0x1f) << 27) | ((object & 0x7ff) << 16) | (count & 0xffff)
}

/// Delivery legs selected by a host call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Destinations {
    /// Deliver to the session-bound client.
    pub session: bool,
    /// Deliver to the master client.
    pub root: bool,
}

impl Destinations {
    /// Decodes the destination bits of a 64-bit first parameter.
    #[must_use]
    pub const fn from_bits(raw: u64) -> Self {
        Self {
            session: raw & DST_SESSION != 0,
            root: raw & DST_ROOT_SVC != 0,
        }
    }

    /// Returns `true` if no leg is selected.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.session && !self.root
    }

    /// Returns `true` if both legs are selected.
    #[must_use]
    pub const fn is_both(self) -> bool {
        self.session && self.root
    }
}

// ============================================================================
// Requestor credentials
// ============================================================================

/// Requestor information attached to a connection or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requestor(pub u32);

impl Requestor {
    /// No requestor information (old transport).
    pub const LEGACY: Self = Self(u32::MAX);

    /// Bit set when the caller is the constrained user-device node.
    pub const USER_DEVICE: u32 = 0x0000_0800;

    /// A trusted kernel-side requestor.
    pub const KERNEL: Self = Self(0x0000_0001);

    /// Returns `true` if no requestor information is available.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        self.0 == Self::LEGACY.0
    }

    /// Returns `true` if the caller came through the user device.
    #[must_use]
    pub const fn is_user_device(self) -> bool {
        self.0 & Self::USER_DEVICE != 0
    }
}

impl Default for Requestor {
    fn default() -> Self {
        Self::LEGACY
    }
}

// ============================================================================
// Notification payload constants
// ============================================================================

/// Session notify type: error.
pub const SESSION_NOTIFY_ERROR: u32 = 1;

/// Session notify type: session went down.
pub const SESSION_NOTIFY_DOWN: u32 = 150;

/// Process status: error.
pub const PROC_STATUS_ERROR: u32 = 8;

/// Process input status: error.
pub const INPUT_STATUS_ERROR: u32 = 20;

/// File notify types.
pub mod file_notify {
    /// Error.
    pub const ERROR: u32 = 1;
    /// Open completed.
    pub const OPEN: u32 = 10;
    /// Read completed.
    pub const READ: u32 = 30;
    /// Write completed.
    pub const WRITE: u32 = 40;
    /// Seek completed.
    pub const SEEK: u32 = 50;
    /// Tell completed.
    pub const TELL: u32 = 60;
    /// Set-size completed.
    pub const SET_SIZE: u32 = 70;
}

// ============================================================================
// Feature words
// ============================================================================

/// Guest feature word 1: must always be set by a conforming guest.
pub const GUEST_FEATURE1_MUST_BE_ONE: u64 = 1 << 63;

/// Host feature: file notifications carry read/write offsets.
pub const HOST_FEATURE0_NOTIFY_RDWR_OFFSET: u64 = 1 << 0;

/// Host feature: process argv[0] is passed separately.
pub const HOST_FEATURE0_PROCESS_ARGV0: u64 = 1 << 1;

/// Highest session id a prepare or accept may name.
pub const MAX_SESSION_ID: u32 = 0xfff0;

/// Session id wildcard for cancel-prepared.
pub const ALL_SESSIONS: u32 = u32::MAX;

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn guest_fn_round_trips_known_values() {
        for raw in [1, 2, 9, 12, 19, 20, 100, 240] {
            let f = GuestFn::from_raw(raw).unwrap();
            assert_eq!(f.as_raw(), raw);
        }
        assert_eq!(GuestFn::from_raw(0), None);
        assert_eq!(GuestFn::from_raw(21), None);
    }

    #[test]
    fn forward_group_membership() {
        assert!(GuestFn::Reply.is_forwarded());
        assert!(GuestFn::FileNotify.is_forwarded());
        assert!(!GuestFn::Get.is_forwarded());
        assert!(!GuestFn::SessionClose.is_forwarded());
    }

    #[test]
    fn destinations_decode() {
        assert!(Destinations::from_bits(0).is_empty());
        assert!(Destinations::from_bits(DST_BOTH).is_both());
        let root = Destinations::from_bits(DST_ROOT_SVC | 0x1234);
        assert!(root.root && !root.session);
    }

    #[test]
    fn requestor_classes() {
        assert!(Requestor::LEGACY.is_legacy());
        assert!(Requestor::LEGACY.is_user_device());
        assert!(!Requestor::KERNEL.is_user_device());
        assert!(Requestor(Requestor::USER_DEVICE | 1).is_user_device());
    }

    proptest! {
        #[test]
        fn context_fields_round_trip(session in 0u32..32, object in 0u32..2048, count in 0u32..65536) {
            let ctx = make_context(session, object, count);
            prop_assert_eq!(context_session(ctx), session);
            prop_assert_eq!(context_object(ctx), object);
            prop_assert_eq!(context_count(ctx), count);
        }
    }
}
