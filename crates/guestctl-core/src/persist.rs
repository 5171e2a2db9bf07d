//! Saved-state blobs.
//!
//! Only the root service survives a save/restore cycle: the router records
//! whether it was in legacy mode and whether the client being saved was the
//! master. Session bindings and prepared sessions are not saved; the host
//! objects they refer to do not survive either.

use serde::{Deserialize, Serialize};

use crate::error::GuestCtlError;

/// Layout version of [`SavedClientState`].
pub const SAVED_STATE_VERSION: u32 = 1;

/// Per-client saved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedClientState {
    /// Layout version; must be [`SAVED_STATE_VERSION`].
    pub version: u32,
    /// Router legacy mode at save time.
    pub legacy_mode: bool,
    /// Whether this client was the master.
    pub is_master: bool,
}

impl SavedClientState {
    /// Creates a current-version record.
    #[must_use]
    pub const fn new(legacy_mode: bool, is_master: bool) -> Self {
        Self {
            version: SAVED_STATE_VERSION,
            legacy_mode,
            is_master,
        }
    }

    /// Encodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        serde_json::to_vec(self).map_err(PersistError::Encode)
    }

    /// Decodes and version-checks a record.
    ///
    /// # Errors
    ///
    /// - [`PersistError::Decode`] if the blob is malformed
    /// - [`PersistError::FormatChanged`] if the version differs
    pub fn decode(blob: &[u8]) -> Result<Self, PersistError> {
        let state: Self = serde_json::from_slice(blob).map_err(PersistError::Decode)?;
        if state.version != SAVED_STATE_VERSION {
            return Err(PersistError::FormatChanged {
                version: state.version,
            });
        }
        Ok(state)
    }
}

/// Saved-state errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Serialization failed.
    #[error("failed to encode saved state: {0}")]
    Encode(#[source] serde_json::Error),

    /// The blob could not be parsed.
    #[error("failed to decode saved state: {0}")]
    Decode(#[source] serde_json::Error),

    /// The blob has an unsupported layout version.
    #[error("saved state format changed: version {version}, expected {SAVED_STATE_VERSION}")]
    FormatChanged {
        /// Version found in the blob.
        version: u32,
    },

    /// The client is not connected.
    #[error("invalid client id {client_id}")]
    UnknownClient {
        /// The unknown id.
        client_id: u32,
    },
}

impl From<&PersistError> for GuestCtlError {
    fn from(err: &PersistError) -> Self {
        match err {
            PersistError::FormatChanged { version } => Self::SavedStateFormatChanged {
                version: *version,
            },
            PersistError::UnknownClient { client_id } => Self::InvalidClientId {
                client_id: *client_id,
            },
            PersistError::Encode(_) | PersistError::Decode(_) => Self::InvalidParameter {
                reason: "malformed saved state",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let state = SavedClientState::new(false, true);
        let blob = state.encode().unwrap();
        assert_eq!(SavedClientState::decode(&blob).unwrap(), state);
    }

    #[test]
    fn version_mismatch_is_reported() {
        let blob = br#"{"version":2,"legacy_mode":true,"is_master":false}"#;
        let err = SavedClientState::decode(blob).unwrap_err();
        assert!(matches!(err, PersistError::FormatChanged { version: 2 }));
        assert_eq!(
            GuestCtlError::from(&err),
            GuestCtlError::SavedStateFormatChanged { version: 2 }
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            SavedClientState::decode(b"not json"),
            Err(PersistError::Decode(_))
        ));
    }
}
