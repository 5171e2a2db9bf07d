//! The host-side extension that receives guest notifications.
//!
//! The broker relays guest status events, synthesised skip replies and
//! disconnect notices to a single registered callback. When none is
//! registered the relay fails with [`GuestCtlError::NotSupported`].

use std::fmt;

use crate::error::GuestCtlError;
use crate::param::{Param, ParamVec};

/// Receiver for guest-originated notifications.
pub trait HostCallback: Send + Sync {
    /// Handles one notification. `function` is a guest function number.
    ///
    /// # Errors
    ///
    /// Any error is handed back to the guest call that triggered the
    /// notification, when there is one.
    fn notify(&self, function: u32, params: &[Param]) -> Result<(), GuestCtlError>;
}

impl<F> HostCallback for F
where
    F: Fn(u32, &[Param]) -> Result<(), GuestCtlError> + Send + Sync,
{
    fn notify(&self, function: u32, params: &[Param]) -> Result<(), GuestCtlError> {
        self(function, params)
    }
}

/// A notification waiting to be handed to the host callback.
///
/// Built while the router lock is held and dispatched after it is released.
#[derive(Clone, PartialEq, Eq)]
pub struct HostNotification {
    /// Guest function number reported to the host.
    pub function: u32,
    /// Payload.
    pub params: ParamVec,
}

impl HostNotification {
    /// Creates a notification.
    #[must_use]
    pub const fn new(function: u32, params: ParamVec) -> Self {
        Self { function, params }
    }
}

impl fmt::Debug for HostNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostNotification")
            .field("function", &self.function)
            .field("params", &self.params.len())
            .finish()
    }
}
