//! # guestctl-core
//!
//! Message broker between a virtual machine host and the guest-side agents
//! that execute its commands.
//!
//! The host queues commands (run a process, open a file, create a session)
//! for the guest; guest agents connect as clients, retrieve the commands
//! addressed to them, and send status notifications back. The broker sits in
//! the middle and decides which client gets which message:
//!
//! - one **master** client (the root service) receives root-addressed
//!   messages and stages new sessions
//! - **session** clients prove ownership of a staged session with a key and
//!   then receive messages whose context id names that session
//! - **legacy** guests that predate sessions are served through an old
//!   single-call wait protocol and a one-shot filter
//!
//! ## Example
//!
//! ```rust
//! use guestctl_core::prelude::*;
//!
//! let router = Router::new(RouterConfig::default());
//! router.connect(1, Requestor::KERNEL).unwrap();
//!
//! let (call, _rx) = GuestCall::channel(GuestFn::MakeMeMaster.as_raw(), vec![]);
//! router.call(1, call);
//! assert_eq!(router.master_client_id(), Some(1));
//! assert!(!router.is_legacy_mode());
//!
//! // Root-addressed command, queued for the master.
//! let status = router
//!     .host_call(
//!         HostMsg::SessionCreate.as_raw(),
//!         &[Param::U64(DST_ROOT_SVC | 1), Param::U32(0)],
//!     )
//!     .unwrap();
//! assert_eq!(status, CallStatus::Success);
//! ```
//!
//! ## Concurrency
//!
//! [`Router`] is `Send + Sync`. All routing state sits behind one lock;
//! guest calls that must block are parked inside the router and completed
//! through their [`GuestCall`] handle when a message arrives.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod completion;
pub mod config;
pub mod error;
pub mod extension;
pub mod message;
pub mod param;
pub mod persist;
pub mod protocol;
pub mod router;
pub mod session;
pub mod wait;

// Re-export main types at crate root for convenience
pub use completion::{CallReply, CallResult, CallStatus, Delivery, GuestCall};
pub use config::{ConfigError, RouterConfig};
pub use error::{ErrorClass, GuestCtlError};
pub use extension::{HostCallback, HostNotification};
pub use message::HostMessage;
pub use param::{Param, ParamType};
pub use persist::{PersistError, SavedClientState};
pub use protocol::{GuestFn, HostMsg, Requestor};
pub use router::{Router, RouterSnapshot};
pub use wait::Disposition;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::completion::{CallReply, CallResult, CallStatus, Delivery, GuestCall};
    pub use crate::config::RouterConfig;
    pub use crate::error::GuestCtlError;
    pub use crate::extension::HostCallback;
    pub use crate::param::Param;
    pub use crate::protocol::{
        DST_BOTH, DST_ROOT_SVC, DST_SESSION, GuestFn, HostMsg, Requestor, make_context,
    };
    pub use crate::router::Router;
    pub use crate::wait::Disposition;
}
