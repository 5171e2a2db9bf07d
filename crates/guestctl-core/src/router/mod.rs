//! The service router.
//!
//! [`Router`] is the broker's top-level object. It owns every connected
//! [`ClientState`], the session-id map, the master election state and the
//! prepared-session registry, and it is the only entry point for both call
//! sources:
//!
//! - guest calls via [`Router::call`], completed through their
//!   [`GuestCall`] handle (possibly later, if the call parks)
//! - host calls via [`Router::host_call`], which return synchronously
//!
//! # Locking
//!
//! All state sits behind one coarse mutex. A handler validates, completes
//! the guest call and commits its state change without releasing it, so a
//! wakeup can never race a fresh blocking call from the same client.
//! Notifications for the host are collected while the lock is held and
//! handed to the [`HostCallback`] after it is released; the callback may
//! therefore call back into the router.
//!
//! # Submodules
//!
//! - `dispatch`: guest function handlers
//! - `host`: host message routing and disconnect cleanup

mod dispatch;
mod host;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ClientSnapshot, ClientState};
use crate::completion::{CallResult, CallStatus, GuestCall};
use crate::config::{ConfigError, RouterConfig};
use crate::error::GuestCtlError;
use crate::extension::{HostCallback, HostNotification};
use crate::param::Param;
use crate::persist::{PersistError, SavedClientState};
use crate::protocol::Requestor;
use crate::session::SessionRegistry;
use crate::wait::Disposition;

/// Router state guarded by the router lock.
struct RouterState {
    clients: BTreeMap<u32, ClientState>,
    /// Session id to owning client id.
    sessions: BTreeMap<u32, u32>,
    master: Option<u32>,
    legacy_mode: bool,
    prepared: SessionRegistry,
    vm_session_id: u64,
    guest_features: [u64; 2],
}

impl RouterState {
    const fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            sessions: BTreeMap::new(),
            master: None,
            legacy_mode: true,
            prepared: SessionRegistry::new(),
            vm_session_id: 0,
            guest_features: [0, 0],
        }
    }
}

/// What a guest handler left for the router to do after unlocking.
enum Step {
    /// Completed or parked under the lock.
    Done(Disposition),
    /// Validated; relay to the host callback and complete with its result.
    Forward(GuestCall),
}

/// Serializable view of the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterSnapshot {
    /// Legacy mode flag.
    pub legacy_mode: bool,
    /// Master client id.
    pub master: Option<u32>,
    /// Connected clients in id order.
    pub clients: Vec<ClientSnapshot>,
    /// Session id to client id.
    pub sessions: BTreeMap<u32, u32>,
    /// Prepared session ids in insertion order.
    pub prepared: Vec<u32>,
}

/// The guest control message broker.
pub struct Router {
    config: RouterConfig,
    state: Mutex<RouterState>,
    host: RwLock<Option<Arc<dyn HostCallback>>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl Router {
    /// Creates a router with no clients, in legacy mode.
    ///
    /// The configuration is taken as is; callers holding an unchecked
    /// configuration should use [`Router::try_new`].
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RouterState::new()),
            host: RwLock::new(None),
        }
    }

    /// Creates a router after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the configuration is out of
    /// bounds.
    pub fn try_new(config: RouterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Host extension
    // ========================================================================

    /// Registers (or replaces) the host callback.
    pub fn register_host_callback(&self, callback: Arc<dyn HostCallback>) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
        info!("host callback registered");
    }

    /// Removes the host callback.
    pub fn unregister_host_callback(&self) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("host callback removed");
    }

    fn notify_host(&self, function: u32, params: &[Param]) -> Result<(), GuestCtlError> {
        let callback = self
            .host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback.notify(function, params),
            None => Err(GuestCtlError::NotSupported),
        }
    }

    fn flush(&self, outbox: Vec<HostNotification>) {
        for notification in outbox {
            if let Err(err) = self.notify_host(notification.function, &notification.params) {
                if err.is_transient() {
                    debug!(function = notification.function, error = %err, "host notification deferred");
                } else {
                    warn!(
                        function = notification.function,
                        error = %err,
                        class = %err.error_class(),
                        "host notification not delivered"
                    );
                }
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Registers a newly connected guest client.
    ///
    /// In legacy mode with no master, the first client that did not come
    /// through the constrained user device becomes master.
    ///
    /// # Errors
    ///
    /// Returns [`GuestCtlError::Duplicate`] if the id is already connected.
    pub fn connect(&self, client_id: u32, requestor: Requestor) -> Result<(), GuestCtlError> {
        let mut state = self.lock();
        if state.clients.contains_key(&client_id) {
            return Err(GuestCtlError::Duplicate {
                what: "client",
                id: client_id,
            });
        }

        let mut client = ClientState::new(client_id, requestor);
        if state.legacy_mode
            && state.master.is_none()
            && (requestor.is_legacy() || !requestor.is_user_device())
        {
            client.set_master(true);
            state.master = Some(client_id);
            info!(client_id, "client elected master on connect");
        }
        state.clients.insert(client_id, client);
        debug!(client_id, requestor = requestor.0, "client connected");
        Ok(())
    }

    /// Tears down a guest client.
    ///
    /// Queued messages are dropped and the host is told about each one. A
    /// departing master also takes the prepared sessions with it, and the
    /// host is told every bound session is down.
    ///
    /// # Errors
    ///
    /// Returns [`GuestCtlError::InvalidClientId`] if the id is unknown.
    pub fn disconnect(&self, client_id: u32) -> Result<(), GuestCtlError> {
        let mut outbox = Vec::new();
        let result = self.lock().disconnect(client_id, &mut outbox);
        self.flush(outbox);
        result
    }

    // ========================================================================
    // Call entry points
    // ========================================================================

    /// Dispatches a guest call.
    ///
    /// The call is always completed exactly once, either before this returns
    /// ([`Disposition::Completed`]) or later by a wakeup, cancel, or never if
    /// the client disconnects first ([`Disposition::Parked`]).
    pub fn call(&self, client_id: u32, call: GuestCall) -> Disposition {
        let mut outbox = Vec::new();
        let step = self
            .lock()
            .dispatch(&self.config, client_id, call, &mut outbox);
        self.flush(outbox);

        match step {
            Step::Done(disposition) => disposition,
            Step::Forward(call) => {
                let result = self
                    .notify_host(call.function(), &call.params)
                    .map(|()| CallStatus::Success);
                match &result {
                    Err(err) if err.is_transient() => {
                        debug!(client_id, function = call.function(), error = %err, "host deferred forward");
                    },
                    Err(err) => {
                        warn!(
                            client_id,
                            function = call.function(),
                            error = %err,
                            class = %err.error_class(),
                            "host rejected forward"
                        );
                    },
                    Ok(_) => {},
                }
                call.complete(result);
                Disposition::Completed
            },
        }
    }

    /// Queues a host command for the guest.
    ///
    /// # Errors
    ///
    /// - [`GuestCtlError::InvalidFunction`] for the cancel sentinel
    /// - [`GuestCtlError::NotFound`] if no client is connected or no leg
    ///   could be delivered
    /// - errors from [`HostMessage::create`](crate::message::HostMessage::create)
    pub fn host_call(&self, msg_type: u32, params: &[Param]) -> CallResult {
        let mut outbox = Vec::new();
        let result = self
            .lock()
            .host_process_message(&self.config, msg_type, params, &mut outbox);
        self.flush(outbox);
        result
    }

    // ========================================================================
    // Saved state
    // ========================================================================

    /// Produces the saved-state blob for one client.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnknownClient`] or an encoding error.
    pub fn save_client_state(&self, client_id: u32) -> Result<Vec<u8>, PersistError> {
        let state = self.lock();
        if !state.clients.contains_key(&client_id) {
            return Err(PersistError::UnknownClient { client_id });
        }
        SavedClientState::new(state.legacy_mode, state.master == Some(client_id)).encode()
    }

    /// Applies a saved-state blob to a reconnected client.
    ///
    /// `None` stands for state saved before per-client records existed; the
    /// client is only marked restored.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnknownClient`], a decode error, or
    /// [`PersistError::FormatChanged`].
    pub fn load_client_state(&self, client_id: u32, blob: Option<&[u8]>) -> Result<(), PersistError> {
        let saved = blob.map(SavedClientState::decode).transpose()?;

        let mut state = self.lock();
        let state = &mut *state;
        if !state.clients.contains_key(&client_id) {
            return Err(PersistError::UnknownClient { client_id });
        }

        if let Some(saved) = saved {
            state.legacy_mode = saved.legacy_mode;
            if saved.is_master {
                if let Some(previous) = state.master.filter(|&id| id != client_id) {
                    if let Some(previous) = state.clients.get_mut(&previous) {
                        previous.set_master(false);
                    }
                    info!(client_id, previous, "restored master replaces elected master");
                }
                state.master = Some(client_id);
            } else if state.master == Some(client_id) {
                state.master = None;
            }
            if let Some(client) = state.clients.get_mut(&client_id) {
                client.set_master(saved.is_master);
            }
        }
        if let Some(client) = state.clients.get_mut(&client_id) {
            client.mark_restored();
        }
        info!(client_id, legacy_mode = state.legacy_mode, "client state restored");
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Sets the id guests use to detect a VM restore on peek.
    pub fn set_vm_session_id(&self, id: u64) {
        self.lock().vm_session_id = id;
    }

    /// Returns `true` while no client has claimed the master role.
    #[must_use]
    pub fn is_legacy_mode(&self) -> bool {
        self.lock().legacy_mode
    }

    /// Current master client id.
    #[must_use]
    pub fn master_client_id(&self) -> Option<u32> {
        self.lock().master
    }

    /// Feature words last reported by the master.
    #[must_use]
    pub fn guest_features(&self) -> [u64; 2] {
        self.lock().guest_features
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Takes a consistent snapshot of the router state.
    #[must_use]
    pub fn snapshot(&self) -> RouterSnapshot {
        let state = self.lock();
        RouterSnapshot {
            legacy_mode: state.legacy_mode,
            master: state.master,
            clients: state.clients.values().map(ClientSnapshot::from).collect(),
            sessions: state.sessions.clone(),
            prepared: state.prepared.ids(),
        }
    }
}
