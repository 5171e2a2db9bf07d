//! Host message routing and client teardown.

use tracing::{debug, info, warn};

use super::RouterState;
use crate::completion::{CallResult, CallStatus};
use crate::config::RouterConfig;
use crate::error::GuestCtlError;
use crate::extension::HostNotification;
use crate::message::HostMessage;
use crate::param::Param;
use crate::protocol::{context_session, make_context, GuestFn, HostMsg, SESSION_NOTIFY_DOWN};

impl RouterState {
    /// Validates and queues one host call.
    pub(super) fn host_process_message(
        &mut self,
        config: &RouterConfig,
        msg_type: u32,
        params: &[Param],
        outbox: &mut Vec<HostNotification>,
    ) -> CallResult {
        if msg_type == HostMsg::CancelPendingWaits.as_raw() {
            return Err(GuestCtlError::InvalidFunction { function: msg_type });
        }
        if self.clients.is_empty() {
            debug!(msg_type, "host message with no guest connected");
            return Err(GuestCtlError::NotFound);
        }
        let msg = HostMessage::create(msg_type, params)?;
        self.route_locked(config, msg, outbox)
    }

    /// Queues `msg` on the session leg, the root leg, or both.
    ///
    /// A missing session client is only a warning when the root leg can
    /// still take the message. The root leg is skipped once the session leg
    /// has failed.
    pub(super) fn route_locked(
        &mut self,
        config: &RouterConfig,
        msg: HostMessage,
        outbox: &mut Vec<HostNotification>,
    ) -> CallResult {
        let dest = msg.destinations();
        let (session_msg, root_msg) = if dest.is_both() {
            let copy = msg.try_duplicate()?;
            (Some(msg), Some(copy))
        } else if dest.session {
            (Some(msg), None)
        } else {
            (None, Some(msg))
        };

        let mut result = Ok(CallStatus::Success);
        if let Some(msg) = session_msg {
            let session_id = context_session(msg.context_id());
            match self.sessions.get(&session_id).copied() {
                Some(owner) => self.deliver(config, owner, msg, outbox),
                None if root_msg.is_some() => result = Ok(CallStatus::NotFoundWarning),
                None => {
                    debug!(session_id, msg_type = msg.msg_type(), "no client for session");
                    result = Err(GuestCtlError::NotFound);
                },
            }
        }

        if result.is_ok() {
            if let Some(msg) = root_msg {
                match self.master {
                    Some(master) => self.deliver(config, master, msg, outbox),
                    None => {
                        debug!(msg_type = msg.msg_type(), "no master for root message");
                        result = Err(GuestCtlError::NotFound);
                    },
                }
            }
        }
        result
    }

    fn deliver(
        &mut self,
        config: &RouterConfig,
        client_id: u32,
        msg: HostMessage,
        outbox: &mut Vec<HostNotification>,
    ) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            warn!(client_id, msg_type = msg.msg_type(), "routing table names a missing client");
            return;
        };
        debug!(
            client_id,
            msg_type = msg.msg_type(),
            context_id = msg.context_id(),
            "queued host message"
        );
        client.enqueue(msg);
        client.wakeup(config, outbox);
    }

    /// Removes a client and releases everything it held.
    pub(super) fn disconnect(
        &mut self,
        client_id: u32,
        outbox: &mut Vec<HostNotification>,
    ) -> Result<(), GuestCtlError> {
        let Some(mut client) = self.clients.remove(&client_id) else {
            return Err(GuestCtlError::InvalidClientId { client_id });
        };

        let dropped = client.drain_queue();
        outbox.extend(dropped.iter().map(|msg| {
            HostNotification::new(
                GuestFn::Disconnected.as_raw(),
                vec![Param::U32(msg.context_id())],
            )
        }));

        if self.master == Some(client_id) {
            self.master = None;
            let prepared = self.prepared.len();
            self.prepared.clear();
            outbox.extend(self.sessions.keys().map(|&session_id| {
                HostNotification::new(
                    GuestFn::SessionNotify.as_raw(),
                    vec![
                        Param::U32(make_context(session_id, 0, 0)),
                        Param::U32(SESSION_NOTIFY_DOWN),
                        Param::U32(0),
                    ],
                )
            }));
            info!(
                client_id,
                prepared,
                sessions = self.sessions.len(),
                "master disconnected"
            );
        }

        if let Some(session_id) = client.session_id() {
            self.sessions.remove(&session_id);
        }
        client.abandon_wait();

        if self.clients.is_empty() && !self.legacy_mode {
            self.legacy_mode = true;
            info!("last client gone, back to legacy mode");
        }
        debug!(client_id, dropped = dropped.len(), "client disconnected");
        Ok(())
    }
}
