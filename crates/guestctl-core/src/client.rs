//! Per-client state.
//!
//! A [`ClientState`] exists from guest connect to guest disconnect. It owns
//! the client's FIFO of [`HostMessage`]s, its session binding and role
//! flags, and its [`Retrieval`] state. Only the router mutates it, under the
//! router lock.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::completion::GuestCall;
use crate::config::RouterConfig;
use crate::error::GuestCtlError;
use crate::extension::HostNotification;
use crate::message::HostMessage;
use crate::protocol::Requestor;
use crate::wait::{Disposition, Retrieval, WaitPhase};

/// Result of [`ClientState::wakeup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// No parked call, or nothing queued.
    NoChange,
    /// A parked call was completed.
    Woken,
}

/// State of one connected guest client.
pub struct ClientState {
    client_id: u32,
    requestor: Requestor,
    session_id: Option<u32>,
    is_master: bool,
    is_restored: bool,
    filter_applied: bool,
    queue: VecDeque<HostMessage>,
    retrieval: Retrieval,
}

impl ClientState {
    /// Creates the state for a freshly connected client.
    #[must_use]
    pub const fn new(client_id: u32, requestor: Requestor) -> Self {
        Self {
            client_id,
            requestor,
            session_id: None,
            is_master: false,
            is_restored: false,
            filter_applied: false,
            queue: VecDeque::new(),
            retrieval: Retrieval::new(),
        }
    }

    /// Client id assigned by the transport.
    #[must_use]
    pub const fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Requestor credentials given at connect time.
    #[must_use]
    pub const fn requestor(&self) -> Requestor {
        self.requestor
    }

    /// Bound session id, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Returns `true` if this client holds the master role.
    #[must_use]
    pub const fn is_master(&self) -> bool {
        self.is_master
    }

    /// Sets or clears the master flag. The router keeps the master id.
    pub fn set_master(&mut self, is_master: bool) {
        self.is_master = is_master;
    }

    /// Returns `true` if the client was restored from saved state.
    #[must_use]
    pub const fn is_restored(&self) -> bool {
        self.is_restored
    }

    /// Marks the client as restored from saved state.
    pub fn mark_restored(&mut self) {
        self.is_restored = true;
    }

    /// Binds the client to a session. A client is bound at most once.
    ///
    /// # Errors
    ///
    /// Returns [`GuestCtlError::WrongOrder`] if already bound.
    pub fn bind_session(&mut self, session_id: u32) -> Result<(), GuestCtlError> {
        if self.session_id.is_some() {
            return Err(GuestCtlError::wrong_order("session already bound"));
        }
        self.session_id = Some(session_id);
        debug!(client_id = self.client_id, session_id, "client bound to session");
        Ok(())
    }

    /// Returns `true` once the old filter call has been accepted.
    #[must_use]
    pub const fn filter_applied(&self) -> bool {
        self.filter_applied
    }

    /// Records that the old filter call was accepted.
    pub fn mark_filter_applied(&mut self) {
        self.filter_applied = true;
    }

    /// Appends a message at the tail.
    pub fn enqueue(&mut self, msg: HostMessage) {
        self.queue.push_back(msg);
    }

    /// Head of the queue.
    #[must_use]
    pub fn head(&self) -> Option<&HostMessage> {
        self.queue.front()
    }

    /// Mutable head of the queue.
    pub fn head_mut(&mut self) -> Option<&mut HostMessage> {
        self.queue.front_mut()
    }

    /// Removes and returns the head of the queue.
    pub fn pop_head(&mut self) -> Option<HostMessage> {
        self.queue.pop_front()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Removes every queued message, oldest first.
    pub fn drain_queue(&mut self) -> Vec<HostMessage> {
        self.queue.drain(..).collect()
    }

    /// Retrieval phase.
    #[must_use]
    pub const fn wait_phase(&self) -> WaitPhase {
        self.retrieval.phase()
    }

    /// Forgets old-protocol attempt accounting.
    pub fn reset_legacy(&mut self) {
        self.retrieval.reset_legacy();
    }

    /// Drops a parked call without completing it.
    pub fn abandon_wait(&mut self) {
        self.retrieval.abandon();
    }

    /// Handles a peek whose slots are validated and zeroed.
    pub fn peek(&mut self, call: GuestCall, wait: bool) -> Disposition {
        self.retrieval.peek(&self.queue, call, wait)
    }

    /// Handles an old-protocol wait.
    pub fn wait_legacy(
        &mut self,
        call: GuestCall,
        config: &RouterConfig,
        outbox: &mut Vec<HostNotification>,
    ) -> Disposition {
        self.retrieval
            .wait_legacy(&mut self.queue, call, config, outbox)
    }

    /// Completes a parked call if the queue has a head.
    pub fn wakeup(&mut self, config: &RouterConfig, outbox: &mut Vec<HostNotification>) -> Wakeup {
        if self.retrieval.wakeup(&mut self.queue, config, outbox) {
            debug!(client_id = self.client_id, "woke parked call");
            Wakeup::Woken
        } else {
            Wakeup::NoChange
        }
    }

    /// Cancels a parked call, or arms a cancel for the next one.
    ///
    /// Returns `true` if a parked call was completed.
    pub fn cancel_waiting(&mut self) -> bool {
        self.retrieval.cancel()
    }
}

/// Serializable view of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSnapshot {
    /// Client id.
    pub client_id: u32,
    /// Bound session.
    pub session_id: Option<u32>,
    /// Master flag.
    pub is_master: bool,
    /// Restored flag.
    pub is_restored: bool,
    /// Number of queued messages.
    pub queued: usize,
    /// Whether a call is parked.
    pub waiting: bool,
}

impl From<&ClientState> for ClientSnapshot {
    fn from(client: &ClientState) -> Self {
        Self {
            client_id: client.client_id,
            session_id: client.session_id,
            is_master: client.is_master,
            is_restored: client.is_restored,
            queued: client.queue.len(),
            waiting: client.wait_phase() != WaitPhase::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Param;
    use crate::protocol::DST_SESSION;

    fn msg(ctx: u64) -> HostMessage {
        HostMessage::create(100, &[Param::U64(ctx | DST_SESSION)]).unwrap()
    }

    #[test]
    fn session_binds_once() {
        let mut client = ClientState::new(1, Requestor::KERNEL);
        client.bind_session(4).unwrap();
        assert!(matches!(
            client.bind_session(5),
            Err(GuestCtlError::WrongOrder { .. })
        ));
        assert_eq!(client.session_id(), Some(4));
    }

    #[test]
    fn queue_is_fifo() {
        let mut client = ClientState::new(1, Requestor::KERNEL);
        for ctx in 1..=3 {
            client.enqueue(msg(ctx));
        }
        let order: Vec<u32> = client.drain_queue().iter().map(HostMessage::context_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(client.queue_len(), 0);
    }

    #[test]
    fn wakeup_without_waiter_is_no_change() {
        let mut client = ClientState::new(1, Requestor::KERNEL);
        client.enqueue(msg(1));
        let mut outbox = Vec::new();
        assert_eq!(
            client.wakeup(&RouterConfig::default(), &mut outbox),
            Wakeup::NoChange
        );
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut client = ClientState::new(3, Requestor::KERNEL);
        client.set_master(true);
        client.enqueue(msg(1));
        let snap = ClientSnapshot::from(&client);
        assert_eq!(snap.client_id, 3);
        assert!(snap.is_master);
        assert_eq!(snap.queued, 1);
        assert!(!snap.waiting);
    }
}
