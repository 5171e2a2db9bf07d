//! Per-client message retrieval state machine.
//!
//! A client is in one of three phases:
//!
//! | phase               | meaning                                   |
//! |---------------------|-------------------------------------------|
//! | `Idle`              | no call parked                            |
//! | `BlockedPeek`       | a peek-wait is parked until a message     |
//! | `BlockedLegacyWait` | an old-protocol wait is parked            |
//!
//! Transitions are looked up in [`transition`], a pure function over
//! `(phase, event)` that can be tested on its own. The [`Retrieval`] methods
//! perform the looked-up action against the client's queue.
//!
//! # Old wait protocol
//!
//! Old guests only know a single blocking wait call. For a freshly queued
//! message the first answer is always a peek (type and count, status
//! [`GuestCtlError::TooMuchData`]), even if the message would fit. Later
//! waits try full delivery and fall back to another peek on failure. Each
//! failure counts as an attempt; after the configured number of attempts the
//! message is dropped and the host is told, so it never waits forever.
//! Old guests peek before every get, so one logical attempt costs two
//! calls, which is why the size retry limit is even.
//!
//! # Invariants
//!
//! - At most one call is parked per client. A second blocking call is
//!   rejected, never queued and never swapped in.
//! - A cancel with nothing parked is remembered and consumed by the next
//!   blocking call.

use std::collections::VecDeque;

use tracing::debug;

use crate::completion::{CallStatus, Delivery, GuestCall};
use crate::config::RouterConfig;
use crate::error::GuestCtlError;
use crate::extension::HostNotification;
use crate::message::HostMessage;
use crate::param::Param;
use crate::protocol::HostMsg;

// ============================================================================
// Transition table
// ============================================================================

/// The phase of a client's retrieval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// Nothing parked.
    Idle,
    /// A peek-wait call is parked.
    BlockedPeek,
    /// An old-protocol wait call is parked.
    BlockedLegacyWait,
}

/// Events that drive the retrieval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// A peek-wait found the queue empty.
    BlockPeek,
    /// An old wait found the queue empty.
    BlockLegacy,
    /// A message was queued for the client.
    Wakeup,
    /// The guest asked to cancel waiting.
    Cancel,
}

/// What to do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAction {
    /// Park the incoming call.
    Park,
    /// Reject the incoming peek; another call is parked.
    RejectBusy,
    /// Reject the incoming wait; another call is parked.
    RejectWrongOrder,
    /// Complete the parked peek with the head message shape.
    DeliverPeek,
    /// Run the old wait protocol on the parked call.
    RunLegacy,
    /// Complete the parked peek with the cancel sentinel.
    CancelPeek,
    /// Complete the parked old wait with the cancel sentinels.
    CancelLegacy,
    /// Remember the cancel for the next blocking call.
    FlagCancel,
    /// Nothing to do.
    Ignore,
}

/// The result of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Action to perform.
    pub action: WaitAction,
    /// Phase after the action.
    pub next: WaitPhase,
}

const fn t(action: WaitAction, next: WaitPhase) -> Transition {
    Transition { action, next }
}

/// Looks up the transition for `event` in `phase`.
#[must_use]
pub const fn transition(phase: WaitPhase, event: WaitEvent) -> Transition {
    use WaitAction as A;
    use WaitEvent as E;
    use WaitPhase as P;

    match (phase, event) {
        (P::Idle, E::BlockPeek) => t(A::Park, P::BlockedPeek),
        (P::Idle, E::BlockLegacy) => t(A::Park, P::BlockedLegacyWait),
        (P::Idle, E::Wakeup) => t(A::Ignore, P::Idle),
        (P::Idle, E::Cancel) => t(A::FlagCancel, P::Idle),

        (P::BlockedPeek, E::BlockPeek) => t(A::RejectBusy, P::BlockedPeek),
        (P::BlockedPeek, E::BlockLegacy) => t(A::RejectWrongOrder, P::BlockedPeek),
        (P::BlockedPeek, E::Wakeup) => t(A::DeliverPeek, P::Idle),
        (P::BlockedPeek, E::Cancel) => t(A::CancelPeek, P::Idle),

        (P::BlockedLegacyWait, E::BlockPeek) => t(A::RejectBusy, P::BlockedLegacyWait),
        (P::BlockedLegacyWait, E::BlockLegacy) => {
            t(A::RejectWrongOrder, P::BlockedLegacyWait)
        },
        (P::BlockedLegacyWait, E::Wakeup) => t(A::RunLegacy, P::Idle),
        (P::BlockedLegacyWait, E::Cancel) => t(A::CancelLegacy, P::Idle),
    }
}

// ============================================================================
// Retrieval state
// ============================================================================

/// Whether a call finished or is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The call has been completed.
    Completed,
    /// The call is parked and will be completed later.
    Parked,
}

enum WaitState {
    Idle,
    BlockedPeek(GuestCall),
    BlockedLegacyWait(GuestCall),
}

/// Attempt accounting for the old wait protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LegacyCounters {
    /// Wait calls spent on the current head message.
    tries: u32,
    /// Peek answers given since the last full delivery.
    peeks: u32,
}

/// Retrieval state of one client.
pub struct Retrieval {
    state: WaitState,
    pending_cancel: bool,
    legacy: LegacyCounters,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self::new()
    }
}

impl Retrieval {
    /// Creates an idle state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: WaitState::Idle,
            pending_cancel: false,
            legacy: LegacyCounters { tries: 0, peeks: 0 },
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> WaitPhase {
        match self.state {
            WaitState::Idle => WaitPhase::Idle,
            WaitState::BlockedPeek(_) => WaitPhase::BlockedPeek,
            WaitState::BlockedLegacyWait(_) => WaitPhase::BlockedLegacyWait,
        }
    }

    /// Returns `true` if a cancel is remembered for the next wait.
    #[must_use]
    pub const fn has_pending_cancel(&self) -> bool {
        self.pending_cancel
    }

    /// Forgets old-protocol attempt accounting.
    pub fn reset_legacy(&mut self) {
        self.legacy = LegacyCounters::default();
    }

    /// Drops any parked call without completing it.
    pub fn abandon(&mut self) {
        self.state = WaitState::Idle;
    }

    /// Handles a peek. Slots must already be validated and zeroed.
    pub fn peek(
        &mut self,
        queue: &VecDeque<HostMessage>,
        mut call: GuestCall,
        wait: bool,
    ) -> Disposition {
        if let Some(head) = queue.front() {
            head.set_peek_return(&mut call.params);
            debug!(msg_type = head.msg_type(), "peek returned queued message");
            call.complete(Ok(CallStatus::Success));
            return Disposition::Completed;
        }
        if !wait {
            call.complete(Err(GuestCtlError::TryAgain));
            return Disposition::Completed;
        }
        if self.pending_cancel {
            self.pending_cancel = false;
            set_cancel_sentinel(&mut call.params);
            call.complete(Ok(CallStatus::TryAgain));
            return Disposition::Completed;
        }
        self.block(WaitEvent::BlockPeek, call)
    }

    /// Handles an old-protocol wait.
    pub fn wait_legacy(
        &mut self,
        queue: &mut VecDeque<HostMessage>,
        mut call: GuestCall,
        config: &RouterConfig,
        outbox: &mut Vec<HostNotification>,
    ) -> Disposition {
        if !queue.is_empty() {
            self.run_legacy(queue, call, false, config, outbox);
            return Disposition::Completed;
        }
        if self.pending_cancel {
            self.pending_cancel = false;
            let result = legacy_cancel_result(&mut call.params);
            call.complete(result);
            return Disposition::Completed;
        }
        self.block(WaitEvent::BlockLegacy, call)
    }

    fn block(&mut self, event: WaitEvent, call: GuestCall) -> Disposition {
        match transition(self.phase(), event).action {
            WaitAction::Park => {
                self.state = match event {
                    WaitEvent::BlockLegacy => WaitState::BlockedLegacyWait(call),
                    _ => WaitState::BlockedPeek(call),
                };
                Disposition::Parked
            },
            WaitAction::RejectWrongOrder => {
                call.complete(Err(GuestCtlError::wrong_order("a call is already waiting")));
                Disposition::Completed
            },
            _ => {
                call.complete(Err(GuestCtlError::ResourceBusy));
                Disposition::Completed
            },
        }
    }

    /// Completes a parked call now that `queue` has a head.
    ///
    /// Returns `true` if a parked call was completed.
    pub fn wakeup(
        &mut self,
        queue: &mut VecDeque<HostMessage>,
        config: &RouterConfig,
        outbox: &mut Vec<HostNotification>,
    ) -> bool {
        if queue.is_empty() {
            return false;
        }
        let action = transition(self.phase(), WaitEvent::Wakeup).action;
        match (action, std::mem::replace(&mut self.state, WaitState::Idle)) {
            (WaitAction::DeliverPeek, WaitState::BlockedPeek(mut call)) => {
                if let Some(head) = queue.front() {
                    head.set_peek_return(&mut call.params);
                }
                if call.complete(Ok(CallStatus::Success)) == Delivery::Cancelled {
                    debug!("woken peek was already cancelled by the guest");
                }
                true
            },
            (WaitAction::RunLegacy, WaitState::BlockedLegacyWait(call)) => {
                self.run_legacy(queue, call, true, config, outbox);
                true
            },
            (_, state) => {
                self.state = state;
                false
            },
        }
    }

    /// Cancels a parked call, or remembers the cancel if none is parked.
    ///
    /// Returns `true` if a parked call was completed.
    pub fn cancel(&mut self) -> bool {
        let action = transition(self.phase(), WaitEvent::Cancel).action;
        match (action, std::mem::replace(&mut self.state, WaitState::Idle)) {
            (WaitAction::CancelPeek, WaitState::BlockedPeek(mut call)) => {
                set_cancel_sentinel(&mut call.params);
                call.complete(Ok(CallStatus::TryAgain));
                self.pending_cancel = false;
                true
            },
            (WaitAction::CancelLegacy, WaitState::BlockedLegacyWait(mut call)) => {
                let result = legacy_cancel_result(&mut call.params);
                call.complete(result);
                self.pending_cancel = false;
                true
            },
            (_, state) => {
                self.state = state;
                self.pending_cancel = true;
                false
            },
        }
    }

    /// One round of the old wait protocol against the queue head.
    fn run_legacy(
        &mut self,
        queue: &mut VecDeque<HostMessage>,
        call: GuestCall,
        woken: bool,
        config: &RouterConfig,
        outbox: &mut Vec<HostNotification>,
    ) {
        let Some(head) = queue.front() else {
            call.complete(Err(GuestCtlError::TryAgain));
            return;
        };
        let rc = self.legacy_send_reply(head, call, woken);

        let remove = match &rc {
            Ok(()) => true,
            Err(err) => {
                self.legacy.tries += 1;
                match err {
                    GuestCtlError::TooMuchData | GuestCtlError::Cancelled => {
                        self.legacy.tries >= config.legacy_size_retry_limit
                    },
                    _ => self.legacy.tries > config.legacy_other_retry_limit,
                }
            },
        };
        debug!(
            tries = self.legacy.tries,
            peeks = self.legacy.peeks,
            remove,
            "legacy wait round finished"
        );

        if remove {
            self.reset_legacy();
            if let (Some(msg), Err(err)) = (queue.pop_front(), rc) {
                debug!(
                    msg_type = msg.msg_type(),
                    error = %err,
                    "dropping message the guest failed to retrieve"
                );
                outbox.push(msg.skip_notification(err.code()));
            }
        }
    }

    fn legacy_send_reply(
        &mut self,
        head: &HostMessage,
        mut call: GuestCall,
        woken: bool,
    ) -> Result<(), GuestCtlError> {
        let saved_peeks = self.legacy.peeks;

        let rc = if woken || self.legacy.peeks == 0 {
            self.legacy.peeks += 1;
            Err(head.legacy_peek(&mut call.params))
        } else if head.assign(&mut call.params).is_ok() {
            self.legacy.peeks = 0;
            Ok(())
        } else {
            self.legacy.peeks += 1;
            Err(head.legacy_peek(&mut call.params))
        };

        let delivery = call.complete(rc.clone().map(|()| CallStatus::Success));
        if delivery == Delivery::Cancelled && rc.is_ok() {
            self.legacy.peeks = saved_peeks;
            return Err(GuestCtlError::Cancelled);
        }
        rc
    }
}

fn set_cancel_sentinel(params: &mut [Param]) {
    if let Some(slot) = params.first_mut() {
        *slot = Param::U32(HostMsg::CancelPendingWaits.as_raw());
    }
}

/// Fills the cancel sentinels for an old wait and picks its result.
///
/// Old guests expect an answer in the first two slots; with exactly two
/// slots the cancel reads as success.
fn legacy_cancel_result(params: &mut [Param]) -> Result<CallStatus, GuestCtlError> {
    set_cancel_sentinel(params);
    if let Some(slot) = params.get_mut(1) {
        *slot = Param::U32(0);
    }
    if params.len() == 2 {
        Ok(CallStatus::Success)
    } else {
        Err(GuestCtlError::TryAgain)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;
    use crate::completion::CallReply;
    use crate::protocol::{GuestFn, DST_ROOT_SVC};

    fn message(msg_type: u32, extra: Vec<Param>) -> HostMessage {
        let mut params = vec![Param::U64(DST_ROOT_SVC | 0x10)];
        params.extend(extra);
        HostMessage::create(msg_type, &params).unwrap()
    }

    fn call(function: GuestFn, params: Vec<Param>) -> (GuestCall, tokio::sync::oneshot::Receiver<CallReply>) {
        GuestCall::channel(function.as_raw(), params)
    }

    #[test]
    fn table_rejects_second_blocking_call() {
        for phase in [WaitPhase::BlockedPeek, WaitPhase::BlockedLegacyWait] {
            let t = transition(phase, WaitEvent::BlockPeek);
            assert_eq!(t.action, WaitAction::RejectBusy);
            assert_eq!(t.next, phase);
        }
    }

    #[test]
    fn table_returns_to_idle_after_completion() {
        assert_eq!(
            transition(WaitPhase::BlockedPeek, WaitEvent::Wakeup).next,
            WaitPhase::Idle
        );
        assert_eq!(
            transition(WaitPhase::BlockedLegacyWait, WaitEvent::Cancel).next,
            WaitPhase::Idle
        );
        assert_eq!(
            transition(WaitPhase::Idle, WaitEvent::Cancel).action,
            WaitAction::FlagCancel
        );
    }

    #[test]
    fn peek_wait_parks_then_wakes() {
        let config = RouterConfig::default();
        let mut outbox = Vec::new();
        let mut queue = VecDeque::new();
        let mut r = Retrieval::new();

        let (c, mut rx) = call(GuestFn::PeekWait, vec![Param::U32(0), Param::U32(0)]);
        assert_eq!(r.peek(&queue, c, true), Disposition::Parked);
        assert_eq!(r.phase(), WaitPhase::BlockedPeek);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        queue.push_back(message(100, vec![Param::U32(1)]));
        assert!(r.wakeup(&mut queue, &config, &mut outbox));
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Ok(CallStatus::Success));
        assert_eq!(reply.params, vec![Param::U32(100), Param::U32(2)]);
        assert_eq!(queue.len(), 1, "peek does not consume");
        assert_eq!(r.phase(), WaitPhase::Idle);
    }

    #[test]
    fn second_peek_wait_is_busy() {
        let queue = VecDeque::new();
        let mut r = Retrieval::new();
        let (first, _rx1) = call(GuestFn::PeekWait, vec![Param::U32(0), Param::U32(0)]);
        let (second, mut rx2) = call(GuestFn::PeekWait, vec![Param::U32(0), Param::U32(0)]);
        r.peek(&queue, first, true);
        assert_eq!(r.peek(&queue, second, true), Disposition::Completed);
        assert_eq!(rx2.try_recv().unwrap().result, Err(GuestCtlError::ResourceBusy));
        assert_eq!(r.phase(), WaitPhase::BlockedPeek);
    }

    #[test]
    fn cancel_without_waiter_is_remembered() {
        let queue = VecDeque::new();
        let mut r = Retrieval::new();
        assert!(!r.cancel());
        assert!(r.has_pending_cancel());

        let (c, mut rx) = call(GuestFn::PeekWait, vec![Param::U64(9), Param::U32(0)]);
        assert_eq!(r.peek(&queue, c, true), Disposition::Completed);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Ok(CallStatus::TryAgain));
        assert_eq!(reply.params[0], Param::U32(0));
        assert!(!r.has_pending_cancel());
    }

    #[test]
    fn cancel_parked_legacy_wait_fills_sentinels() {
        let config = RouterConfig::default();
        let mut outbox = Vec::new();
        let mut queue = VecDeque::new();
        let mut r = Retrieval::new();

        let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(7), Param::U32(7), Param::U32(7)]);
        assert_eq!(r.wait_legacy(&mut queue, c, &config, &mut outbox), Disposition::Parked);
        assert!(r.cancel());
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Err(GuestCtlError::TryAgain));
        assert_eq!(reply.params, vec![Param::U32(0), Param::U32(0), Param::U32(7)]);

        let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(7), Param::U32(7)]);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);
        r.cancel();
        assert_eq!(rx.try_recv().unwrap().result, Ok(CallStatus::Success));
    }

    #[test]
    fn legacy_wait_peeks_first_then_delivers() {
        let config = RouterConfig::default();
        let mut outbox = Vec::new();
        let mut queue = VecDeque::new();
        let mut r = Retrieval::new();
        queue.push_back(message(20, vec![Param::U32(5)]));

        let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::U32(0)]);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Err(GuestCtlError::TooMuchData));
        assert_eq!(reply.params, vec![Param::U32(20), Param::U32(2)]);
        assert_eq!(queue.len(), 1);

        let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::U32(0)]);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Ok(CallStatus::Success));
        assert_eq!(reply.params, vec![Param::U32(0x10), Param::U32(5)]);
        assert!(queue.is_empty());
        assert!(outbox.is_empty());
    }

    #[test]
    fn legacy_wait_drops_after_retry_limit() {
        let config = RouterConfig::default();
        let mut outbox = Vec::new();
        let mut queue = VecDeque::new();
        let mut r = Retrieval::new();
        queue.push_back(message(
            HostMsg::FileRead.as_raw(),
            vec![Param::Buf(vec![1; 32])],
        ));

        for round in 1..=config.legacy_size_retry_limit {
            assert_eq!(queue.len(), 1, "still queued before round {round}");
            let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::Buf(vec![0; 4])]);
            r.wait_legacy(&mut queue, c, &config, &mut outbox);
            assert_eq!(rx.try_recv().unwrap().result, Err(GuestCtlError::TooMuchData));
        }
        assert!(queue.is_empty());
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].function, GuestFn::FileNotify.as_raw());
    }

    #[test]
    fn woken_legacy_wait_always_peeks() {
        let config = RouterConfig::default();
        let mut outbox = Vec::new();
        let mut queue = VecDeque::new();
        let mut r = Retrieval::new();

        let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::U32(0)]);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);
        queue.push_back(message(21, vec![Param::U32(3)]));
        assert!(r.wakeup(&mut queue, &config, &mut outbox));
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Err(GuestCtlError::TooMuchData));
        assert_eq!(reply.params, vec![Param::U32(21), Param::U32(2)]);
    }

    #[test]
    fn cancelled_delivery_keeps_message_and_peek_count() {
        let config = RouterConfig::default();
        let mut outbox = Vec::new();
        let mut queue = VecDeque::new();
        let mut r = Retrieval::new();
        queue.push_back(message(20, vec![Param::U32(5)]));

        let (c, _rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::U32(0)]);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);

        let (c, rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::U32(0)]);
        drop(rx);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);
        assert_eq!(queue.len(), 1);

        let (c, mut rx) = call(GuestFn::Wait, vec![Param::U32(0), Param::U32(0)]);
        r.wait_legacy(&mut queue, c, &config, &mut outbox);
        assert_eq!(rx.try_recv().unwrap().result, Ok(CallStatus::Success));
        assert!(queue.is_empty());
    }
}
