//! Guest call handles and their single-shot completion.
//!
//! The transport hands every guest call to the router as a [`GuestCall`]:
//! function number, the parameter vector the guest wants filled in, the
//! requestor credentials, and a [`CallCompletion`] sink. The router never
//! inspects the sink; it only calls [`GuestCall::complete`] exactly once,
//! which moves the (possibly rewritten) parameters back to the transport
//! together with the result.
//!
//! A call that has to block is parked inside the client's retrieval state
//! and completed later from whichever thread wakes or cancels it. Dropping a
//! parked call without completing it (client disconnect) is allowed; the
//! oneshot receiver then observes a closed channel.
//!
//! # Delivery
//!
//! Completion reports whether the guest was still listening. Several
//! operations tie state changes to delivery: a message is only popped after
//! its [`Get`](crate::protocol::GuestFn::Get) reply was delivered, so a guest
//! that cancelled in the meantime can retrieve it again.

use std::fmt;

use serde::Serialize;
/// Channel used by [`GuestCall::channel`].
pub use tokio::sync::oneshot;

use crate::error::{GuestCtlError, STATUS_INFO_TRY_AGAIN, STATUS_SUCCESS, STATUS_WARN_NOT_FOUND};
use crate::param::ParamVec;
use crate::protocol::Requestor;

/// Successful call outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Plain success.
    Success,
    /// Informational: a blocked peek was cancelled, peek again.
    TryAgain,
    /// Warning: nothing matched, which is not an error for this call.
    NotFoundWarning,
}

impl CallStatus {
    /// Returns the status code forwarded to the guest.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => STATUS_SUCCESS,
            Self::TryAgain => STATUS_INFO_TRY_AGAIN,
            Self::NotFoundWarning => STATUS_WARN_NOT_FOUND,
        }
    }
}

/// The outcome of a guest or host call.
pub type CallResult = Result<CallStatus, GuestCtlError>;

/// Returns the status code for any call result.
#[must_use]
pub const fn result_code(result: &CallResult) -> i32 {
    match result {
        Ok(status) => status.code(),
        Err(err) => err.code(),
    }
}

/// What the transport receives when a call completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReply {
    /// The call outcome.
    pub result: CallResult,
    /// The parameter vector, as rewritten by the broker.
    pub params: ParamVec,
}

/// Whether the completion reached the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The guest received the reply.
    Delivered,
    /// The guest had already cancelled the call.
    Cancelled,
}

impl Delivery {
    /// Returns `true` if the reply was delivered.
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// A single-shot completion sink supplied by the transport.
///
/// Implementations must not call back into the router: completion runs while
/// the router's state lock is held.
pub trait CallCompletion: Send {
    /// Delivers the reply.
    fn complete(self: Box<Self>, reply: CallReply) -> Delivery;
}

impl CallCompletion for oneshot::Sender<CallReply> {
    fn complete(self: Box<Self>, reply: CallReply) -> Delivery {
        match (*self).send(reply) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Cancelled,
        }
    }
}

/// Adapts a closure into a [`CallCompletion`].
pub struct FnCompletion<F>(pub F);

impl<F> CallCompletion for FnCompletion<F>
where
    F: FnOnce(CallReply) -> Delivery + Send,
{
    fn complete(self: Box<Self>, reply: CallReply) -> Delivery {
        (self.0)(reply)
    }
}

/// A guest call in flight.
pub struct GuestCall {
    function: u32,
    requestor: Requestor,
    /// Parameters the guest supplied; rewritten in place before completion.
    pub params: ParamVec,
    completion: Box<dyn CallCompletion>,
}

impl GuestCall {
    /// Creates a call with legacy requestor information.
    pub fn new(function: u32, params: ParamVec, completion: impl CallCompletion + 'static) -> Self {
        Self {
            function,
            requestor: Requestor::LEGACY,
            params,
            completion: Box::new(completion),
        }
    }

    /// Creates a call completed through a oneshot channel.
    #[must_use]
    pub fn channel(function: u32, params: ParamVec) -> (Self, oneshot::Receiver<CallReply>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(function, params, tx), rx)
    }

    /// Sets the requestor credentials for this call.
    #[must_use]
    pub fn with_requestor(mut self, requestor: Requestor) -> Self {
        self.requestor = requestor;
        self
    }

    /// Returns the raw function number.
    #[must_use]
    pub const fn function(&self) -> u32 {
        self.function
    }

    /// Returns the requestor credentials.
    #[must_use]
    pub const fn requestor(&self) -> Requestor {
        self.requestor
    }

    /// Completes the call, handing the parameters back.
    pub fn complete(self, result: CallResult) -> Delivery {
        self.completion.complete(CallReply {
            result,
            params: self.params,
        })
    }
}

impl fmt::Debug for GuestCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCall")
            .field("function", &self.function)
            .field("requestor", &self.requestor)
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Param;

    #[test]
    fn oneshot_delivery_returns_params() {
        let (call, mut rx) = GuestCall::channel(8, vec![Param::U32(1)]);
        assert_eq!(call.complete(Ok(CallStatus::Success)), Delivery::Delivered);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.result, Ok(CallStatus::Success));
        assert_eq!(reply.params, vec![Param::U32(1)]);
    }

    #[test]
    fn dropped_receiver_is_cancelled() {
        let (call, rx) = GuestCall::channel(8, vec![]);
        drop(rx);
        assert_eq!(call.complete(Ok(CallStatus::Success)), Delivery::Cancelled);
    }

    #[test]
    fn closure_completion_sees_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let call = GuestCall::new(
            12,
            vec![],
            FnCompletion(move |reply: CallReply| {
                tx.send(reply.result).unwrap();
                Delivery::Cancelled
            }),
        );
        assert_eq!(call.complete(Err(GuestCtlError::NotFound)), Delivery::Cancelled);
        assert_eq!(rx.recv().unwrap(), Err(GuestCtlError::NotFound));
    }

    #[test]
    fn result_codes() {
        assert_eq!(result_code(&Ok(CallStatus::TryAgain)), 52);
        assert_eq!(result_code(&Err(GuestCtlError::TryAgain)), -52);
    }
}
