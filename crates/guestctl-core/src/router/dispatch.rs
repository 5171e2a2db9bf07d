//! Guest function handlers.
//!
//! Every handler runs with the router lock held and either completes the
//! call, parks it, or hands it back as [`Step::Forward`]. State changes that
//! the guest must observe (becoming master, binding a session, consuming a
//! message) are committed only after the completion reports the reply was
//! delivered; a guest that gave up on the call sees no side effect.

use tracing::{debug, info, warn};

use super::{RouterState, Step};
use crate::client::ClientState;
use crate::completion::{CallResult, CallStatus, GuestCall};
use crate::config::RouterConfig;
use crate::error::{GuestCtlError, STATUS_NOT_SUPPORTED};
use crate::extension::HostNotification;
use crate::message::HostMessage;
use crate::param::{expect_count, get_buf, get_u32, get_u64, Param};
use crate::protocol::{
    context_session, GuestFn, HostMsg, Requestor, DST_SESSION, GUEST_FEATURE1_MUST_BE_ONE,
};
use crate::session::KeyCheck;
use crate::wait::Disposition;

/// Completes `$call` with the error if `$e` fails.
macro_rules! check {
    ($call:ident, $e:expr) => {
        match $e {
            Ok(value) => value,
            Err(err) => return reply($call, Err(err)),
        }
    };
}

/// Filter mask every old guest sends; anything else is logged.
const LEGACY_FILTER_MASK: u32 = 0xf800_0000;

fn reply(call: GuestCall, result: CallResult) -> Step {
    call.complete(result);
    Step::Done(Disposition::Completed)
}

const fn done() -> Step {
    Step::Done(Disposition::Completed)
}

/// Per-call credentials win over the ones recorded at connect time.
fn effective_requestor(call: &GuestCall, client: &ClientState) -> Requestor {
    if call.requestor().is_legacy() {
        client.requestor()
    } else {
        call.requestor()
    }
}

fn session_id_arg(config: &RouterConfig, params: &[Param]) -> Result<u32, GuestCtlError> {
    let id = get_u32(params, 0)?;
    if id == 0 || id > config.max_session_id {
        return Err(GuestCtlError::OutOfRange {
            value: u64::from(id),
        });
    }
    Ok(id)
}

fn session_key_arg(config: &RouterConfig, params: &[Param]) -> Result<Vec<u8>, GuestCtlError> {
    let key = get_buf(params, 1)?;
    if key.len() < config.min_session_key_size {
        return Err(GuestCtlError::BufferUnderflow {
            size: key.len(),
            min: config.min_session_key_size,
        });
    }
    if key.len() > config.max_session_key_size {
        return Err(GuestCtlError::BufferTooLarge {
            size: key.len(),
            max: config.max_session_key_size,
        });
    }
    Ok(key.to_vec())
}

fn feature_args(params: &[Param]) -> Result<(u64, u64), GuestCtlError> {
    expect_count(params, 2)?;
    Ok((get_u64(params, 0)?, get_u64(params, 1)?))
}

/// Expected message type for get and skip; `u32::MAX` means any.
fn expected_type(param: Option<&Param>) -> u32 {
    match param {
        Some(Param::U32(v)) => *v,
        #[allow(clippy::cast_possible_truncation)]
        Some(Param::U64(v)) => *v as u32,
        _ => u32::MAX,
    }
}

fn check_head(head: &HostMessage, expected: u32) -> Result<(), GuestCtlError> {
    if expected != u32::MAX && head.msg_type() != expected {
        return Err(GuestCtlError::Mismatch {
            expected,
            actual: head.msg_type(),
        });
    }
    Ok(())
}

impl RouterState {
    fn client(&self, client_id: u32) -> Result<&ClientState, GuestCtlError> {
        self.clients
            .get(&client_id)
            .ok_or(GuestCtlError::InvalidClientId { client_id })
    }

    fn client_mut(&mut self, client_id: u32) -> Result<&mut ClientState, GuestCtlError> {
        self.clients
            .get_mut(&client_id)
            .ok_or(GuestCtlError::InvalidClientId { client_id })
    }

    /// Routes one guest call to its handler.
    pub(super) fn dispatch(
        &mut self,
        config: &RouterConfig,
        client_id: u32,
        call: GuestCall,
        outbox: &mut Vec<HostNotification>,
    ) -> Step {
        if !self.clients.contains_key(&client_id) {
            warn!(client_id, "call from unknown client");
            return reply(call, Err(GuestCtlError::InvalidClientId { client_id }));
        }
        let raw = call.function();
        let Some(function) = GuestFn::from_raw(raw) else {
            debug!(client_id, function = raw, "unknown guest function");
            return reply(call, Err(GuestCtlError::InvalidFunction { function: raw }));
        };
        debug!(client_id, ?function, params = call.params.len(), "guest call");

        match function {
            GuestFn::MakeMeMaster => self.make_me_master(client_id, call),
            GuestFn::ReportFeatures => self.report_features(config, client_id, call, outbox),
            GuestFn::QueryFeatures => query_features(config, call),
            GuestFn::PeekNoWait => self.peek(client_id, call, false),
            GuestFn::PeekWait => self.peek(client_id, call, true),
            GuestFn::Get => self.get(client_id, call),
            GuestFn::Cancel => self.cancel(client_id, call),
            GuestFn::Skip => self.skip(client_id, call, outbox),
            GuestFn::SessionPrepare => self.session_prepare(config, client_id, call),
            GuestFn::SessionCancelPrepared => self.session_cancel_prepared(client_id, call),
            GuestFn::SessionAccept => self.session_accept(config, client_id, call),
            GuestFn::SessionClose => self.session_close(config, client_id, call, outbox),
            GuestFn::Wait => self.wait_legacy(config, client_id, call, outbox),
            GuestFn::SkipOld => self.skip_old(client_id, call, outbox),
            GuestFn::FilterSet => self.filter_set(client_id, call),
            GuestFn::FilterUnset => reply(call, Err(GuestCtlError::NotImplemented)),
            // Host-bound notification number; guests may not send it.
            GuestFn::Disconnected => {
                reply(call, Err(GuestCtlError::InvalidFunction { function: raw }))
            },
            other => self.forward(client_id, call, other),
        }
    }

    // ========================================================================
    // Role and features
    // ========================================================================

    fn make_me_master(&mut self, client_id: u32, call: GuestCall) -> Step {
        check!(call, expect_count(&call.params, 0));
        let client = check!(call, self.client(client_id));
        let requestor = effective_requestor(&call, client);
        if requestor.is_legacy() {
            return reply(call, Err(GuestCtlError::VersionMismatch));
        }
        if requestor.is_user_device() {
            return reply(call, Err(GuestCtlError::AccessDenied));
        }
        if let Some(master) = self.master.filter(|&id| id != client_id) {
            debug!(client_id, master, "master role already taken");
            return reply(call, Err(GuestCtlError::ResourceBusy));
        }

        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            if let Ok(client) = self.client_mut(client_id) {
                client.set_master(true);
            }
            self.master = Some(client_id);
            if self.legacy_mode {
                self.legacy_mode = false;
                info!(client_id, "client claimed master role, leaving legacy mode");
            }
        }
        done()
    }

    fn report_features(
        &mut self,
        config: &RouterConfig,
        client_id: u32,
        mut call: GuestCall,
        outbox: &mut Vec<HostNotification>,
    ) -> Step {
        let (f0, f1) = check!(call, feature_args(&call.params));
        if f1 & GUEST_FEATURE1_MUST_BE_ONE == 0 {
            return reply(
                call,
                Err(GuestCtlError::InvalidParameter {
                    reason: "feature word 1 lacks the must-be-one bit",
                }),
            );
        }
        if self.master != Some(client_id) {
            return reply(call, Err(GuestCtlError::AccessDenied));
        }

        call.params[0] = Param::U64(config.host_features0);
        call.params[1] = Param::U64(0);
        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            self.guest_features = [f0, f1];
            outbox.push(HostNotification::new(
                GuestFn::ReportFeatures.as_raw(),
                vec![Param::U64(f0), Param::U64(f1)],
            ));
            info!(client_id, f0 = format_args!("{f0:#x}"), "guest features reported");
        }
        done()
    }

    // ========================================================================
    // Message retrieval
    // ========================================================================

    fn peek(&mut self, client_id: u32, mut call: GuestCall, wait: bool) -> Step {
        let count = call.params.len();
        if count < 2 {
            return reply(call, Err(GuestCtlError::wrong_count(count)));
        }
        let restore_id = match &call.params[0] {
            Param::U64(v) => *v,
            Param::U32(_) => 0,
            Param::Buf(_) => return reply(call, Err(GuestCtlError::wrong_type(0))),
        };
        if let Some(index) = call.params[1..]
            .iter()
            .position(|p| p.as_u32().is_none())
        {
            return reply(call, Err(GuestCtlError::wrong_type(index + 1)));
        }
        for slot in &mut call.params {
            slot.set_uint(0);
        }

        if restore_id != 0 && restore_id != self.vm_session_id {
            let current = self.vm_session_id;
            debug!(client_id, restore_id, current, "guest saw a vm restore");
            call.params[0] = Param::U64(current);
            return reply(call, Err(GuestCtlError::VmRestored { current }));
        }

        let client = check!(call, self.client_mut(client_id));
        Step::Done(client.peek(call, wait))
    }

    fn get(&mut self, client_id: u32, mut call: GuestCall) -> Step {
        let expected = expected_type(call.params.first());
        let client = check!(call, self.client_mut(client_id));
        let Some(head) = client.head() else {
            for slot in call.params.iter_mut().take(2) {
                slot.set_uint(0);
            }
            return reply(call, Err(GuestCtlError::TryAgain));
        };
        check!(call, check_head(head, expected));
        check!(call, head.copy_into(&mut call.params));

        let msg_type = head.msg_type();
        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            client.pop_head();
            client.reset_legacy();
            debug!(client_id, msg_type, "message retrieved");
        }
        done()
    }

    fn cancel(&mut self, client_id: u32, call: GuestCall) -> Step {
        check!(call, expect_count(&call.params, 0));
        let client = check!(call, self.client_mut(client_id));
        let status = if client.cancel_waiting() {
            CallStatus::Success
        } else {
            CallStatus::NotFoundWarning
        };
        reply(call, Ok(status))
    }

    fn skip(&mut self, client_id: u32, call: GuestCall, outbox: &mut Vec<HostNotification>) -> Step {
        let count = call.params.len();
        if count > 2 {
            return reply(call, Err(GuestCtlError::wrong_count(count)));
        }
        #[allow(clippy::cast_possible_wrap)]
        let rc = if count >= 1 {
            check!(call, get_u32(&call.params, 0)) as i32
        } else {
            STATUS_NOT_SUPPORTED
        };
        let expected = if count >= 2 {
            check!(call, get_u32(&call.params, 1))
        } else {
            u32::MAX
        };

        let client = check!(call, self.client_mut(client_id));
        let Some(head) = client.head() else {
            return reply(call, Err(GuestCtlError::NotFound));
        };
        check!(call, check_head(head, expected));

        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            if let Some(msg) = client.pop_head() {
                client.reset_legacy();
                debug!(client_id, msg_type = msg.msg_type(), rc, "message skipped");
                outbox.push(msg.skip_notification(rc));
            }
        }
        done()
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn session_prepare(&mut self, config: &RouterConfig, client_id: u32, call: GuestCall) -> Step {
        check!(call, expect_count(&call.params, 2));
        let session_id = check!(call, session_id_arg(config, &call.params));
        let key = check!(call, session_key_arg(config, &call.params));
        if self.master != Some(client_id) || self.legacy_mode {
            return reply(call, Err(GuestCtlError::AccessDenied));
        }
        if self.sessions.contains_key(&session_id) {
            return reply(
                call,
                Err(GuestCtlError::Duplicate {
                    what: "session",
                    id: session_id,
                }),
            );
        }
        check!(
            call,
            self.prepared
                .check_insert(session_id, config.max_prepared_sessions)
        );

        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            self.prepared.insert(session_id, key);
            debug!(client_id, session_id, "session prepared");
        }
        done()
    }

    fn session_cancel_prepared(&mut self, client_id: u32, call: GuestCall) -> Step {
        check!(call, expect_count(&call.params, 1));
        let session_id = check!(call, get_u32(&call.params, 0));
        if self.master != Some(client_id) || self.legacy_mode {
            return reply(call, Err(GuestCtlError::AccessDenied));
        }
        let removed = self.prepared.remove(session_id);
        debug!(client_id, session_id, removed, "prepared sessions cancelled");
        let status = if removed > 0 {
            CallStatus::Success
        } else {
            CallStatus::NotFoundWarning
        };
        reply(call, Ok(status))
    }

    fn session_accept(&mut self, config: &RouterConfig, client_id: u32, call: GuestCall) -> Step {
        check!(call, expect_count(&call.params, 2));
        let session_id = check!(call, session_id_arg(config, &call.params));
        let key = check!(call, session_key_arg(config, &call.params));

        let client = check!(call, self.client(client_id));
        if client.is_master() || self.legacy_mode {
            return reply(call, Err(GuestCtlError::AccessDenied));
        }
        let bound = client.session_id().is_some();

        match self.prepared.check_key(session_id, &key) {
            KeyCheck::Missing => {
                return reply(call, Err(GuestCtlError::NotFound));
            },
            KeyCheck::Mismatch => {
                warn!(client_id, session_id, "session key mismatch");
                return reply(call, Err(GuestCtlError::KeyMismatch { session_id }));
            },
            KeyCheck::Match => {},
        }
        if bound {
            return reply(call, Err(GuestCtlError::ResourceBusy));
        }

        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            if let Err(err) = self
                .client_mut(client_id)
                .and_then(|client| client.bind_session(session_id))
            {
                warn!(client_id, session_id, error = %err, "accepted session not bound");
                return done();
            }
            self.sessions.insert(session_id, client_id);
            self.prepared.remove(session_id);
            info!(client_id, session_id, "session accepted");
        }
        done()
    }

    fn session_close(
        &mut self,
        config: &RouterConfig,
        client_id: u32,
        call: GuestCall,
        outbox: &mut Vec<HostNotification>,
    ) -> Step {
        check!(call, expect_count(&call.params, 2));
        let ctx = check!(call, get_u32(&call.params, 0));
        let flags = check!(call, get_u32(&call.params, 1));

        let client = check!(call, self.client(client_id));
        let allowed = client.is_master() || (self.legacy_mode && client.session_id().is_none());
        if !allowed {
            return reply(call, Err(GuestCtlError::AccessDenied));
        }

        debug!(client_id, session = context_session(ctx), flags, "closing session");
        let params = [Param::U64(u64::from(ctx) | DST_SESSION), Param::U32(flags)];
        let result = HostMessage::create(HostMsg::SessionClose.as_raw(), &params)
            .and_then(|msg| self.route_locked(config, msg, outbox));
        reply(call, result)
    }

    // ========================================================================
    // Forwarded notifications
    // ========================================================================

    fn forward(&mut self, client_id: u32, call: GuestCall, function: GuestFn) -> Step {
        if !function.is_forwarded() {
            return reply(
                call,
                Err(GuestCtlError::InvalidFunction {
                    function: function as u32,
                }),
            );
        }
        let Some(ctx) = call.params.first().and_then(Param::as_u32) else {
            let count = call.params.len();
            return reply(call, Err(GuestCtlError::wrong_count(count)));
        };

        let legacy_mode = self.legacy_mode;
        let client = check!(call, self.client_mut(client_id));
        let authorized = client.session_id() == Some(context_session(ctx))
            || client.is_master()
            || (legacy_mode
                && client.session_id().is_none()
                && function.is_legacy_unbound_allowed());
        if !authorized {
            debug!(client_id, ?function, ctx, "forward not authorized");
            return reply(call, Err(GuestCtlError::AccessDenied));
        }

        // 6.0 beta guests answer unknown messages with "not supported" and
        // then issue the old skip call for the same message.
        #[allow(clippy::cast_sign_loss)]
        let unsupported = Param::U32(STATUS_NOT_SUPPORTED as u32);
        if function == GuestFn::Reply && call.params.get(2) == Some(&unsupported) {
            if let Some(head) = client.head_mut().filter(|h| h.context_id() == ctx) {
                head.mark_skip_unsupported();
            }
        }
        Step::Forward(call)
    }

    // ========================================================================
    // Old protocol
    // ========================================================================

    fn wait_legacy(
        &mut self,
        config: &RouterConfig,
        client_id: u32,
        call: GuestCall,
        outbox: &mut Vec<HostNotification>,
    ) -> Step {
        let client = check!(call, self.client_mut(client_id));
        if client.session_id().is_none() && !client.is_master() && !client.is_restored() {
            warn!(client_id, "old wait from a client that is neither bound nor master");
        }
        Step::Done(client.wait_legacy(call, config, outbox))
    }

    fn skip_old(&mut self, client_id: u32, call: GuestCall, outbox: &mut Vec<HostNotification>) -> Step {
        check!(call, expect_count(&call.params, 1));
        let client = check!(call, self.client_mut(client_id));
        let Some(head) = client.head() else {
            return reply(call, Ok(CallStatus::Success));
        };

        if head.is_skip_unsupported() {
            client.pop_head();
            client.reset_legacy();
            debug!(client_id, "dropped message already answered as unsupported");
            return reply(call, Ok(CallStatus::Success));
        }

        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            if let Some(msg) = client.pop_head() {
                debug!(client_id, msg_type = msg.msg_type(), "message skipped by old guest");
                outbox.push(msg.skip_notification(STATUS_NOT_SUPPORTED));
            }
            client.reset_legacy();
        }
        done()
    }

    fn filter_set(&mut self, client_id: u32, call: GuestCall) -> Step {
        check!(call, expect_count(&call.params, 4));
        let value = check!(call, get_u32(&call.params, 0));
        let mask_add = check!(call, get_u32(&call.params, 1));
        check!(call, get_u32(&call.params, 2));
        check!(call, get_u32(&call.params, 3));

        let client = check!(call, self.client(client_id));
        let violation = if !self.legacy_mode {
            Some("filter needs legacy mode")
        } else if client.session_id().is_some() {
            Some("client already bound")
        } else if client.is_master() {
            Some("master cannot filter")
        } else if client.filter_applied() {
            Some("filter already set")
        } else {
            None
        };
        if let Some(reason) = violation {
            return reply(call, Err(GuestCtlError::wrong_order(reason)));
        }

        if value == 0 {
            if call.complete(Ok(CallStatus::Success)).is_delivered() {
                if let Ok(client) = self.client_mut(client_id) {
                    client.mark_filter_applied();
                }
            }
            return done();
        }

        if mask_add != LEGACY_FILTER_MASK {
            warn!(client_id, mask_add = format_args!("{mask_add:#x}"), "unexpected filter mask");
        }
        let session_id = context_session(value);
        if session_id == 0 {
            return reply(
                call,
                Err(GuestCtlError::OutOfRange {
                    value: u64::from(value),
                }),
            );
        }
        if self.sessions.contains_key(&session_id) {
            return reply(
                call,
                Err(GuestCtlError::Duplicate {
                    what: "session",
                    id: session_id,
                }),
            );
        }

        if call.complete(Ok(CallStatus::Success)).is_delivered() {
            let bound = self.client_mut(client_id).and_then(|client| {
                client.bind_session(session_id)?;
                client.mark_filter_applied();
                Ok(())
            });
            match bound {
                Ok(()) => {
                    self.sessions.insert(session_id, client_id);
                    info!(client_id, session_id, "old guest bound by filter");
                },
                Err(err) => warn!(client_id, session_id, error = %err, "filter not applied"),
            }
        }
        done()
    }
}

fn query_features(config: &RouterConfig, mut call: GuestCall) -> Step {
    let (_, f1) = check!(call, feature_args(&call.params));
    if f1 & GUEST_FEATURE1_MUST_BE_ONE == 0 {
        warn!("feature query without the must-be-one bit");
    }
    call.params[0] = Param::U64(config.host_features0);
    call.params[1] = Param::U64(0);
    reply(call, Ok(CallStatus::Success))
}
