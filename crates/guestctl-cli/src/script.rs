//! Replay scripts.
//!
//! A script is a JSON document listing connect, call, host and lifecycle
//! steps. [`run`] feeds them to a [`Router`] in order and records what
//! happened as a flat list of [`Event`]s: the immediate outcome of every
//! step, parked guest calls that complete later, and every notification the
//! router hands to the host.
//!
//! ```json
//! {
//!   "steps": [
//!     { "op": "connect", "client": 1, "requestor": "kernel" },
//!     { "op": "call", "client": 1, "function": 13 },
//!     { "op": "host", "msg": 20, "params": [{ "type": "u64", "value": 9223372036854775809 }] }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use guestctl_core::completion::oneshot::error::TryRecvError;
use guestctl_core::completion::oneshot::Receiver;
use guestctl_core::completion::result_code;
use guestctl_core::{
    CallReply, CallResult, Disposition, GuestCall, GuestCtlError, Param, Requestor, Router,
    RouterSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A replay script.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Id reported to guests that check for a VM restore on peek.
    #[serde(default)]
    pub vm_session_id: u64,
    /// Steps, run in order.
    pub steps: Vec<Step>,
}

/// Requestor credentials in script form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptRequestor {
    /// No credentials (old guest additions).
    #[default]
    Legacy,
    /// Trusted kernel-mode requestor.
    Kernel,
    /// User-mode requestor on the constrained device.
    User,
    /// Raw requestor bits.
    Raw(u32),
}

impl From<ScriptRequestor> for Requestor {
    fn from(requestor: ScriptRequestor) -> Self {
        match requestor {
            ScriptRequestor::Legacy => Self::LEGACY,
            ScriptRequestor::Kernel => Self::KERNEL,
            ScriptRequestor::User => Self(Self::USER_DEVICE),
            ScriptRequestor::Raw(bits) => Self(bits),
        }
    }
}

/// One script step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// A guest client connects.
    Connect {
        /// Client id.
        client: u32,
        /// Connect-time credentials.
        #[serde(default)]
        requestor: ScriptRequestor,
    },
    /// A guest client disconnects.
    Disconnect {
        /// Client id.
        client: u32,
    },
    /// A guest call.
    Call {
        /// Calling client.
        client: u32,
        /// Raw guest function number.
        function: u32,
        /// Parameter slots.
        #[serde(default)]
        params: Vec<Param>,
        /// Per-call credentials.
        #[serde(default)]
        requestor: Option<ScriptRequestor>,
    },
    /// A host call.
    Host {
        /// Raw host message type.
        msg: u32,
        /// Parameters; the first carries context id and destinations.
        params: Vec<Param>,
    },
    /// Save one client's state; the blob is reported in the result.
    Save {
        /// Client id.
        client: u32,
    },
    /// Restore one client's state.
    Load {
        /// Client id.
        client: u32,
        /// Blob from an earlier save; absent for pre-versioned state.
        #[serde(default)]
        blob: Option<String>,
    },
    /// Report the router state.
    Snapshot,
}

impl Step {
    const fn op(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Call { .. } => "call",
            Self::Host { .. } => "host",
            Self::Save { .. } => "save",
            Self::Load { .. } => "load",
            Self::Snapshot => "snapshot",
        }
    }
}

/// Something observed while replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Immediate outcome of a step.
    Result {
        /// Zero-based step index.
        step: usize,
        /// Step kind.
        op: &'static str,
        /// Numeric status; negative on failure.
        status: i32,
        /// Readable outcome.
        message: String,
        /// Parameters handed back to the guest.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Param>>,
        /// Saved-state blob.
        #[serde(skip_serializing_if = "Option::is_none")]
        blob: Option<String>,
        /// Set when the call parked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        parked: bool,
    },
    /// A parked call completed.
    Wake {
        /// Step that parked the call.
        step: usize,
        /// Numeric status.
        status: i32,
        /// Readable outcome.
        message: String,
        /// Parameters handed back to the guest.
        params: Vec<Param>,
    },
    /// A parked call was dropped unanswered because its client went away.
    Dropped {
        /// Step that parked the call.
        step: usize,
    },
    /// The router notified the host.
    Notify {
        /// Guest function number reported to the host.
        function: u32,
        /// Payload.
        params: Vec<Param>,
    },
    /// Router state at a snapshot step.
    Snapshot {
        /// Zero-based step index.
        step: usize,
        /// The state.
        snapshot: RouterSnapshot,
    },
}

type Notifications = Arc<Mutex<Vec<(u32, Vec<Param>)>>>;

fn describe(result: &CallResult) -> String {
    match result {
        Ok(status) => format!("{status:?}"),
        Err(err) => err.to_string(),
    }
}

fn outcome(step: usize, op: &'static str, result: &Result<(), GuestCtlError>) -> Event {
    Event::Result {
        step,
        op,
        status: result.as_ref().map_or_else(GuestCtlError::code, |_| 0),
        message: result
            .as_ref()
            .map_or_else(ToString::to_string, |_| "Success".to_string()),
        params: None,
        blob: None,
        parked: false,
    }
}

fn reply_event(step: usize, reply: CallReply) -> Event {
    Event::Result {
        step,
        op: "call",
        status: result_code(&reply.result),
        message: describe(&reply.result),
        params: Some(reply.params),
        blob: None,
        parked: false,
    }
}

/// Runs a script against `router`.
///
/// Registers a recording host callback on the router for the duration of
/// the run.
///
/// # Errors
///
/// Fails if a completed call's channel is unexpectedly closed, or a load
/// step's blob cannot be handled.
pub fn run(router: &Router, script: &Script) -> Result<Vec<Event>> {
    let notifications: Notifications = Arc::default();
    let sink = Arc::clone(&notifications);
    router.register_host_callback(Arc::new(
        move |function: u32, params: &[Param]| -> Result<(), GuestCtlError> {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((function, params.to_vec()));
            Ok(())
        },
    ));
    router.set_vm_session_id(script.vm_session_id);

    let mut events = Vec::new();
    let mut parked: BTreeMap<usize, Receiver<CallReply>> = BTreeMap::new();

    for (index, step) in script.steps.iter().enumerate() {
        debug!(step = index, op = step.op(), "replaying step");
        match step {
            Step::Connect { client, requestor } => {
                let result = router.connect(*client, (*requestor).into());
                events.push(outcome(index, step.op(), &result));
            },
            Step::Disconnect { client } => {
                let result = router.disconnect(*client);
                events.push(outcome(index, step.op(), &result));
            },
            Step::Call {
                client,
                function,
                params,
                requestor,
            } => {
                let (mut call, mut rx) = GuestCall::channel(*function, params.clone());
                if let Some(requestor) = requestor {
                    call = call.with_requestor((*requestor).into());
                }
                match router.call(*client, call) {
                    Disposition::Completed => {
                        let reply = rx
                            .try_recv()
                            .with_context(|| format!("step {index}: completed call has no reply"))?;
                        events.push(reply_event(index, reply));
                    },
                    Disposition::Parked => {
                        events.push(Event::Result {
                            step: index,
                            op: step.op(),
                            status: 0,
                            message: "Parked".to_string(),
                            params: None,
                            blob: None,
                            parked: true,
                        });
                        parked.insert(index, rx);
                    },
                }
            },
            Step::Host { msg, params } => {
                let result = router.host_call(*msg, params);
                events.push(Event::Result {
                    step: index,
                    op: step.op(),
                    status: result_code(&result),
                    message: describe(&result),
                    params: None,
                    blob: None,
                    parked: false,
                });
            },
            Step::Save { client } => {
                let event = match router.save_client_state(*client) {
                    Ok(blob) => Event::Result {
                        step: index,
                        op: step.op(),
                        status: 0,
                        message: "Success".to_string(),
                        params: None,
                        blob: Some(
                            String::from_utf8(blob).context("saved state is not valid UTF-8")?,
                        ),
                        parked: false,
                    },
                    Err(err) => outcome(index, step.op(), &Err(GuestCtlError::from(&err))),
                };
                events.push(event);
            },
            Step::Load { client, blob } => {
                let result = router
                    .load_client_state(*client, blob.as_deref().map(str::as_bytes))
                    .map_err(|err| GuestCtlError::from(&err));
                events.push(outcome(index, step.op(), &result));
            },
            Step::Snapshot => events.push(Event::Snapshot {
                step: index,
                snapshot: router.snapshot(),
            }),
        }

        collect_wakes(&mut parked, &mut events);
        events.extend(
            std::mem::take(
                &mut *notifications
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            )
            .into_iter()
            .map(|(function, params)| Event::Notify { function, params }),
        );
    }

    router.unregister_host_callback();
    Ok(events)
}

fn collect_wakes(parked: &mut BTreeMap<usize, Receiver<CallReply>>, events: &mut Vec<Event>) {
    let mut finished = Vec::new();
    for (&step, rx) in parked.iter_mut() {
        match rx.try_recv() {
            Ok(reply) => {
                events.push(Event::Wake {
                    step,
                    status: result_code(&reply.result),
                    message: describe(&reply.result),
                    params: reply.params,
                });
                finished.push(step);
            },
            Err(TryRecvError::Closed) => {
                events.push(Event::Dropped { step });
                finished.push(step);
            },
            Err(TryRecvError::Empty) => {},
        }
    }
    for step in finished {
        parked.remove(&step);
    }
}

#[cfg(test)]
mod tests {
    use guestctl_core::{GuestFn, HostMsg, RouterConfig};

    use super::*;

    fn parse(json: &str) -> Script {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_every_step_kind() {
        let script = parse(
            r#"{
                "vm_session_id": 7,
                "steps": [
                    {"op": "connect", "client": 1, "requestor": "kernel"},
                    {"op": "connect", "client": 2, "requestor": {"raw": 2048}},
                    {"op": "call", "client": 1, "function": 13},
                    {"op": "host", "msg": 20, "params": [{"type": "u32", "value": 1}]},
                    {"op": "save", "client": 1},
                    {"op": "load", "client": 1},
                    {"op": "snapshot"},
                    {"op": "disconnect", "client": 2}
                ]
            }"#,
        );
        assert_eq!(script.vm_session_id, 7);
        assert_eq!(script.steps.len(), 8);
        assert!(matches!(
            script.steps[1],
            Step::Connect {
                requestor: ScriptRequestor::Raw(2048),
                ..
            }
        ));
    }

    #[test]
    fn parked_peek_is_reported_when_woken() {
        let router = Router::new(RouterConfig::default());
        let script = Script {
            vm_session_id: 0,
            steps: vec![
                Step::Connect {
                    client: 1,
                    requestor: ScriptRequestor::Kernel,
                },
                Step::Call {
                    client: 1,
                    function: GuestFn::PeekWait.as_raw(),
                    params: vec![Param::U64(0), Param::U32(0)],
                    requestor: None,
                },
                Step::Host {
                    msg: HostMsg::ExecCmd.as_raw(),
                    params: vec![Param::U64((1 << 63) | 5), Param::U32(1)],
                },
            ],
        };
        let events = run(&router, &script).unwrap();
        assert!(matches!(events[1], Event::Result { parked: true, .. }));
        assert!(matches!(events[2], Event::Result { status: 0, .. }));
        assert_eq!(
            events[3],
            Event::Wake {
                step: 1,
                status: 0,
                message: "Success".to_string(),
                params: vec![Param::U32(HostMsg::ExecCmd.as_raw()), Param::U32(2)],
            }
        );
    }

    #[test]
    fn host_notifications_follow_their_step() {
        let router = Router::new(RouterConfig::default());
        let script = Script {
            vm_session_id: 0,
            steps: vec![
                Step::Connect {
                    client: 1,
                    requestor: ScriptRequestor::Kernel,
                },
                Step::Host {
                    msg: HostMsg::ExecCmd.as_raw(),
                    params: vec![Param::U64((1 << 63) | 5)],
                },
                Step::Disconnect { client: 1 },
            ],
        };
        let events = run(&router, &script).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            Event::Notify {
                function: GuestFn::Disconnected.as_raw(),
                params: vec![Param::U32(5)],
            }
        );
    }

    #[test]
    fn save_blob_round_trips_through_load() {
        let router = Router::new(RouterConfig::default());
        let saved = run(
            &router,
            &parse(r#"{"steps": [{"op": "connect", "client": 1, "requestor": "kernel"}, {"op": "save", "client": 1}]}"#),
        )
        .unwrap();
        let Event::Result {
            blob: Some(blob), ..
        } = &saved[1]
        else {
            panic!("save produced no blob: {saved:?}");
        };

        let restored = Router::new(RouterConfig::default());
        let script = Script {
            vm_session_id: 0,
            steps: vec![
                Step::Connect {
                    client: 4,
                    requestor: ScriptRequestor::User,
                },
                Step::Load {
                    client: 4,
                    blob: Some(blob.clone()),
                },
            ],
        };
        let events = run(&restored, &script).unwrap();
        assert!(matches!(events[1], Event::Result { status: 0, .. }));
        assert_eq!(restored.master_client_id(), Some(4));
    }
}
