//! Queued host messages.
//!
//! A [`HostMessage`] is an owned deep copy of one host call. It lives in
//! exactly one client queue until it is delivered, skipped, or its client
//! disconnects. Fan-out to both delivery legs duplicates it explicitly with
//! [`HostMessage::try_duplicate`]; queues never share buffers.
//!
//! The first parameter of a stored message always holds the 32-bit context
//! id, whatever width the host used, so old guests that fetch it as a plain
//! integer keep working. The destination bits are kept separately.

use tracing::warn;

use crate::error::{BufferShortfall, GuestCtlError};
use crate::extension::HostNotification;
use crate::param::{try_clone_params, Param, ParamVec};
use crate::protocol::{
    context_object, file_notify, Destinations, GuestFn, HostMsg, DST_BOTH, INPUT_STATUS_ERROR,
    PROC_STATUS_ERROR, SESSION_NOTIFY_ERROR,
};

/// One host command waiting for its guest.
#[derive(Debug, PartialEq, Eq)]
pub struct HostMessage {
    msg_type: u32,
    context_id: u32,
    destinations: Destinations,
    params: ParamVec,
    /// Set when a 6.0 beta guest answered this message with "not supported"
    /// and will follow up with the old skip call.
    skip_unsupported: bool,
}

impl HostMessage {
    /// Builds a message from a host call.
    ///
    /// # Errors
    ///
    /// - [`GuestCtlError::WrongParameterCount`] for an empty vector
    /// - [`GuestCtlError::WrongParameterType`] if the first slot is a buffer
    /// - [`GuestCtlError::InvalidParameter`] if no destination bit is set
    /// - [`GuestCtlError::NoMemory`] if the deep copy fails
    pub fn create(msg_type: u32, params: &[Param]) -> Result<Self, GuestCtlError> {
        let raw = match params.first() {
            None => return Err(GuestCtlError::wrong_count(0)),
            Some(Param::U64(v)) => *v,
            Some(Param::U32(v)) => {
                warn!(msg_type, "host message without destination bits, sending to both");
                u64::from(*v) | DST_BOTH
            },
            Some(Param::Buf(_)) => return Err(GuestCtlError::wrong_type(0)),
        };

        let destinations = Destinations::from_bits(raw);
        if destinations.is_empty() {
            return Err(GuestCtlError::InvalidParameter {
                reason: "host message has no destination",
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let context_id = raw as u32;
        let mut copied = try_clone_params(params)?;
        copied[0] = Param::U32(context_id);

        Ok(Self {
            msg_type,
            context_id,
            destinations,
            params: copied,
            skip_unsupported: false,
        })
    }

    /// Deep-copies the message for a second delivery leg.
    ///
    /// # Errors
    ///
    /// Returns [`GuestCtlError::NoMemory`] if a buffer cannot be allocated.
    pub fn try_duplicate(&self) -> Result<Self, GuestCtlError> {
        Ok(Self {
            msg_type: self.msg_type,
            context_id: self.context_id,
            destinations: self.destinations,
            params: try_clone_params(&self.params)?,
            skip_unsupported: self.skip_unsupported,
        })
    }

    /// Host message type.
    #[must_use]
    pub const fn msg_type(&self) -> u32 {
        self.msg_type
    }

    /// Context id (low 32 bits of the first host parameter).
    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    /// Delivery legs requested by the host.
    #[must_use]
    pub const fn destinations(&self) -> Destinations {
        self.destinations
    }

    /// Stored parameters; slot 0 is the context id.
    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Number of stored parameters.
    #[must_use]
    pub fn param_count(&self) -> u32 {
        u32::try_from(self.params.len()).unwrap_or(u32::MAX)
    }

    /// Marks the message for silent dropping by the old skip call.
    pub fn mark_skip_unsupported(&mut self) {
        self.skip_unsupported = true;
    }

    /// Returns `true` if [`mark_skip_unsupported`](Self::mark_skip_unsupported)
    /// was called.
    #[must_use]
    pub const fn is_skip_unsupported(&self) -> bool {
        self.skip_unsupported
    }

    /// Describes the message to a peeking guest.
    ///
    /// Slot 0 receives the type, slot 1 the parameter count, and any further
    /// slots the size of the corresponding parameter (4 or 8 for integers,
    /// the byte length for buffers). Slot widths are preserved.
    pub fn set_peek_return(&self, dst: &mut [Param]) {
        if let Some(slot) = dst.get_mut(0) {
            slot.set_uint(self.msg_type);
        }
        if let Some(slot) = dst.get_mut(1) {
            slot.set_uint(self.param_count());
        }
        for (slot, param) in dst.iter_mut().skip(2).zip(&self.params) {
            slot.set_uint(param.wire_size());
        }
    }

    /// Copies the parameters into a guest's receive slots.
    ///
    /// Integers are copied by value. A buffer that fits replaces the
    /// receiver's contents, leaving its length equal to the source length.
    /// A buffer that does not fit receives as many bytes as it can hold and
    /// is reported; the remaining parameters are still copied so the guest
    /// learns every required size at once.
    ///
    /// # Errors
    ///
    /// - [`GuestCtlError::WrongParameterCount`] unless the slot count matches
    /// - [`GuestCtlError::WrongParameterType`] for the first slot whose type
    ///   differs; nothing is copied in that case
    /// - [`GuestCtlError::BufferOverflow`] listing every short buffer
    pub fn copy_into(&self, dst: &mut [Param]) -> Result<(), GuestCtlError> {
        if dst.len() != self.params.len() {
            return Err(GuestCtlError::wrong_count(dst.len()));
        }
        if let Some(index) = dst
            .iter()
            .zip(&self.params)
            .position(|(d, s)| d.param_type() != s.param_type())
        {
            return Err(GuestCtlError::wrong_type(index));
        }

        let mut shortfalls = Vec::new();
        for (index, (slot, src)) in dst.iter_mut().zip(&self.params).enumerate() {
            match (slot, src) {
                (Param::U32(d), Param::U32(s)) => *d = *s,
                (Param::U64(d), Param::U64(s)) => *d = *s,
                (Param::Buf(d), Param::Buf(s)) => {
                    if d.len() >= s.len() {
                        d.clear();
                        d.extend_from_slice(s);
                    } else {
                        let available = d.len();
                        d.copy_from_slice(&s[..available]);
                        shortfalls.push(BufferShortfall {
                            index,
                            required: s.len(),
                            available,
                        });
                    }
                },
                _ => return Err(GuestCtlError::wrong_type(index)),
            }
        }

        if shortfalls.is_empty() {
            Ok(())
        } else {
            Err(GuestCtlError::BufferOverflow { shortfalls })
        }
    }

    /// Old-protocol delivery of the whole message.
    ///
    /// Any failure is reported as [`GuestCtlError::TooMuchData`], which old
    /// guests read as "peek again and resize".
    ///
    /// # Errors
    ///
    /// Returns [`GuestCtlError::TooMuchData`] if the slots cannot take the
    /// message.
    pub fn assign(&self, dst: &mut [Param]) -> Result<(), GuestCtlError> {
        if dst.len() < self.params.len() {
            return Err(GuestCtlError::TooMuchData);
        }
        self.copy_into(dst).map_err(|_| GuestCtlError::TooMuchData)
    }

    /// Old-protocol peek: type and count into slots 0 and 1.
    ///
    /// Always yields [`GuestCtlError::TooMuchData`], the old guests' signal
    /// to size their buffers and call again.
    #[must_use]
    pub fn legacy_peek(&self, dst: &mut [Param]) -> GuestCtlError {
        if dst.len() >= 2 {
            dst[0] = Param::U32(self.msg_type);
            dst[1] = Param::U32(self.param_count());
        }
        GuestCtlError::TooMuchData
    }

    /// Builds the notification that tells the host this message will never
    /// be answered.
    ///
    /// `rc` is the status the guest reported; it is forwarded unchanged.
    #[must_use]
    pub fn skip_notification(&self, rc: i32) -> HostNotification {
        let ctx = Param::U32(self.context_id);
        #[allow(clippy::cast_sign_loss)]
        let rc = Param::U32(rc as u32);

        let file = |kind: u32, extra: Option<Param>| {
            let mut params = vec![ctx.clone(), Param::U32(kind), rc.clone()];
            params.extend(extra);
            HostNotification::new(GuestFn::FileNotify.as_raw(), params)
        };

        match HostMsg::from_raw(self.msg_type) {
            Some(HostMsg::ExecCmd) => HostNotification::new(
                GuestFn::ExecStatus.as_raw(),
                vec![
                    ctx,
                    Param::U32(0),
                    Param::U32(PROC_STATUS_ERROR),
                    rc,
                    Param::Buf(Vec::new()),
                ],
            ),
            Some(HostMsg::SessionCreate) => HostNotification::new(
                GuestFn::SessionNotify.as_raw(),
                vec![ctx, Param::U32(SESSION_NOTIFY_ERROR), rc],
            ),
            Some(HostMsg::ExecSetInput) => {
                let pid = self.params.get(1).and_then(Param::as_u32).unwrap_or(0);
                HostNotification::new(
                    GuestFn::ExecInputStatus.as_raw(),
                    vec![
                        ctx,
                        Param::U32(pid),
                        Param::U32(INPUT_STATUS_ERROR),
                        rc,
                        Param::U32(0),
                    ],
                )
            },
            Some(HostMsg::FileOpen) => file(
                file_notify::OPEN,
                Some(Param::U32(context_object(self.context_id))),
            ),
            Some(HostMsg::FileClose) => file(file_notify::ERROR, None),
            Some(HostMsg::FileRead | HostMsg::FileReadAt) => {
                file(file_notify::READ, Some(Param::Buf(Vec::new())))
            },
            Some(HostMsg::FileWrite | HostMsg::FileWriteAt) => {
                file(file_notify::WRITE, Some(Param::U32(0)))
            },
            Some(HostMsg::FileSeek) => file(file_notify::SEEK, Some(Param::U64(0))),
            Some(HostMsg::FileTell) => file(file_notify::TELL, Some(Param::U64(0))),
            Some(HostMsg::FileSetSize) => file(file_notify::SET_SIZE, Some(Param::U64(0))),
            // Includes the dir/path queries whose replies are handled generically.
            _ => HostNotification::new(
                GuestFn::Reply.as_raw(),
                vec![ctx, Param::U32(self.msg_type), rc, Param::Buf(Vec::new())],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    // Test code uses proptest which generates patterns that trigger these lints.
    #![allow(clippy::cast_possible_truncation)]

    use proptest::prelude::*;

    use super::*;
    use crate::protocol::{make_context, DST_ROOT_SVC, DST_SESSION};

    fn sample(msg_type: u32) -> HostMessage {
        HostMessage::create(
            msg_type,
            &[
                Param::U64(u64::from(make_context(2, 7, 9)) | DST_SESSION),
                Param::U32(42),
                Param::Buf(b"payload".to_vec()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn create_morphs_first_slot_to_context() {
        let msg = sample(HostMsg::ExecCmd.as_raw());
        assert_eq!(msg.context_id(), make_context(2, 7, 9));
        assert_eq!(msg.params()[0], Param::U32(make_context(2, 7, 9)));
        assert!(msg.destinations().session);
        assert!(!msg.destinations().root);
    }

    #[test]
    fn create_rejects_bad_first_slot() {
        assert_eq!(
            HostMessage::create(1, &[]),
            Err(GuestCtlError::wrong_count(0))
        );
        assert_eq!(
            HostMessage::create(1, &[Param::Buf(vec![])]),
            Err(GuestCtlError::wrong_type(0))
        );
        assert!(matches!(
            HostMessage::create(1, &[Param::U64(5)]),
            Err(GuestCtlError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn create_without_destination_bits_targets_both() {
        let msg = HostMessage::create(1, &[Param::U32(77)]).unwrap();
        assert!(msg.destinations().is_both());
        assert_eq!(msg.context_id(), 77);
    }

    #[test]
    fn peek_return_reports_shape_and_sizes() {
        let msg = sample(260);
        let mut dst = vec![Param::U64(0), Param::U32(0), Param::U32(0), Param::U32(0), Param::U32(0), Param::U32(9)];
        msg.set_peek_return(&mut dst);
        assert_eq!(
            dst,
            vec![
                Param::U64(260),
                Param::U32(3),
                Param::U32(4),
                Param::U32(4),
                Param::U32(7),
                Param::U32(9),
            ]
        );
    }

    #[test]
    fn copy_into_reports_every_short_buffer() {
        let msg = HostMessage::create(
            5,
            &[
                Param::U64(DST_ROOT_SVC | 1),
                Param::Buf(vec![1; 10]),
                Param::U32(3),
                Param::Buf(vec![2; 20]),
            ],
        )
        .unwrap();
        let mut dst = vec![
            Param::U32(0),
            Param::Buf(vec![0; 4]),
            Param::U32(0),
            Param::Buf(vec![0; 5]),
        ];
        let err = msg.copy_into(&mut dst).unwrap_err();
        let GuestCtlError::BufferOverflow { shortfalls } = err else {
            panic!("expected overflow, got {err:?}");
        };
        assert_eq!(shortfalls.len(), 2);
        assert_eq!(shortfalls[0].index, 1);
        assert_eq!(shortfalls[0].required, 10);
        assert_eq!(shortfalls[1].index, 3);
        assert_eq!(shortfalls[1].available, 5);
        assert_eq!(dst[2], Param::U32(3), "later integers are still copied");
    }

    #[test]
    fn copy_into_shrinks_oversized_buffers() {
        let msg = sample(1);
        let mut dst = vec![Param::U32(0), Param::U32(0), Param::Buf(vec![0; 64])];
        msg.copy_into(&mut dst).unwrap();
        assert_eq!(dst[2], Param::Buf(b"payload".to_vec()));
    }

    #[test]
    fn copy_into_type_mismatch_copies_nothing() {
        let msg = sample(1);
        let mut dst = vec![Param::U32(0), Param::U64(0), Param::Buf(vec![0; 64])];
        assert_eq!(msg.copy_into(&mut dst), Err(GuestCtlError::wrong_type(1)));
        assert_eq!(dst[0], Param::U32(0));
    }

    #[test]
    fn assign_maps_failures_to_too_much_data() {
        let msg = sample(1);
        let mut too_few = vec![Param::U32(0), Param::U32(0)];
        assert_eq!(msg.assign(&mut too_few), Err(GuestCtlError::TooMuchData));
        let mut small = vec![Param::U32(0), Param::U32(0), Param::Buf(vec![0; 2])];
        assert_eq!(msg.assign(&mut small), Err(GuestCtlError::TooMuchData));
        let mut fits = vec![Param::U32(0), Param::U32(0), Param::Buf(vec![0; 7])];
        assert_eq!(msg.assign(&mut fits), Ok(()));
    }

    #[test]
    fn legacy_peek_fills_two_slots() {
        let msg = sample(100);
        let mut dst = vec![Param::U32(0), Param::U32(0), Param::U32(0)];
        assert_eq!(msg.legacy_peek(&mut dst), GuestCtlError::TooMuchData);
        assert_eq!(dst[0], Param::U32(100));
        assert_eq!(dst[1], Param::U32(3));
        let mut one = vec![Param::U32(5)];
        let _ = msg.legacy_peek(&mut one);
        assert_eq!(one[0], Param::U32(5));
    }

    #[test]
    fn skip_notification_table() {
        let ctx = make_context(3, 12, 1);
        let build = |msg_type: u32| {
            HostMessage::create(
                msg_type,
                &[Param::U64(u64::from(ctx) | DST_SESSION), Param::U32(4321)],
            )
            .unwrap()
            .skip_notification(-37)
        };
        let rc = Param::U32((-37i32) as u32);

        let exec = build(HostMsg::ExecCmd.as_raw());
        assert_eq!(exec.function, GuestFn::ExecStatus.as_raw());
        assert_eq!(exec.params[2], Param::U32(PROC_STATUS_ERROR));

        let input = build(HostMsg::ExecSetInput.as_raw());
        assert_eq!(input.params[1], Param::U32(4321));
        assert_eq!(input.params[3], rc);

        let open = build(HostMsg::FileOpen.as_raw());
        assert_eq!(
            open.params,
            vec![Param::U32(ctx), Param::U32(file_notify::OPEN), rc.clone(), Param::U32(12)]
        );

        let close = build(HostMsg::FileClose.as_raw());
        assert_eq!(close.params.len(), 3);

        let tell = build(HostMsg::FileTell.as_raw());
        assert_eq!(tell.params[3], Param::U64(0));

        let other = build(HostMsg::PathUserHome.as_raw());
        assert_eq!(other.function, GuestFn::Reply.as_raw());
        assert_eq!(other.params[1], Param::U32(HostMsg::PathUserHome.as_raw()));
    }

    fn arb_payload() -> impl Strategy<Value = Param> {
        prop_oneof![
            any::<u32>().prop_map(Param::U32),
            any::<u64>().prop_map(Param::U64),
            prop::collection::vec(any::<u8>(), 0..128).prop_map(Param::Buf),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: create followed by copy into identically sized slots
        /// reproduces every value, including the synthesised first slot.
        #[test]
        fn create_then_copy_reproduces_params(
            ctx in any::<u32>(),
            payload in prop::collection::vec(arb_payload(), 0..8),
        ) {
            let mut input = vec![Param::U64(u64::from(ctx) | DST_ROOT_SVC)];
            input.extend(payload.iter().cloned());
            let msg = HostMessage::create(9, &input).unwrap();

            let mut dst: Vec<Param> = std::iter::once(Param::U32(0))
                .chain(payload.iter().map(|p| match p {
                    Param::U32(_) => Param::U32(0),
                    Param::U64(_) => Param::U64(0),
                    Param::Buf(b) => Param::Buf(vec![0; b.len()]),
                }))
                .collect();
            msg.copy_into(&mut dst).unwrap();

            prop_assert_eq!(&dst[0], &Param::U32(ctx));
            prop_assert_eq!(&dst[1..], &payload[..]);
        }
    }
}
