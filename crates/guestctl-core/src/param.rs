//! Typed call parameters.
//!
//! Every payload exchanged between host, broker and guest is an ordered
//! vector of tagged values. Matching is positional: a receiver accepts a
//! vector only when its declared type sequence lines up, otherwise it signals
//! [`GuestCtlError::WrongParameterType`].
//!
//! Buffers are owned by whoever holds the vector. [`try_clone_params`] is the
//! only way the broker duplicates a vector; it deep-copies every buffer and
//! reports allocation failure as [`GuestCtlError::NoMemory`] instead of
//! aborting.

use serde::{Deserialize, Serialize};

use crate::error::GuestCtlError;

/// A parameter vector.
pub type ParamVec = Vec<Param>;

/// One tagged parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Param {
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// Opaque byte buffer. The length is the buffer's capacity when the
    /// parameter is a receive slot.
    Buf(Vec<u8>),
}

/// The tag of a [`Param`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// See [`Param::U32`].
    U32,
    /// See [`Param::U64`].
    U64,
    /// See [`Param::Buf`].
    Buf,
}

impl Param {
    /// Returns the type tag.
    #[must_use]
    pub const fn param_type(&self) -> ParamType {
        match self {
            Self::U32(_) => ParamType::U32,
            Self::U64(_) => ParamType::U64,
            Self::Buf(_) => ParamType::Buf,
        }
    }

    /// Returns the value if this is a 32-bit integer.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value if this is a 64-bit integer.
    #[must_use]
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the bytes if this is a buffer.
    #[must_use]
    pub fn as_buf(&self) -> Option<&[u8]> {
        match self {
            Self::Buf(b) => Some(b),
            _ => None,
        }
    }

    /// Size in bytes as reported to a peeking guest.
    #[must_use]
    pub fn wire_size(&self) -> u32 {
        match self {
            Self::U32(_) => 4,
            Self::U64(_) => 8,
            Self::Buf(b) => u32::try_from(b.len()).unwrap_or(u32::MAX),
        }
    }

    /// Overwrites an integer slot, keeping its width.
    ///
    /// A 64-bit slot receives the value widened; any other slot becomes a
    /// 32-bit integer.
    pub fn set_uint(&mut self, value: u32) {
        *self = match self {
            Self::U64(_) => Self::U64(u64::from(value)),
            _ => Self::U32(value),
        };
    }

    /// Deep-copies the parameter, reporting allocation failure.
    ///
    /// # Errors
    ///
    /// Returns [`GuestCtlError::NoMemory`] if a buffer cannot be allocated.
    pub fn try_clone(&self) -> Result<Self, GuestCtlError> {
        Ok(match self {
            Self::U32(v) => Self::U32(*v),
            Self::U64(v) => Self::U64(*v),
            Self::Buf(src) => {
                let mut dst = Vec::new();
                dst.try_reserve_exact(src.len())
                    .map_err(|_| GuestCtlError::NoMemory)?;
                dst.extend_from_slice(src);
                Self::Buf(dst)
            },
        })
    }
}

/// Deep-copies a parameter vector.
///
/// On failure every buffer copied so far is released before the error is
/// returned.
///
/// # Errors
///
/// Returns [`GuestCtlError::NoMemory`] if any buffer cannot be allocated.
pub fn try_clone_params(src: &[Param]) -> Result<ParamVec, GuestCtlError> {
    let mut out = Vec::new();
    out.try_reserve_exact(src.len())
        .map_err(|_| GuestCtlError::NoMemory)?;
    for param in src {
        out.push(param.try_clone()?);
    }
    Ok(out)
}

/// Reads a 32-bit integer at `index`.
///
/// # Errors
///
/// Returns [`GuestCtlError::WrongParameterType`] if the slot holds another
/// type. The caller checks the count first.
pub fn get_u32(params: &[Param], index: usize) -> Result<u32, GuestCtlError> {
    params
        .get(index)
        .and_then(Param::as_u32)
        .ok_or(GuestCtlError::wrong_type(index))
}

/// Reads a 64-bit integer at `index`.
///
/// # Errors
///
/// Returns [`GuestCtlError::WrongParameterType`] if the slot holds another
/// type.
pub fn get_u64(params: &[Param], index: usize) -> Result<u64, GuestCtlError> {
    params
        .get(index)
        .and_then(Param::as_u64)
        .ok_or(GuestCtlError::wrong_type(index))
}

/// Reads a buffer at `index`.
///
/// # Errors
///
/// Returns [`GuestCtlError::WrongParameterType`] if the slot holds another
/// type.
pub fn get_buf(params: &[Param], index: usize) -> Result<&[u8], GuestCtlError> {
    params
        .get(index)
        .and_then(Param::as_buf)
        .ok_or(GuestCtlError::wrong_type(index))
}

/// Fails unless exactly `expected` parameters were supplied.
///
/// # Errors
///
/// Returns [`GuestCtlError::WrongParameterCount`].
pub fn expect_count(params: &[Param], expected: usize) -> Result<(), GuestCtlError> {
    if params.len() == expected {
        Ok(())
    } else {
        Err(GuestCtlError::wrong_count(params.len()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(Param::U32(7).wire_size(), 4);
        assert_eq!(Param::U64(7).wire_size(), 8);
        assert_eq!(Param::Buf(vec![0; 33]).wire_size(), 33);
    }

    #[test]
    fn set_uint_keeps_width() {
        let mut wide = Param::U64(99);
        wide.set_uint(5);
        assert_eq!(wide, Param::U64(5));

        let mut narrow = Param::Buf(vec![1]);
        narrow.set_uint(5);
        assert_eq!(narrow, Param::U32(5));
    }

    #[test]
    fn typed_accessors_report_index() {
        let params = vec![Param::U32(1), Param::Buf(vec![2])];
        assert_eq!(get_u32(&params, 0), Ok(1));
        assert_eq!(get_u32(&params, 1), Err(GuestCtlError::wrong_type(1)));
        assert_eq!(get_buf(&params, 1), Ok(&[2u8][..]));
        assert_eq!(get_u64(&params, 5), Err(GuestCtlError::wrong_type(5)));
        assert_eq!(expect_count(&params, 3), Err(GuestCtlError::wrong_count(2)));
    }

    #[test]
    fn serde_shape_is_tagged() {
        let json = serde_json::to_string(&Param::U64(3)).unwrap();
        assert_eq!(json, r#"{"type":"u64","value":3}"#);
    }

    fn arb_param() -> impl Strategy<Value = Param> {
        prop_oneof![
            any::<u32>().prop_map(Param::U32),
            any::<u64>().prop_map(Param::U64),
            prop::collection::vec(any::<u8>(), 0..256).prop_map(Param::Buf),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn deep_copy_preserves_every_value(params in prop::collection::vec(arb_param(), 0..12)) {
            let copy = try_clone_params(&params).unwrap();
            prop_assert_eq!(&copy, &params);
            for (a, b) in copy.iter().zip(&params) {
                if let (Param::Buf(x), Param::Buf(y)) = (a, b) {
                    if !x.is_empty() {
                        prop_assert_ne!(x.as_ptr(), y.as_ptr());
                    }
                }
            }
        }
    }
}
