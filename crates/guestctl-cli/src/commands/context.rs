//! `guestctl context`.

use anyhow::Result;
use guestctl_core::protocol::{context_count, context_object, context_session, make_context};
use serde::Serialize;

#[derive(Debug, PartialEq, Eq, Serialize)]
struct ContextParts {
    ctx: u32,
    session: u32,
    object: u32,
    count: u32,
}

impl ContextParts {
    const fn of(ctx: u32) -> Self {
        Self {
            ctx,
            session: context_session(ctx),
            object: context_object(ctx),
            count: context_count(ctx),
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal `u32`.
pub fn parse_u32(raw: &str) -> Result<u32, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid context id {raw:?}: {err}"))
}

/// Prints the parts of `ctx` as JSON.
pub fn decode(ctx: u32) -> Result<()> {
    println!("{}", serde_json::to_string(&ContextParts::of(ctx))?);
    Ok(())
}

/// Prints the context id built from the given parts as JSON.
///
/// Parts wider than their field are truncated, so the printed parts are the
/// ones that survive.
pub fn make(session: u32, object: u32, count: u32) -> Result<()> {
    decode(make_context(session, object, count))
}
