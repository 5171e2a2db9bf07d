//! `guestctl replay`.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use guestctl_core::Router;
use tracing::info;

use super::config::load;
use crate::script::{self, Event, Script};

/// Runs `script_path` through a fresh router and prints every event as a
/// JSON line.
///
/// Returns whether any step or parked call ended with a failure status.
pub fn run(config_path: Option<&Path>, script_path: &Path) -> Result<bool> {
    let config = load(config_path)?;
    let content = std::fs::read_to_string(script_path)
        .with_context(|| format!("failed to read script {}", script_path.display()))?;
    let script: Script = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse script {}", script_path.display()))?;

    let router = Router::try_new(config).context("invalid broker configuration")?;
    let events = script::run(&router, &script)?;
    info!(steps = script.steps.len(), events = events.len(), "replay finished");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in &events {
        serde_json::to_writer(&mut out, event).context("failed to encode event")?;
        writeln!(out).context("failed to write event")?;
    }

    Ok(events.iter().any(|event| match event {
        Event::Result { status, .. } | Event::Wake { status, .. } => *status < 0,
        Event::Dropped { .. } | Event::Notify { .. } | Event::Snapshot { .. } => false,
    }))
}
