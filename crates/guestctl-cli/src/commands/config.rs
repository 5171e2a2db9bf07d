//! `guestctl config`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use guestctl_core::RouterConfig;

/// Loads the configuration at `path`, or the defaults when none is given.
pub fn load(path: Option<&Path>) -> Result<RouterConfig> {
    path.map_or_else(
        || Ok(RouterConfig::default()),
        |path| {
            RouterConfig::from_file(path)
                .with_context(|| format!("failed to load configuration {}", path.display()))
        },
    )
}

/// Prints the default configuration.
pub fn show_default() -> Result<()> {
    print!("{}", RouterConfig::default().to_toml()?);
    Ok(())
}

/// Validates the configuration given by `--config`.
pub fn check(path: Option<&Path>) -> Result<()> {
    let Some(path) = path else {
        bail!("no configuration file given; pass --config <path>");
    };
    load(Some(path))?;
    println!("{}: ok", path.display());
    Ok(())
}
