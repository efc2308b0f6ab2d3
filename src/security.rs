#![forbid(unsafe_code)]

//! Shared security helpers for the grabtube binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The backend shells out to an
/// external engine and writes caller-influenced filenames into scratch
/// space, so it is expected to run under a dedicated unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; please use an unprivileged service account");
    }
    Ok(())
}
