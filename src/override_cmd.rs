//! The `override` sub-command: splice a user-supplied entrypoint in front
//! of `run-task` via `exec`, so it can be used as a container `ENTRYPOINT`.

use anyhow::{Context, Result};

/// Re-exec `entrypoint` with this process's `argv[0]` and `run-task`
/// appended. Never returns on success: the calling process image is
/// replaced.
#[cfg(unix)]
pub fn run(entrypoint: &str) -> Result<()> {
    use std::ffi::CString;

    let self_exe = std::env::args_os().next().context("determine own argv[0]")?;

    let program = CString::new(entrypoint.as_bytes()).context("entrypoint path contains a NUL byte")?;
    let args: Vec<CString> = [
        CString::new(entrypoint.as_bytes())?,
        CString::new(self_exe.as_encoded_bytes())?,
        CString::new("run-task")?,
    ]
    .into_iter()
    .collect();

    nix::unistd::execvp(&program, &args).context("exec entrypoint")?;
    unreachable!("execvp only returns on error, which is handled above");
}

#[cfg(not(unix))]
pub fn run(_entrypoint: &str) -> Result<()> {
    anyhow::bail!("override --entrypoint is only supported on unix platforms")
}
