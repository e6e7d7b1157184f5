//! The `init` sub-command: stage the orchestrator and task-agent binaries
//! onto a shared volume for a later container stage to exec without the
//! image that built them.
//!
//! Grounded in the source system's init-container behavior: hard-link
//! first (cheap, same filesystem), fall back to a full copy if the
//! destination is on a different filesystem, then symlink a `circleci`
//! alias to the task-agent binary.

use std::path::Path;

use anyhow::{Context, Result};

const ORCHESTRATOR_BINARY: &str = "orchestrator";
const TASK_AGENT_BINARY: &str = "task-agent";
const TASK_AGENT_ALIAS: &str = "circleci";

pub fn run(src: &str, dst: &str) -> Result<()> {
    let src = Path::new(src);
    let dst = Path::new(dst);
    std::fs::create_dir_all(dst).with_context(|| format!("create destination directory {}", dst.display()))?;

    stage_binary(&src.join(ORCHESTRATOR_BINARY), &dst.join(ORCHESTRATOR_BINARY))?;
    stage_binary(&src.join(TASK_AGENT_BINARY), &dst.join(TASK_AGENT_BINARY))?;
    symlink_alias(&dst.join(TASK_AGENT_BINARY), &dst.join(TASK_AGENT_ALIAS))?;

    Ok(())
}

/// Hard-link `src` to `dst`, falling back to a full copy when they live on
/// different filesystems (hard links cannot cross filesystem boundaries).
fn stage_binary(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| format!("remove stale {}", dst.display()))?;
    }

    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dst)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
            preserve_executable_bit(src, dst)?;
            Ok(())
        }
    }
}

#[cfg(unix)]
fn preserve_executable_bit(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::metadata(src).with_context(|| format!("stat {}", src.display()))?.permissions();
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(perms.mode()))
        .with_context(|| format!("set permissions on {}", dst.display()))
}

#[cfg(not(unix))]
fn preserve_executable_bit(_src: &Path, _dst: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink_alias(target: &Path, link: &Path) -> Result<()> {
    if link.exists() || link.is_symlink() {
        std::fs::remove_file(link).with_context(|| format!("remove stale {}", link.display()))?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("symlink {} -> {}", link.display(), target.display()))
}

#[cfg(not(unix))]
fn symlink_alias(target: &Path, link: &Path) -> Result<()> {
    stage_binary(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_both_binaries_and_symlinks_alias() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        std::fs::write(src.path().join(ORCHESTRATOR_BINARY), b"orchestrator-bin")?;
        std::fs::write(src.path().join(TASK_AGENT_BINARY), b"task-agent-bin")?;

        run(src.path().to_str().unwrap(), dst.path().to_str().unwrap())?;

        assert_eq!(
            std::fs::read(dst.path().join(ORCHESTRATOR_BINARY))?,
            b"orchestrator-bin"
        );
        assert_eq!(std::fs::read(dst.path().join(TASK_AGENT_BINARY))?, b"task-agent-bin");

        let alias = dst.path().join(TASK_AGENT_ALIAS);
        assert!(alias.is_symlink());
        assert_eq!(std::fs::read(&alias)?, b"task-agent-bin");
        Ok(())
    }

    #[test]
    fn re_running_init_overwrites_stale_outputs() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        std::fs::write(src.path().join(ORCHESTRATOR_BINARY), b"v1")?;
        std::fs::write(src.path().join(TASK_AGENT_BINARY), b"v1")?;
        run(src.path().to_str().unwrap(), dst.path().to_str().unwrap())?;

        std::fs::write(src.path().join(ORCHESTRATOR_BINARY), b"v2")?;
        run(src.path().to_str().unwrap(), dst.path().to_str().unwrap())?;

        assert_eq!(std::fs::read(dst.path().join(ORCHESTRATOR_BINARY))?, b"v2");
        Ok(())
    }
}
