//! Readiness gating: block agent startup until a sibling container touches
//! a sentinel file.

use std::{path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{channel, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_WAIT_FOR_READINESS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Block until `path` exists, or until timeout/cancellation.
pub async fn wait_for_file(path: &str, cancel: &CancellationToken) -> Result<()> {
    wait_for_file_with_timeout(path, DEFAULT_WAIT_FOR_READINESS_TIMEOUT, cancel).await
}

async fn wait_for_file_with_timeout(
    path: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = Path::new(path);

    match path.try_exists() {
        Ok(true) => {
            debug!(path = %path.display(), "readiness file already present");
            return Ok(());
        }
        Ok(false) => {}
        Err(e) => return Err(e).context("stat readiness file"),
    }

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));

    let (mut watcher, mut rx) = async_watcher()?;
    watcher
        .watch(parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch directory {}", parent.display()))?;

    // A create event could have raced between the existence check and the
    // watch registration; check again now that we're subscribed.
    if path.try_exists().context("stat readiness file")? {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => bail!("task cancelled while waiting for readiness file"),
            _ = tokio::time::sleep(timeout) => bail!(
                "timed out after {:?} waiting for readiness file {}",
                timeout,
                path.display()
            ),
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        if matches_path(&event, path) {
                            debug!(path = %path.display(), "readiness file observed");
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => bail!("watcher error: {e}"),
                    None => bail!("watcher channel closed unexpectedly"),
                }
            }
        }
    }
}

fn matches_path(event: &Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) && event.paths.iter().any(|p| p == path)
}

fn async_watcher() -> Result<(RecommendedWatcher, Receiver<notify::Result<Event>>)> {
    let (tx, rx) = channel(16);
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        futures::executor::block_on(async {
            let _ = tx.send(res).await;
        })
    })
    .context("create recommended watcher")?;
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn succeeds_immediately_when_file_already_exists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ready");
        std::fs::write(&path, b"")?;
        let cancel = CancellationToken::new();
        wait_for_file_with_timeout(path.to_str().unwrap(), StdDuration::from_secs(5), &cancel).await
    }

    #[tokio::test]
    async fn succeeds_once_file_is_created() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ready");
        let path_str = path.to_str().unwrap().to_owned();
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn(async move {
            wait_for_file_with_timeout(&path_str, StdDuration::from_secs(5), &cancel).await
        });

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        std::fs::write(&path, b"")?;

        waiter.await??;
        Ok(())
    }

    #[tokio::test]
    async fn times_out_when_file_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never");
        let cancel = CancellationToken::new();
        let result =
            wait_for_file_with_timeout(path.to_str().unwrap(), StdDuration::from_millis(50), &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never");
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let result =
            wait_for_file_with_timeout(path.to_str().unwrap(), StdDuration::from_secs(5), &cancel).await;
        assert!(result.is_err());
    }
}
