//! Orphan reaping: PID-1 duty.
//!
//! The orchestrator usually runs as PID 1 of its pod, so any grandchild
//! whose immediate parent dies re-parents to us and must be waited-for or it
//! lingers as a zombie. A single background task drains these on every
//! `SIGCHLD`. The tricky part is not stealing the task agent's own exit
//! status: while the orchestrator still needs to `wait()` the agent by PID,
//! the reaper must not call a wildcard `waitpid(-1, ...)` that could race it
//! and consume that status first. A shared [`RwLock`] enforces this: the
//! orchestrator holds the read side for as long as the agent may still need
//! waiting-for, and the reap loop only drains while holding the write side.

use std::{sync::Mutex, time::Duration};

use tokio::sync::{oneshot, OwnedRwLockReadGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Reaper {
    lock: std::sync::Arc<RwLock<()>>,
    read_guard: Mutex<Option<OwnedRwLockReadGuard<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    reap_timeout: Duration,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new(DEFAULT_REAP_TIMEOUT)
    }
}

impl Reaper {
    pub fn new(reap_timeout: Duration) -> Self {
        Self {
            lock: std::sync::Arc::new(RwLock::new(())),
            read_guard: Mutex::new(None),
            done_rx: Mutex::new(None),
            reap_timeout,
        }
    }

    /// Take the shared read-hold and spawn the reap loop. Must be called
    /// before any child (entrypoint or agent) is spawned.
    pub async fn enable(&self, cancel: CancellationToken) {
        let guard = self.lock.clone().read_owned().await;
        *self.read_guard.lock().expect("read_guard mutex poisoned") = Some(guard);

        let lock = self.lock.clone();
        let reap_timeout = self.reap_timeout;
        let (tx, rx) = oneshot::channel();
        *self.done_rx.lock().expect("done_rx mutex poisoned") = Some(rx);

        tokio::spawn(async move {
            reap_loop(lock, cancel, reap_timeout).await;
            let _ = tx.send(());
        });
    }

    /// Release the read-hold: from this point the reap loop may drain any
    /// descendant, including ones that re-parent after the agent exits.
    pub fn start(&self) {
        self.read_guard.lock().expect("read_guard mutex poisoned").take();
    }

    /// Resolves once the reap loop has drained and exited.
    pub async fn done(&self) {
        let rx = self.done_rx.lock().expect("done_rx mutex poisoned").take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

#[cfg(target_os = "linux")]
async fn reap_loop(lock: std::sync::Arc<RwLock<()>>, cancel: CancellationToken, reap_timeout: Duration) {
    use nix::{
        errno::Errno,
        sys::wait::{waitpid, WaitPidFlag, WaitStatus},
        unistd::Pid,
    };
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigchld = match signal(SignalKind::child()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGCHLD handler, reaping disabled");
            return;
        }
    };

    fn reap_all_nonblocking() {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, status)) => {
                    debug!(pid = pid.as_raw(), status, "reaped child");
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    debug!(pid = pid.as_raw(), signal = ?sig, "reaped child");
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    async fn reap_all_blocking(lock: &std::sync::Arc<RwLock<()>>) {
        let _guard = lock.write().await;
        reap_all_nonblocking();
    }

    loop {
        tokio::select! {
            _ = sigchld.recv() => reap_all_blocking(&lock).await,
            _ = cancel.cancelled() => break,
        }
    }

    loop {
        tokio::select! {
            _ = sigchld.recv() => reap_all_blocking(&lock).await,
            _ = tokio::time::sleep(reap_timeout) => break,
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn reap_loop(_lock: std::sync::Arc<RwLock<()>>, cancel: CancellationToken, _reap_timeout: Duration) {
    warn!("PID-1 orphan reaping is not supported on this platform");
    cancel.cancelled().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enable_then_start_releases_the_read_hold() {
        let reaper = Reaper::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        reaper.enable(cancel.clone()).await;

        // While held, acquiring write should not be possible.
        assert!(reaper.lock.try_write().is_err());

        reaper.start();
        // try_write may still race the spawned task's own brief holds, but
        // it must eventually succeed once our explicit read guard is gone.
        cancel.cancel();
        reaper.done().await;
    }

    #[tokio::test]
    async fn done_resolves_after_cancellation_and_idle_timeout() {
        let reaper = Reaper::new(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        reaper.enable(cancel.clone()).await;
        reaper.start();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), reaper.done())
            .await
            .expect("reaper should drain and resolve done() promptly");
    }
}
