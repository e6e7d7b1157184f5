//! Subprocess launching, stdio teeing and process-group teardown.
//!
//! A [`Subprocess`] wraps exactly one child: it owns the decision of how the
//! child is started (env, user, process group) and guarantees that once the
//! [`CancellationToken`] it was built with fires, the whole process tree it
//! spawned is killed, not just the immediate child.

use std::{
    collections::VecDeque,
    ffi::OsString,
    os::unix::process::CommandExt as _,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, bail, Context, Result};
use nix::{
    sys::signal::{kill, Signal},
    unistd::{Pid, User},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::oneshot,
    task,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::env_prefix;

/// Number of bytes of stderr kept from the start and from the end of the
/// stream, attached to a non-zero exit error.
const STDERR_TAIL_WINDOW: usize = 160;

/// A single launched child process.
#[derive(Debug)]
pub struct Subprocess {
    argv: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    user: Option<String>,
    forward_signals: bool,
    cancel: CancellationToken,

    pid: AtomicI32,
    started: AtomicBool,
    completed: Arc<AtomicBool>,
    wait_rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl Subprocess {
    /// Construct a subprocess, without spawning it.
    ///
    /// Fails only if `argv` is empty.
    pub fn new<I, S, E, K, V>(
        argv: I,
        forward_signals: bool,
        user: Option<String>,
        env: E,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
        E: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            bail!("empty argv for subprocess");
        }
        Ok(Self {
            argv,
            env: env.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            user,
            forward_signals,
            cancel,
            pid: AtomicI32::new(0),
            started: AtomicBool::new(false),
            completed: Arc::new(AtomicBool::new(false)),
            wait_rx: Mutex::new(None),
        })
    }

    /// The PID of the launched process, valid once [`Self::start`] returns `Ok`.
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// True iff the process has been started and has not yet completed.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.completed.load(Ordering::SeqCst)
    }

    /// Spawn the child.
    pub async fn start(&self) -> Result<()> {
        self.spawn(None).await
    }

    /// Open a stdin pipe, write `bytes` to it, close it, then spawn.
    ///
    /// Used to hand the task agent its token without ever putting it on the
    /// argv or in the environment.
    pub async fn start_with_stdin(&self, bytes: Vec<u8>) -> Result<()> {
        self.spawn(Some(bytes)).await
    }

    async fn spawn(&self, stdin_payload: Option<Vec<u8>>) -> Result<()> {
        let mut cmd = self.build_command()?;
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());
        if stdin_payload.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn().context("spawn child process")?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("no process associated with child"))?;
        self.pid.store(pid as i32, Ordering::SeqCst);

        if let Some(bytes) = stdin_payload {
            let mut stdin = child.stdin.take().context("missing stdin pipe")?;
            stdin.write_all(&bytes).await.context("write token to child stdin")?;
            stdin.shutdown().await.context("close child stdin")?;
        }

        let stderr = child.stderr.take();
        self.started.store(true, Ordering::SeqCst);

        if self.forward_signals {
            spawn_signal_forwarder(pid);
        }

        let saver = Arc::new(Mutex::new(PrefixSuffixSaver::new(STDERR_TAIL_WINDOW)));
        if let Some(stderr) = stderr {
            task::spawn(tee_stderr(stderr, saver.clone()));
        }

        self.spawn_killer(pid);
        self.spawn_waiter(child, saver);

        Ok(())
    }

    /// Background task: kill the whole process group once the shared
    /// cancellation token fires. Killing an already-reaped group is a no-op.
    fn spawn_killer(&self, pid: u32) {
        let cancel = self.cancel.clone();
        let completed = self.completed.clone();
        task::spawn(async move {
            cancel.cancelled().await;
            if completed.load(Ordering::SeqCst) {
                return;
            }
            debug!(pid, "cancellation observed, killing process group");
            if let Err(e) = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!(pid, error = %e, "failed to kill process group");
                }
            }
        });
    }

    fn spawn_waiter(&self, mut child: Child, saver: Arc<Mutex<PrefixSuffixSaver>>) {
        let completed = self.completed.clone();
        let (tx, rx) = oneshot::channel();
        *self.wait_rx.lock().expect("wait_rx mutex poisoned") = Some(rx);

        task::spawn(async move {
            let result = child.wait().await;
            completed.store(true, Ordering::SeqCst);
            let outcome = match result {
                Ok(status) => finalize_status(status, &saver),
                Err(e) => Err(anyhow::Error::new(e).context("wait for child process")),
            };
            let _ = tx.send(outcome);
        });
    }

    /// Consume the final outcome of the process. Resolves exactly once.
    pub async fn wait(&self) -> Result<()> {
        let rx = self
            .wait_rx
            .lock()
            .expect("wait_rx mutex poisoned")
            .take()
            .context("wait() called before start() or more than once")?;
        rx.await.context("wait channel closed unexpectedly")?
    }

    fn build_command(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);

        cmd.env_clear();
        for (k, v) in std::env::vars_os() {
            if let Some(k) = k.to_str() {
                if k.starts_with(env_prefix()) {
                    continue;
                }
            }
            cmd.env(k, v);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        if let Some(user) = &self.user {
            apply_user(&mut cmd, user);
        }

        // New session + process group, so the whole tree can be killed via
        // `-pgid`, and die immediately if the parent (us) dies first.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        Ok(cmd)
    }
}

fn apply_user(cmd: &mut Command, username: &str) {
    match User::from_name(username) {
        Ok(Some(user)) => {
            cmd.uid(user.uid.as_raw());
            cmd.gid(user.gid.as_raw());
            cmd.env("HOME", user.dir);
        }
        Ok(None) => warn!(username, "no such user, running child as parent uid"),
        Err(e) => warn!(username, error = %e, "failed to look up user, running child as parent uid"),
    }
}

fn spawn_signal_forwarder(pid: u32) {
    use tokio::signal::unix::{signal, SignalKind};

    task::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => return warn!(error = %e, "failed to register SIGHUP handler"),
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => return warn!(error = %e, "failed to register SIGINT handler"),
        };
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => return warn!(error = %e, "failed to register SIGTERM handler"),
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => return warn!(error = %e, "failed to register SIGQUIT handler"),
        };

        loop {
            let sig = tokio::select! {
                _ = hup.recv() => Signal::SIGHUP,
                _ = int.recv() => Signal::SIGINT,
                _ = term.recv() => Signal::SIGTERM,
                _ = quit.recv() => Signal::SIGQUIT,
            };
            if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
                if e == nix::errno::Errno::ESRCH {
                    return;
                }
                warn!(pid, signal = ?sig, error = %e, "failed to forward signal");
            }
        }
    });
}

async fn tee_stderr(mut stderr: impl tokio::io::AsyncRead + Unpin, saver: Arc<Mutex<PrefixSuffixSaver>>) {
    let mut buf = [0u8; 4096];
    let mut out = tokio::io::stderr();
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        let _ = out.write_all(&buf[..n]).await;
        saver.lock().expect("stderr saver mutex poisoned").write(&buf[..n]);
    }
}

fn finalize_status(status: ExitStatus, saver: &Arc<Mutex<PrefixSuffixSaver>>) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let tail = saver.lock().expect("stderr saver mutex poisoned").bytes();
    if tail.is_empty() {
        bail!("{status}");
    }
    bail!("{status}: {}", String::from_utf8_lossy(&tail));
}

/// Keeps the first and last `n` bytes of a stream, for attaching a short
/// diagnostic tail to a non-zero exit without buffering the whole thing.
#[derive(Debug)]
struct PrefixSuffixSaver {
    n: usize,
    prefix: Vec<u8>,
    suffix: VecDeque<u8>,
    total: usize,
}

impl PrefixSuffixSaver {
    fn new(n: usize) -> Self {
        Self {
            n,
            prefix: Vec::with_capacity(n),
            suffix: VecDeque::with_capacity(n),
            total: 0,
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.total += data.len();
        if self.prefix.len() < self.n {
            let take = (self.n - self.prefix.len()).min(data.len());
            self.prefix.extend_from_slice(&data[..take]);
        }
        for &b in data {
            if self.suffix.len() == self.n {
                self.suffix.pop_front();
            }
            self.suffix.push_back(b);
        }
    }

    fn bytes(&self) -> Vec<u8> {
        if self.total <= self.n {
            return self.prefix.clone();
        }
        let mut out = self.prefix.clone();
        out.extend_from_slice(b" ... ");
        out.extend(self.suffix.iter());
        out
    }
}

/// Resolve the directory component of a whitespace-separated command path,
/// used to extend `PATH` for the task agent's children.
pub fn dir_of(path: &str) -> &Path {
    Path::new(path.split_whitespace().next().unwrap_or(path))
        .parent()
        .unwrap_or_else(|| Path::new(""))
}
