//! Task configuration: the JSON blob injected via `CIRCLECI_GOAT_CONFIG`,
//! the derived task-agent invocation, and the `clap` CLI surface around it.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

/// Prefix identifying every environment variable that carries
/// orchestrator-internal state. Stripped from every child's environment.
pub const ENV_PREFIX: &str = "CIRCLECI_GOAT";

/// Name of the environment variable carrying the task configuration JSON.
pub const CONFIG_ENV_VAR: &str = "CIRCLECI_GOAT_CONFIG";

pub fn env_prefix() -> &'static str {
    ENV_PREFIX
}

/// Task configuration, parsed once from [`CONFIG_ENV_VAR`] and read-only
/// for the remainder of the process.
#[derive(Clone, Deserialize)]
pub struct TaskConfig {
    /// Custom entrypoint argv, run in the background before the agent.
    #[serde(default)]
    pub cmd: Vec<String>,

    /// POSIX user to drop to for child processes.
    #[serde(default)]
    pub user: Option<String>,

    /// If true, treat any post-start failure as retryable.
    #[serde(default)]
    pub enable_unsafe_retries: bool,

    /// Opaque secret, written to the agent's stdin and never logged.
    pub token: String,

    /// Identifier required for `unclaim_task`.
    #[serde(default)]
    pub task_id: String,

    /// Whitespace-separated path+flags forming the argv prefix for the agent.
    pub task_agent_path: String,

    pub runner_api_base_url: String,
    pub allocation: String,

    #[serde(default)]
    pub ssh_advertise_addr: String,

    #[serde(with = "humantime_serde")]
    pub max_run_time: Duration,

    /// If set, the orchestrator blocks on this path before launching the agent.
    #[serde(default)]
    pub readiness_file_path: Option<String>,
}

impl std::fmt::Display for TaskConfig {
    /// Deliberately omits `token`: this is what ends up in log lines.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TaskConfig {{ task_id: {:?}, task_agent_path: {:?}, allocation: {:?}, \
             runner_api_base_url: {:?}, max_run_time: {:?}, readiness_file_path: {:?}, \
             cmd: {:?}, user: {:?}, enable_unsafe_retries: {} }}",
            self.task_id,
            self.task_agent_path,
            self.allocation,
            self.runner_api_base_url,
            self.max_run_time,
            self.readiness_file_path,
            self.cmd,
            self.user,
            self.enable_unsafe_retries,
        )
    }
}

impl std::fmt::Debug for TaskConfig {
    /// Hand-written so `token` can never leak through a stray `{:?}` the way
    /// a derived impl would; every other field is rendered as normal.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskConfig")
            .field("cmd", &self.cmd)
            .field("user", &self.user)
            .field("enable_unsafe_retries", &self.enable_unsafe_retries)
            .field("token", &"[redacted]")
            .field("task_id", &self.task_id)
            .field("task_agent_path", &self.task_agent_path)
            .field("runner_api_base_url", &self.runner_api_base_url)
            .field("allocation", &self.allocation)
            .field("ssh_advertise_addr", &self.ssh_advertise_addr)
            .field("max_run_time", &self.max_run_time)
            .field("readiness_file_path", &self.readiness_file_path)
            .finish()
    }
}

impl TaskConfig {
    /// Read and parse [`CONFIG_ENV_VAR`], then unset it so children never
    /// inherit it.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CONFIG_ENV_VAR)
            .with_context(|| format!("read {CONFIG_ENV_VAR} environment variable"))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse {CONFIG_ENV_VAR} as JSON"))?;
        std::env::remove_var(CONFIG_ENV_VAR);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.task_agent_path.trim().is_empty() {
            bail!("task_agent_path must not be empty");
        }
        if self.token.is_empty() {
            bail!("token must not be empty");
        }
        Ok(())
    }

    /// The pure derivation of the task-agent's argv, split out so it can be
    /// unit tested without touching the filesystem. Idempotent: calling this
    /// twice on the same config yields byte-identical output.
    pub fn agent_argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = self.task_agent_path.split_whitespace().map(str::to_owned).collect();
        argv.push("_internal".into());
        argv.push("agent-runner".into());
        argv.push("--verbose".into());
        argv.push(format!("--runnerAPIBaseURL={}", self.runner_api_base_url));
        argv.push(format!("--allocation={}", self.allocation));
        argv.push("--disableSpinUpStep".into());
        argv.push("--disableIsolatedSSHDir".into());
        argv.push(format!("--maxRunTime={}", render_go_duration(self.max_run_time)));
        if !self.ssh_advertise_addr.is_empty() {
            argv.push(format!("--sshAdvertiseAddr={}", self.ssh_advertise_addr));
        }
        argv
    }

    /// The env overlay applied on top of the stripped parent environment for
    /// the agent: extends `PATH` with the directory of `task_agent_path`.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        let dir = crate::subprocess::dir_of(&self.task_agent_path);
        let path = std::env::var("PATH").unwrap_or_default();
        let joined = if dir.as_os_str().is_empty() {
            path
        } else {
            format!("{path}:{}", dir.display())
        };
        vec![("PATH".to_owned(), joined)]
    }
}

/// Render a [`Duration`] the way Go's `time.Duration.String()` does:
/// `1h0m0s`, `1m30s`, `500ms`, never losing precision to coarser units.
pub fn render_go_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_owned();
    }
    let total_nanos = d.as_nanos();
    if total_nanos < 1_000_000 {
        return format!("{}ns", total_nanos);
    }
    if total_nanos < 1_000_000_000 {
        let micros = total_nanos / 1_000;
        if total_nanos % 1_000_000 == 0 {
            return format!("{}ms", total_nanos / 1_000_000);
        }
        return format!("{}µs", micros);
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let subsec_nanos = d.subsec_nanos();

    let secs_str = if subsec_nanos == 0 {
        format!("{secs}s")
    } else {
        let base = format!("{secs}.{subsec_nanos:09}s");
        let trimmed = base.trim_end_matches('0');
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
        format!("{trimmed}s")
    };

    if hours > 0 {
        format!("{hours}h{minutes}m{secs_str}")
    } else if minutes > 0 {
        format!("{minutes}m{secs_str}")
    } else {
        secs_str
    }
}

/// Logging driver selection, mirrored in `--log-driver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
#[value(rename_all = "lowercase")]
pub enum LogDriver {
    #[default]
    Stdout,
    Journald,
}

/// Top-level CLI surface.
#[derive(Debug, Parser)]
#[command(name = "orchestrator", about = "Container-side CI task orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Fixed delay applied by the wrapping lifecycle system before returning.
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub shutdown_delay: Option<Duration>,

    /// Max wait for the agent to finish after parent cancellation.
    #[arg(long, global = true, default_value = "10s", value_parser = humantime::parse_duration)]
    pub termination_grace_period: Duration,

    /// Bind address for the health HTTP endpoint.
    #[arg(long, global = true, default_value = ":7623")]
    pub health_check_addr: String,

    /// Logging verbosity.
    #[arg(long, global = true, default_value = "info", env = "CIRCLECI_GOAT_LOG_LEVEL")]
    pub log_level: String,

    /// Logging driver.
    #[arg(long, global = true, value_enum, default_value_t = LogDriver::Stdout)]
    pub log_driver: LogDriver,

    /// Optional directory of extra root CA certificates for the Runner-API client.
    #[arg(long, global = true)]
    pub ca_bundle_dir: Option<String>,

    /// Print verbose version information including the dependency tree.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy the orchestrator and task-agent binaries into a shared volume.
    Init { src: String, dst: String },
    /// Re-exec a given entrypoint ahead of `run-task`.
    Override {
        #[arg(long)]
        entrypoint: String,
    },
    /// Run the task orchestrator.
    RunTask,
    /// Print version information.
    Version,
}
