//! The core state machine: compose the subprocess wrapper, reaper,
//! readiness waiter and Runner-API client into one task run.
//!
//! ```text
//! INIT -> REAPER_ENABLED -> (ENTRYPOINT_STARTED?) -> READY
//!   -> (AWAIT_READINESS?) -> AGENT_STARTING
//!   -> AGENT_RUNNING -> {AGENT_EXITED_OK | AGENT_EXITED_ERR | PARENT_CANCELLED_GRACE}
//!   -> CLASSIFY -> REPORT -> DRAIN -> DONE
//! ```

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::TaskConfig,
    error,
    reaper::Reaper,
    readiness,
    runner_api::{RunnerApiClient, RunnerApiError},
    subprocess::Subprocess,
};

pub struct Orchestrator {
    config: TaskConfig,
    reaper: Reaper,
    runner_api: RunnerApiClient,
    grace_period: Duration,
    ready: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: TaskConfig, runner_api: RunnerApiClient, grace_period: Duration) -> Self {
        Self {
            config,
            reaper: Reaper::default(),
            runner_api,
            grace_period,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared readiness flag, for the health endpoint to observe.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Run the task to completion. `parent_shutdown` is cancelled by the
    /// caller on SIGTERM/SIGINT; its own cancellation is observable only via
    /// the grace-period branch, never propagated synchronously into the
    /// agent.
    pub async fn run(&self, parent_shutdown: CancellationToken) -> Result<()> {
        let cancel_task = CancellationToken::new();
        self.reaper.enable(cancel_task.clone()).await;

        let outcome = self.run_until_classify(&cancel_task, &parent_shutdown).await;

        let report_result = match outcome {
            Ok(()) => Ok(()),
            Err(err) => self.report(err).await,
        };

        cancel_task.cancel();
        self.reaper.done().await;

        report_result
    }

    async fn run_until_classify(
        &self,
        cancel_task: &CancellationToken,
        parent_shutdown: &CancellationToken,
    ) -> Result<()> {
        if !self.config.cmd.is_empty() {
            let entrypoint = Subprocess::new(
                self.config.cmd.clone(),
                true,
                None,
                Vec::<(String, String)>::new(),
                cancel_task.clone(),
            )
            .context("construct entrypoint subprocess")?;
            entrypoint.start().await.context("start entrypoint")?;
            info!(pid = entrypoint.pid(), "entrypoint started");
        }

        self.ready.store(true, std::sync::atomic::Ordering::SeqCst);
        info!("orchestrator ready");

        if let Some(path) = &self.config.readiness_file_path {
            readiness::wait_for_file(path, cancel_task)
                .await
                .context("wait for readiness file")?;
        }

        let argv = self.config.agent_argv();
        let env = self.config.agent_env();
        let agent = Subprocess::new(argv, true, self.config.user.clone(), env, cancel_task.clone())
            .context("construct task agent subprocess")?;

        self.execute_agent(&agent, parent_shutdown)
            .await
            .context("error while executing task agent")
    }

    /// Start the agent and drive it to completion (or to the interrupted
    /// outcome on parent-cancellation-plus-grace-period). Every error
    /// returned from here is wrapped by the caller with a single
    /// `"error while executing task agent"` context, matching the source
    /// system's `executeAgent` wrapper.
    async fn execute_agent(&self, agent: &Subprocess, parent_shutdown: &CancellationToken) -> Result<()> {
        agent
            .start_with_stdin(self.config.token.clone().into_bytes())
            .await
            .map_err(error::retryable)
            .context("failed to start task agent command")?;
        info!(pid = agent.pid(), "task agent started");

        let agent_result = tokio::select! {
            result = agent.wait() => Some(result),
            _ = parent_shutdown.cancelled() => {
                warn!("parent cancelled, waiting out the termination grace period");
                tokio::select! {
                    result = agent.wait() => Some(result),
                    _ = tokio::time::sleep(self.grace_period) => None,
                }
            }
        };

        self.reaper.start();

        match agent_result {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(e),
            None if agent.is_running() => Err(error::interrupted()),
            None => Ok(()),
        }
    }

    async fn report(&self, original_err: anyhow::Error) -> Result<()> {
        let retryable = error::is_retryable(&original_err) || self.config.enable_unsafe_retries;
        let mut message_err = original_err;

        if retryable {
            match self
                .runner_api
                .unclaim_task(&self.config.task_id, &self.config.token)
                .await
            {
                Ok(()) => {
                    warn!(error = %message_err, "task unclaimed after retryable failure");
                    return Ok(());
                }
                Err(RunnerApiError::ExhaustedRetries) => {
                    warn!("unclaim exhausted all task retries, falling through to fail");
                }
                Err(e) => {
                    message_err = error::join(message_err, anyhow::Error::new(e).context("unclaim task"));
                }
            }
        }

        let message = format!("{message_err:#}: Check container logs for more details");
        match self.runner_api.fail_task(&self.config.allocation, &message).await {
            Ok(()) => {
                warn!(error = %message_err, "task failed and reported");
                Ok(())
            }
            Err(fail_err) => Err(error::join(
                message_err,
                anyhow::Error::new(fail_err).context("fail task"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;
    use std::time::Duration as StdDuration;

    fn config(task_agent_path: &str) -> TaskConfig {
        TaskConfig {
            cmd: vec![],
            user: None,
            enable_unsafe_retries: false,
            token: "t".into(),
            task_id: "task-id".into(),
            task_agent_path: task_agent_path.into(),
            runner_api_base_url: "https://example.test".into(),
            allocation: "alloc".into(),
            ssh_advertise_addr: String::new(),
            max_run_time: StdDuration::from_secs(60),
            readiness_file_path: None,
        }
    }

    // S1: happy path, no unclaim/fail calls expected.
    #[tokio::test]
    async fn happy_path_reports_nothing() {
        let server = MockServer::start();
        let unclaim = server.mock(|when, _then| {
            when.path("/api/v3/runner/unclaim");
        });
        let fail = server.mock(|when, _then| {
            when.path("/api/v2/task/event/fail");
        });

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let orchestrator = Orchestrator::new(config("/bin/true"), runner_api, StdDuration::from_millis(50));

        orchestrator.run(CancellationToken::new()).await.unwrap();
        assert!(orchestrator.ready.load(std::sync::atomic::Ordering::SeqCst));
        unclaim.assert_hits(0);
        fail.assert_hits(0);
    }

    // S6: retryable start failure, one unclaim POST, no fail POST.
    #[tokio::test]
    async fn retryable_start_failure_calls_unclaim_only() {
        let server = MockServer::start();
        let unclaim = server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/api/v3/runner/unclaim");
            then.status(200);
        });
        let fail = server.mock(|when, _then| {
            when.path("/api/v2/task/event/fail");
        });

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let orchestrator = Orchestrator::new(
            config("thiswontstart"),
            runner_api,
            StdDuration::from_millis(50),
        );

        orchestrator.run(CancellationToken::new()).await.unwrap();
        unclaim.assert_hits(1);
        fail.assert_hits(0);
    }

    // S7: exhausted retries, one unclaim then one fail, whose message begins
    // with the expected prefix.
    #[tokio::test]
    async fn exhausted_retries_falls_through_to_fail() {
        let server = MockServer::start();
        let unclaim = server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/api/v3/runner/unclaim");
            then.status(409);
        });
        let fail = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/v2/task/event/fail")
                .matches(|req| {
                    let body = req.body.as_deref().unwrap_or_default();
                    let body = String::from_utf8_lossy(body);
                    body.contains("error while executing task agent: failed to start task agent command")
                });
            then.status(200);
        });

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let orchestrator = Orchestrator::new(
            config("thiswontstart"),
            runner_api,
            StdDuration::from_millis(50),
        );

        orchestrator.run(CancellationToken::new()).await.unwrap();
        unclaim.assert_hits(1);
        fail.assert_hits(1);
    }

    // S5: agent exits non-zero, message contains exit status and stderr.
    #[tokio::test]
    async fn agent_non_zero_exit_reports_stderr_tail() {
        let server = MockServer::start();
        let fail = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/v2/task/event/fail")
                .matches(|req| {
                    let body = req.body.as_deref().unwrap_or_default();
                    let body = String::from_utf8_lossy(body);
                    body.contains("exit status") && body.contains("fatal")
                });
            then.status(200);
        });

        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(script.path(), "echo fatal!!! 1>&2\nexit 1\n").unwrap();

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let mut cfg = config(&format!("/bin/sh {}", script.path().display()));
        cfg.enable_unsafe_retries = false;
        let orchestrator = Orchestrator::new(cfg, runner_api, StdDuration::from_millis(50));

        orchestrator.run(CancellationToken::new()).await.unwrap();
        fail.assert_hits(1);
    }

    // S4: interrupted task, fail message mentions the agent still running.
    #[tokio::test]
    async fn interrupted_task_reports_still_running() {
        let server = MockServer::start();
        let fail = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/v2/task/event/fail")
                .matches(|req| {
                    let body = req.body.as_deref().unwrap_or_default();
                    let body = String::from_utf8_lossy(body);
                    body.contains("task agent process is still running")
                });
            then.status(200);
        });
        let unclaim = server.mock(|when, _then| {
            when.path("/api/v3/runner/unclaim");
        });

        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(script.path(), "sleep 30\n").unwrap();

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let cfg = config(&format!("/bin/sh {}", script.path().display()));
        let orchestrator = Orchestrator::new(cfg, runner_api, StdDuration::from_millis(10));

        let parent_shutdown = CancellationToken::new();
        let shutdown_trigger = parent_shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            shutdown_trigger.cancel();
        });

        orchestrator.run(parent_shutdown).await.unwrap();
        unclaim.assert_hits(0);
        fail.assert_hits(1);
    }

    // S2: custom entrypoint runs in the background before the agent; its
    // side effect (the marker file) is observable once Run returns.
    #[tokio::test]
    async fn custom_entrypoint_runs_before_agent_completes() {
        let server = MockServer::start();
        let fail = server.mock(|when, _then| {
            when.path("/api/v2/task/event/fail");
        });

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");

        let mut cfg = config("/bin/true");
        cfg.cmd = vec!["/bin/sh".into(), "-c".into(), format!("touch {}", marker.display())];

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let orchestrator = Orchestrator::new(cfg, runner_api, StdDuration::from_millis(50));

        orchestrator.run(CancellationToken::new()).await.unwrap();
        assert!(marker.exists());
        fail.assert_hits(0);
    }

    // S3: the agent is not started until the readiness file appears, whether
    // it is written before or after the wait begins.
    #[tokio::test]
    async fn agent_waits_for_readiness_file() {
        let server = MockServer::start();
        let fail = server.mock(|when, _then| {
            when.path("/api/v2/task/event/fail");
        });

        let dir = tempfile::tempdir().unwrap();
        let ready_path = dir.path().join("ready");

        let mut cfg = config("/bin/true");
        cfg.readiness_file_path = Some(ready_path.to_str().unwrap().to_owned());

        let runner_api = RunnerApiClient::new(server.base_url(), "t".into(), vec![]).unwrap();
        let orchestrator = Orchestrator::new(cfg, runner_api, StdDuration::from_millis(50));

        let writer_path = ready_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(250)).await;
            std::fs::write(&writer_path, b"").unwrap();
        });

        tokio::time::timeout(StdDuration::from_secs(2), orchestrator.run(CancellationToken::new()))
            .await
            .expect("run should complete within 2s of the readiness file appearing")
            .unwrap();
        fail.assert_hits(0);
    }
}
