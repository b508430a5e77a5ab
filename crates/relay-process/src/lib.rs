// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subprocess supervision.
//!
//! Spawns the coding subprocess with piped stdio and owns its exit policy:
//! while the bridge is running, an unexpected exit is reported to the caller
//! (who rebuilds the transport and resumes); during shutdown the
//! `is_shutting_down` flag suppresses that restart policy and teardown
//! escalates graceful → SIGTERM → SIGKILL on a fixed cadence, with a hard
//! exit watchdog in case teardown itself hangs.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("subprocess has no stdio handles")]
    MissingStdio,
}

/// How to launch and restart the subprocess.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Pause before respawning after an unexpected exit.
    pub restart_backoff: Duration,
    /// Wait at each escalation step (graceful, SIGTERM, SIGKILL).
    pub escalation_step: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            working_dir: None,
            restart_backoff: Duration::from_secs(5),
            escalation_step: Duration::from_secs(2),
        }
    }
}

/// A running subprocess with its stdio split out for the transport.
///
/// `stdin`/`stdout` are `Option` so the transport can take them while the
/// supervisor keeps the child for signal escalation.
pub struct SpawnedAgent {
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub pid: u32,
}

impl SpawnedAgent {
    /// Hand the stdio pair to the transport layer.
    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout), ProcessError> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
            _ => Err(ProcessError::MissingStdio),
        }
    }
}

/// Owns spawn/shutdown policy for the coding subprocess.
pub struct Supervisor {
    config: SupervisorConfig,
    is_shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Once set, the caller's restart loop must stop respawning.
    pub fn begin_shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Pause between restart attempts.
    pub async fn backoff(&self) {
        tokio::time::sleep(self.config.restart_backoff).await;
    }

    /// Spawn the subprocess with piped stdio; stderr is drained into logs.
    pub fn spawn(&self) -> Result<SpawnedAgent, ProcessError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ProcessError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingStdio)?;
        let pid = child.id().unwrap_or_default();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "subprocess", "{line}");
                }
            });
        }

        info!(command = %self.config.command, pid, "subprocess started");
        Ok(SpawnedAgent {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            pid,
        })
    }

    /// Escalating teardown: wait for a graceful exit (the caller has
    /// already closed stdin), then SIGTERM, then SIGKILL.
    pub async fn shutdown(&self, agent: &mut SpawnedAgent) {
        let step = self.config.escalation_step;
        let pid = agent.pid as i32;

        if wait_with_timeout(&mut agent.child, step).await {
            info!(pid, "subprocess exited gracefully");
            return;
        }

        warn!(pid, "subprocess still running, sending SIGTERM");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        if wait_with_timeout(&mut agent.child, step).await {
            info!(pid, "subprocess exited on SIGTERM");
            return;
        }

        error!(pid, "subprocess ignored SIGTERM, sending SIGKILL");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        if !wait_with_timeout(&mut agent.child, step).await {
            error!(pid, "subprocess survived SIGKILL; abandoning it");
        }
    }
}

async fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, child.wait()).await,
        Ok(Ok(_))
    )
}

/// Hard-exit watchdog for shutdown: if graceful teardown hangs past the
/// deadline, the whole process exits.  Abort the returned handle once
/// teardown finished cleanly.
pub fn spawn_exit_watchdog(deadline: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        error!("shutdown watchdog fired, hard-exiting");
        std::process::exit(1);
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
