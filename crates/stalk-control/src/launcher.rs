//! Starts and stops the tracker daemon on behalf of the control surface.

use stalk_core::prefs::{PrefError, PrefKey, PrefStore};
use stalk_core::tracker_ipc::{TrackerReply, TrackerRequest};
use stalk_core::SamplingInterval;
use stalk_tracker::{control, ControlError, TRACKER_BIN};
use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const STATE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("a tracking session is already running")]
    AlreadyRunning,
    #[error("no tracking session is running")]
    NotRunning,
    #[error("enter a name before starting")]
    EmptyIdentity,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] PrefError),
    #[error("stop signal failed: {0}")]
    Control(#[from] ControlError),
    #[error("tracker refused: {0}")]
    Rejected(String),
    #[error("tracker exited before it started tracking ({status})")]
    ExitedEarly { status: String },
    #[error("tracker did not start within {0:?}")]
    StartTimeout(Duration),
    #[error("tracker did not stop within {0:?}")]
    StopTimeout(Duration),
}

#[derive(Clone)]
pub struct Launcher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    source: String,
    socket_path: PathBuf,
    store: Arc<dyn PrefStore>,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl Launcher {
    pub fn new(
        program: impl Into<PathBuf>,
        socket_path: impl Into<PathBuf>,
        store: Arc<dyn PrefStore>,
    ) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            source: "-".to_string(),
            socket_path: socket_path.into(),
            store,
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Persists the cadence for the next session; an active one keeps its interval.
    pub fn set_frequency(&self, interval: SamplingInterval) -> Result<(), PrefError> {
        self.store.set_string(PrefKey::StalkFrequency, interval.as_str())
    }

    /// Spawns a detached daemon and waits until it has set the running flag.
    ///
    /// A daemon that exits first, or stays silent past the start timeout, is an error.
    pub async fn start(&self) -> Result<u32, LaunchError> {
        if self.store.identity()?.is_empty() {
            return Err(LaunchError::EmptyIdentity);
        }
        if self.store.is_running()? {
            if control::probe(&self.socket_path, PROBE_TIMEOUT).await.is_some() {
                return Err(LaunchError::AlreadyRunning);
            }
            warn!(
                event = "launcher_stale_running_flag",
                socket = %self.socket_path.display()
            );
            self.store.set_bool(PrefKey::ServiceRunning, false)?;
        }

        let mut command = Command::new(&self.program);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg("--source")
            .arg(&self.source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(event = "launcher_spawned", pid, program = %self.program.display());

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            tokio::select! {
                exited = child.wait() => {
                    let status = match exited {
                        Ok(status) => status.to_string(),
                        Err(err) => err.to_string(),
                    };
                    warn!(event = "launcher_tracker_exited_early", pid, status = %status);
                    return Err(LaunchError::ExitedEarly { status });
                }
                _ = tokio::time::sleep(STATE_POLL) => {}
            }
            if self.store.is_running()? {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(event = "launcher_start_timeout", pid);
                let _ = child.start_kill();
                return Err(LaunchError::StartTimeout(self.start_timeout));
            }
        }
        info!(event = "launcher_started", pid);

        // Reap the child so its eventual exit is logged instead of lingering.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(event = "launcher_tracker_exited", pid, status = %status),
                Err(err) => warn!(event = "launcher_wait_error", pid, error = %err),
            }
        });
        Ok(pid)
    }

    /// Sends the stop signal and waits until the daemon has cleared the running flag.
    pub async fn stop(&self) -> Result<(), LaunchError> {
        let reply = match control::send_request(
            &self.socket_path,
            &TrackerRequest::Stop,
            PROBE_TIMEOUT,
        )
        .await
        {
            Ok(reply) => reply,
            Err(ControlError::Io(err)) => {
                if !self.store.is_running()? {
                    return Err(LaunchError::NotRunning);
                }
                // Flag left behind by a daemon that died without cleaning up.
                warn!(event = "launcher_stale_running_flag", error = %err);
                self.store.set_bool(PrefKey::ServiceRunning, false)?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match reply {
            TrackerReply::Stopping => {}
            TrackerReply::Error { message } => return Err(LaunchError::Rejected(message)),
            TrackerReply::Status(_) => {
                return Err(LaunchError::Rejected("unexpected status reply".to_string()))
            }
        }

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while self.store.is_running()? {
            if tokio::time::Instant::now() >= deadline {
                return Err(LaunchError::StopTimeout(self.stop_timeout));
            }
            tokio::time::sleep(STATE_POLL).await;
        }
        info!(event = "launcher_stopped");
        Ok(())
    }
}

/// The daemon binary next to the running executable, else whatever `PATH` resolves.
pub fn default_tracker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(TRACKER_BIN)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(TRACKER_BIN))
}
