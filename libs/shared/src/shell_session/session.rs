//! Session and Session Errors
//!
//! A session is one long-lived shell process reading scripts from its stdin,
//! plus the commands that have been submitted to it.

use super::command::SessionCommand;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur during shell session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Command {command_id} not found in session {session_id}")]
    CommandNotFound {
        session_id: String,
        command_id: String,
    },

    #[error("Session {0} already exists")]
    AlreadyExists(String),

    #[error("Maximum session limit ({0}) reached. Delete unused sessions first.")]
    LimitReached(usize),

    #[error("Invalid session id '{0}': must be a non-empty single path component")]
    InvalidId(String),

    #[error("Session {0} has terminated")]
    SessionGone(String),

    #[error("Command {command_id} already completed with exit code {exit_code}")]
    CommandCompleted { command_id: String, exit_code: i32 },

    #[error("Command {0} is not reading input")]
    InputClosed(String),

    #[error("Session {session_id} was terminated while command was running (exit code {exit_code})")]
    SessionCancelled { session_id: String, exit_code: i32 },

    #[error("Command {command_id} still running after {timeout:?}")]
    Timeout {
        command_id: String,
        timeout: Duration,
    },

    #[error("Failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Caller-facing classification of a [`SessionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Gone,
    BadRequest,
    Forbidden,
    Timeout,
    Internal,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) | SessionError::CommandNotFound { .. } => {
                ErrorKind::NotFound
            }
            SessionError::AlreadyExists(_)
            | SessionError::LimitReached(_)
            | SessionError::SessionCancelled { .. } => ErrorKind::Conflict,
            SessionError::SessionGone(_)
            | SessionError::CommandCompleted { .. }
            | SessionError::InputClosed(_) => ErrorKind::Gone,
            SessionError::InvalidId(_) | SessionError::BadRequest(_) => ErrorKind::BadRequest,
            SessionError::Forbidden(_) => ErrorKind::Forbidden,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::SpawnFailed(_) | SessionError::IoError(_) => ErrorKind::Internal,
        }
    }
}

/// A persistent shell session
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    dir: PathBuf,
    shell: String,
    pid: Option<u32>,
    input: Mutex<Option<ChildStdin>>,
    commands: RwLock<HashMap<String, Arc<SessionCommand>>>,
    cancel: CancellationToken,
    exit_status: Arc<OnceLock<Option<i32>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the shell for a new session.
    ///
    /// The shell becomes the leader of its own process group and inherits the
    /// daemon's environment. Its stdout and stderr are discarded; command
    /// output only ever reaches the per-command log files.
    pub(crate) async fn spawn(
        id: &str,
        dir: PathBuf,
        shell: &str,
        cwd: &Path,
    ) -> Result<Arc<Self>, SessionError> {
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SessionError::BadRequest(format!(
                "Failed to create session directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut cmd = Command::new(shell);
        cmd.current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SessionError::SpawnFailed(format!("{}: stdin was not captured", shell))
        })?;

        let session = Arc::new(Self {
            id: id.to_string(),
            created_at: Utc::now(),
            dir,
            shell: shell.to_string(),
            pid: child.id(),
            input: Mutex::new(Some(stdin)),
            commands: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            exit_status: Arc::new(OnceLock::new()),
        });

        // The exit watcher owns the child; it only reaps and reports.
        let cancel = session.cancel.clone();
        let exit_status = session.exit_status.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to wait for session shell");
                    None
                }
            };
            let _ = exit_status.set(code);
            if !cancel.is_cancelled() {
                info!(session_id = %session_id, exit_code = ?code, "Session shell exited");
            }
            cancel.cancel();
        });

        debug!(session_id = %id, shell = %shell, cwd = %cwd.display(), pid = ?session.pid, "Spawned session shell");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Token cancelled when the session is deleted or its shell exits
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `Some` once the shell process has exited; the inner value is its exit
    /// code, absent when it was killed by a signal
    pub fn exit_status(&self) -> Option<Option<i32>> {
        self.exit_status.get().copied()
    }

    /// Write raw bytes to the shell's stdin.
    ///
    /// Holds the input lock for the whole write, so concurrent scripts are
    /// never interleaved.
    pub(crate) async fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.input.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(SessionError::SessionGone(self.id.clone()));
        };

        let result = match stdin.write_all(data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(session_id = %self.id, error = %e, "Session shell stopped reading input");
            *guard = None;
            return Err(SessionError::SessionGone(self.id.clone()));
        }
        Ok(())
    }

    /// Drop the shell's stdin so no further scripts can be queued
    pub(crate) async fn close_input(&self) {
        self.input.lock().await.take();
    }

    pub(crate) async fn add_command(&self, command: Arc<SessionCommand>) {
        self.commands
            .write()
            .await
            .insert(command.id.clone(), command);
    }

    pub async fn command(&self, command_id: &str) -> Option<Arc<SessionCommand>> {
        self.commands.read().await.get(command_id).cloned()
    }

    /// All commands, oldest first
    pub async fn commands(&self) -> Vec<Arc<SessionCommand>> {
        let mut commands: Vec<_> = self.commands.read().await.values().cloned().collect();
        commands.sort_by_key(|c| c.created_at);
        commands
    }
}
