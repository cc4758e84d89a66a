//! Shell Session Registry
//!
//! Central registry for creating, tracking, and destroying persistent shell sessions.

use super::process::terminate_process_group;
use super::session::{Session, SessionError};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for shell sessions
#[derive(Debug, Clone)]
pub struct ShellSessionConfig {
    /// Root under which every session gets its own directory
    pub sessions_dir: PathBuf,

    /// Shell binary spawned for each session
    pub shell: String,

    /// Working directory for new sessions (daemon cwd if None)
    pub work_dir: Option<PathBuf>,

    /// Maximum concurrent sessions (0 = unlimited)
    pub max_sessions: usize,

    /// How often a waiting caller checks for the exit-code sentinel
    pub poll_interval: Duration,

    /// Time between SIGTERM and SIGKILL when deleting a session
    pub terminate_grace_period: Duration,

    /// How often the process group is checked during the grace period
    pub terminate_poll_interval: Duration,
}

impl Default for ShellSessionConfig {
    fn default() -> Self {
        Self {
            sessions_dir: std::env::temp_dir().join("sandboxd").join("sessions"),
            shell: "/bin/sh".to_string(),
            work_dir: None,
            max_sessions: 0,
            poll_interval: Duration::from_millis(50),
            terminate_grace_period: Duration::from_secs(5),
            terminate_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Per-request options for [`SessionRegistry::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Start in the daemon's own working directory instead of the configured one
    pub legacy_working_dir: bool,
}

/// Central registry for shell sessions
///
/// Thread-safe; share it behind an `Arc`.
pub struct SessionRegistry {
    /// Active sessions indexed by session ID
    sessions: RwLock<HashMap<String, Arc<Session>>>,

    /// Configuration
    pub(crate) config: ShellSessionConfig,
}

/// A session id becomes a directory name, so it must be exactly one normal path component
fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let mut components = Path::new(session_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == session_id => Ok(()),
        _ => Err(SessionError::InvalidId(session_id.to_string())),
    }
}

impl SessionRegistry {
    /// Create a new registry with the given configuration
    pub fn new(config: ShellSessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &ShellSessionConfig {
        &self.config
    }

    /// Get the number of active sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn resolve_cwd(&self, options: &CreateSessionOptions) -> Result<PathBuf, SessionError> {
        if !options.legacy_working_dir
            && let Some(work_dir) = &self.config.work_dir
        {
            return Ok(work_dir.clone());
        }
        std::env::current_dir().map_err(SessionError::IoError)
    }

    /// Create and register a session under `session_id`.
    ///
    /// The write lock is held from the existence check until the insert, so
    /// two concurrent creates for the same id cannot both succeed.
    pub async fn create(
        &self,
        session_id: &str,
        options: CreateSessionOptions,
    ) -> Result<Arc<Session>, SessionError> {
        validate_session_id(session_id)?;
        let cwd = self.resolve_cwd(&options)?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }
        if self.config.max_sessions > 0 && sessions.len() >= self.config.max_sessions {
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }

        let dir = self.config.sessions_dir.join(session_id);
        let session = Session::spawn(session_id, dir, &self.config.shell, &cwd).await?;
        sessions.insert(session_id.to_string(), session.clone());

        info!(session_id = %session_id, cwd = %cwd.display(), "Created shell session");
        Ok(session)
    }

    /// Get a session by ID
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub(crate) async fn require(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// All sessions, oldest first
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at());
        sessions
    }

    /// Tear a session down and forget it.
    ///
    /// Cancellation happens first so waiters and log followers are released
    /// before the process group is signalled. Termination failures are only
    /// logged; a failure to remove the session directory is returned after
    /// the entry has been removed.
    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.require(session_id).await?;

        session.cancel();
        session.close_input().await;

        if let Some(pid) = session.pid() {
            match terminate_process_group(
                pid as i32,
                self.config.terminate_grace_period,
                self.config.terminate_poll_interval,
            )
            .await
            {
                Ok(outcome) => {
                    debug!(session_id = %session_id, pgid = pid, outcome = ?outcome, "Terminated session process group")
                }
                Err(e) => {
                    warn!(session_id = %session_id, pgid = pid, error = %e, "Failed to terminate session process group")
                }
            }
        }

        let removal = match tokio::fs::remove_dir_all(session.dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                sessions.remove(session_id);
            }
        }

        if let Err(e) = removal {
            warn!(session_id = %session_id, dir = %session.dir().display(), error = %e, "Failed to remove session directory");
            return Err(SessionError::IoError(e));
        }

        info!(session_id = %session_id, "Deleted shell session");
        Ok(())
    }

    /// Delete every session
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        for session_id in session_ids {
            if let Err(e) = self.delete(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Failed to delete session during shutdown");
            }
        }

        info!("Deleted all shell sessions");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        // Shells are only signalled by delete()/shutdown(); call shutdown() first.
        debug!("SessionRegistry dropped");
    }
}
