//! Command Descriptor
//!
//! Identity and completion state of one command submitted to a session.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

pub const LOG_FILE_NAME: &str = "output.log";
pub const EXIT_CODE_FILE_NAME: &str = "exit_code";
pub const INPUT_PIPE_NAME: &str = "input.pipe";
pub const STDOUT_PIPE_NAME: &str = "stdout.pipe";
pub const STDERR_PIPE_NAME: &str = "stderr.pipe";

/// Exit code recorded when a command's real status cannot be known
/// (session torn down mid-run, unreadable sentinel).
pub const FAILED_EXIT_CODE: i32 = -1;

/// Files owned by one command under `<session dir>/<command id>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPaths {
    pub dir: PathBuf,
    pub log: PathBuf,
    pub exit_code: PathBuf,
    pub input_pipe: PathBuf,
    pub stdout_pipe: PathBuf,
    pub stderr_pipe: PathBuf,
}

impl CommandPaths {
    pub fn new(session_dir: &Path, command_id: &str) -> Self {
        let dir = session_dir.join(command_id);
        Self {
            log: dir.join(LOG_FILE_NAME),
            exit_code: dir.join(EXIT_CODE_FILE_NAME),
            input_pipe: dir.join(INPUT_PIPE_NAME),
            stdout_pipe: dir.join(STDOUT_PIPE_NAME),
            stderr_pipe: dir.join(STDERR_PIPE_NAME),
            dir,
        }
    }
}

/// A command executed inside a session.
///
/// `exit_code` is written at most once; readers racing with the writer see
/// either nothing or the final value.
#[derive(Debug)]
pub struct SessionCommand {
    pub id: String,
    pub command: String,
    pub suppress_input_echo: bool,
    pub created_at: DateTime<Utc>,
    paths: CommandPaths,
    exit_code: OnceLock<i32>,
}

impl SessionCommand {
    pub fn new(session_dir: &Path, command: impl Into<String>, suppress_input_echo: bool) -> Self {
        let id = Uuid::new_v4().to_string();
        let paths = CommandPaths::new(session_dir, &id);
        Self {
            id,
            command: command.into(),
            suppress_input_echo,
            created_at: Utc::now(),
            paths,
            exit_code: OnceLock::new(),
        }
    }

    pub fn paths(&self) -> &CommandPaths {
        &self.paths
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code.get().is_some()
    }

    /// Record the exit code. Returns the value that ends up stored, which is
    /// the earlier one if the code had already been set.
    pub fn set_exit_code(&self, code: i32) -> i32 {
        *self.exit_code.get_or_init(|| code)
    }
}
