//! Command Execution
//!
//! Submits commands to a session shell, waits for their exit-code sentinel,
//! relays interactive input and reads captured logs.

use super::command::{CommandPaths, FAILED_EXIT_CODE, SessionCommand};
use super::demux::{LogStream, split_streams, strip_prefixes, tag_line};
use super::manager::SessionRegistry;
use super::protocol::render_wrapper_script;
use super::session::{Session, SessionError};
use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long SendInput keeps retrying while the command's input pipe has no reader yet
const INPUT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// A command submission
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub command: String,
    /// Return as soon as the command is queued
    pub run_async: bool,
    /// Strip stream-origin prefixes from the returned output
    pub combined_output: bool,
    /// Do not copy SendInput data into the command log
    pub suppress_input_echo: bool,
    /// Give up waiting after this long (the command keeps running)
    pub timeout: Option<Duration>,
}

/// Result of a finished synchronous execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    /// Raw log, or the prefix-stripped log for combined output
    pub output: Vec<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub command_id: String,
    /// `None` for asynchronous submissions
    pub result: Option<CommandResult>,
}

/// Parse the content of an exit-code sentinel.
///
/// Surrounding whitespace and a byte-order mark are ignored; anything that
/// still is not an integer yields [`FAILED_EXIT_CODE`].
pub fn parse_exit_code(content: &str) -> i32 {
    let trimmed = content.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    match trimmed.parse::<i32>() {
        Ok(code) => code,
        Err(_) => {
            warn!(content = %trimmed, "Unparsable exit code sentinel");
            FAILED_EXIT_CODE
        }
    }
}

/// Return the command's exit code, loading it from the sentinel if it has
/// been published since the last look
async fn refresh_exit_code(command: &SessionCommand) -> Result<Option<i32>, SessionError> {
    if let Some(code) = command.exit_code() {
        return Ok(Some(code));
    }
    match tokio::fs::read(&command.paths().exit_code).await {
        Ok(content) => {
            let code = parse_exit_code(&String::from_utf8_lossy(&content));
            Ok(Some(command.set_exit_code(code)))
        }
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::IoError(e)),
    }
}

async fn prepare_command_dir(paths: &CommandPaths) -> Result<(), SessionError> {
    tokio::fs::create_dir_all(&paths.dir).await.map_err(|e| {
        SessionError::BadRequest(format!(
            "Failed to create command directory {}: {}",
            paths.dir.display(),
            e
        ))
    })?;
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log)
        .await
        .map_err(|e| {
            SessionError::BadRequest(format!(
                "Failed to create log file {}: {}",
                paths.log.display(),
                e
            ))
        })?;
    Ok(())
}

async fn read_command_log(
    session_id: &str,
    command: &SessionCommand,
) -> Result<Vec<u8>, SessionError> {
    let path = &command.paths().log;
    match tokio::fs::read(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == IoErrorKind::NotFound => Err(SessionError::CommandNotFound {
            session_id: session_id.to_string(),
            command_id: command.id.clone(),
        }),
        Err(e) if e.kind() == IoErrorKind::PermissionDenied => {
            Err(SessionError::Forbidden(path.display().to_string()))
        }
        Err(e) => Err(SessionError::IoError(e)),
    }
}

fn render_output(log: Vec<u8>, combined_output: bool, exit_code: i32) -> CommandResult {
    let streams = split_streams(&log);
    let output = if combined_output {
        strip_prefixes(&log)
    } else {
        log
    };
    CommandResult {
        exit_code,
        output,
        stdout: streams.stdout,
        stderr: streams.stderr,
    }
}

impl SessionRegistry {
    /// Submit a command to a session.
    ///
    /// Asynchronous submissions return once the wrapper script has been
    /// written. Synchronous ones poll the exit-code sentinel until it appears,
    /// the session is cancelled, or the optional timeout passes.
    pub async fn execute(
        &self,
        session_id: &str,
        request: ExecuteRequest,
    ) -> Result<ExecuteOutcome, SessionError> {
        let session = self.require(session_id).await?;
        if session.is_cancelled() {
            return Err(SessionError::SessionGone(session_id.to_string()));
        }

        let command = Arc::new(SessionCommand::new(
            session.dir(),
            request.command.as_str(),
            request.suppress_input_echo,
        ));
        prepare_command_dir(command.paths()).await?;
        session.add_command(command.clone()).await;

        let script = render_wrapper_script(command.paths(), &request.command);
        if let Err(e) = session.write_input(script.as_bytes()).await {
            // The shell never saw the script, so no sentinel will ever appear.
            command.set_exit_code(FAILED_EXIT_CODE);
            return Err(e);
        }
        debug!(session_id = %session_id, command_id = %command.id, run_async = request.run_async, "Submitted command");

        if request.run_async {
            return Ok(ExecuteOutcome {
                command_id: command.id.clone(),
                result: None,
            });
        }

        let exit_code =
            wait_for_exit(&session, &command, self.config.poll_interval, request.timeout).await?;
        let log = read_command_log(session_id, &command).await?;

        Ok(ExecuteOutcome {
            command_id: command.id.clone(),
            result: Some(render_output(log, request.combined_output, exit_code)),
        })
    }

    /// Look up a command, refreshing its exit code from the sentinel
    pub async fn get_command(
        &self,
        session_id: &str,
        command_id: &str,
    ) -> Result<Arc<SessionCommand>, SessionError> {
        let session = self.require(session_id).await?;
        let command = require_command(&session, command_id).await?;
        refresh_exit_code(&command).await?;
        Ok(command)
    }

    /// All commands of a session, oldest first, with refreshed exit codes
    pub async fn list_commands(
        &self,
        session_id: &str,
    ) -> Result<Vec<Arc<SessionCommand>>, SessionError> {
        let session = self.require(session_id).await?;
        let commands = session.commands().await;
        for command in &commands {
            refresh_exit_code(command).await?;
        }
        Ok(commands)
    }

    /// Write `data` to a running command's stdin.
    ///
    /// A trailing newline is added when missing. Unless the command was
    /// submitted with input echo suppressed, the data is also appended to the
    /// log as a stdout line once the pipe has a reader.
    pub async fn send_input(
        &self,
        session_id: &str,
        command_id: &str,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let session = self.require(session_id).await?;
        let command = require_command(&session, command_id).await?;

        if let Some(exit_code) = refresh_exit_code(&command).await? {
            return Err(SessionError::CommandCompleted {
                command_id: command_id.to_string(),
                exit_code,
            });
        }
        if session.is_cancelled() {
            return Err(SessionError::SessionGone(session_id.to_string()));
        }

        let mut payload = data.to_vec();
        if !payload.ends_with(b"\n") {
            payload.push(b'\n');
        }

        let mut sender = open_input_pipe(&session, &command, self.config.poll_interval).await?;

        // The echo must land before any output the input triggers.
        if !command.suppress_input_echo {
            let mut log = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&command.paths().log)
                .await?;
            log.write_all(&tag_line(LogStream::Stdout, &payload)).await?;
        }

        if let Err(e) = sender.write_all(&payload).await {
            warn!(session_id = %session_id, command_id = %command_id, error = %e, "Failed to write command input");
            return Err(SessionError::InputClosed(command_id.to_string()));
        }

        debug!(session_id = %session_id, command_id = %command_id, bytes = payload.len(), "Relayed command input");
        Ok(())
    }

    /// Read a command's whole log, optionally with prefixes stripped
    pub async fn read_logs(
        &self,
        session_id: &str,
        command_id: &str,
        combined_output: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let session = self.require(session_id).await?;
        let command = require_command(&session, command_id).await?;

        let log = read_command_log(session_id, &command).await?;

        Ok(if combined_output {
            strip_prefixes(&log)
        } else {
            log
        })
    }
}

pub(crate) async fn require_command(
    session: &Session,
    command_id: &str,
) -> Result<Arc<SessionCommand>, SessionError> {
    session
        .command(command_id)
        .await
        .ok_or_else(|| SessionError::CommandNotFound {
            session_id: session.id().to_string(),
            command_id: command_id.to_string(),
        })
}

async fn wait_for_exit(
    session: &Session,
    command: &SessionCommand,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Result<i32, SessionError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let cancelled = session.cancellation();

    loop {
        if let Some(code) = refresh_exit_code(command).await? {
            return Ok(code);
        }

        if let (Some(deadline), Some(timeout)) = (deadline, timeout)
            && Instant::now() >= deadline
        {
            return Err(SessionError::Timeout {
                command_id: command.id.clone(),
                timeout,
            });
        }

        tokio::select! {
            _ = cancelled.cancelled() => {
                // A sentinel published on the way out (e.g. `exit N`) means the
                // command finished and its log is complete.
                if let Ok(Some(code)) = refresh_exit_code(command).await {
                    return Ok(code);
                }
                return Err(SessionError::SessionCancelled {
                    session_id: session.id().to_string(),
                    exit_code: command.set_exit_code(FAILED_EXIT_CODE),
                });
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Open the command's input pipe for writing without blocking.
///
/// The pipe may not exist yet, or may not have a reader yet, right after an
/// asynchronous submission; both are retried until the command finishes, the
/// session is cancelled, or [`INPUT_OPEN_TIMEOUT`] passes.
#[cfg(unix)]
async fn open_input_pipe(
    session: &Session,
    command: &SessionCommand,
    poll_interval: Duration,
) -> Result<tokio::net::unix::pipe::Sender, SessionError> {
    let deadline = Instant::now() + INPUT_OPEN_TIMEOUT;
    let path = &command.paths().input_pipe;

    loop {
        let error = match tokio::net::unix::pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e) => e,
        };

        let retryable = error.kind() == IoErrorKind::NotFound
            || error.raw_os_error() == Some(libc::ENXIO);
        if !retryable {
            return Err(SessionError::IoError(error));
        }

        if let Some(exit_code) = refresh_exit_code(command).await? {
            return Err(SessionError::CommandCompleted {
                command_id: command.id.clone(),
                exit_code,
            });
        }
        if session.is_cancelled() {
            return Err(SessionError::SessionGone(session.id().to_string()));
        }
        if Instant::now() >= deadline {
            return Err(SessionError::InputClosed(command.id.clone()));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(not(unix))]
async fn open_input_pipe(
    _session: &Session,
    command: &SessionCommand,
    _poll_interval: Duration,
) -> Result<tokio::fs::File, SessionError> {
    Err(SessionError::InputClosed(command.id.clone()))
}
