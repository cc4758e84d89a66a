//! Persistent Shell Session Management
//!
//! Shell sessions keep their state (working directory, environment, shell
//! variables) across commands because every command is executed by the same
//! long-lived shell process.
//!
//! # Architecture
//!
//! - `SessionRegistry`: session lifecycle (create, look up, delete, shutdown)
//! - `Session`: one shell process plus the commands submitted to it
//! - `protocol`: the wrapper script that runs one command and captures its output
//! - `executor`: execute, inspect, feed input to and read logs of commands
//! - `demux`: stream-origin prefixes in the captured log
//! - `LogFollower`: live tailing of a command's log
//! - `process`: process-group termination

mod command;
mod demux;
mod executor;
mod follow;
mod manager;
mod process;
mod protocol;
mod session;

pub use command::{
    CommandPaths, EXIT_CODE_FILE_NAME, FAILED_EXIT_CODE, INPUT_PIPE_NAME, LOG_FILE_NAME,
    SessionCommand,
};
pub use demux::{
    DemuxedOutput, LogDemuxer, LogStream, STDERR_PREFIX, STDOUT_PREFIX, split_streams,
    strip_prefixes, tag_line,
};
pub use executor::{CommandResult, ExecuteOutcome, ExecuteRequest, parse_exit_code};
pub use follow::{FollowEnd, LogFollower};
pub use manager::{CreateSessionOptions, SessionRegistry, ShellSessionConfig};
pub use process::{Termination, terminate_process_group};
pub use protocol::{render_wrapper_script, shell_quote};
pub use session::{ErrorKind, Session, SessionError};
