use chrono::{DateTime, Utc};
use sandboxd_shared::shell_session::{CommandResult, Session, SessionCommand};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub session_id: String,
    #[serde(default)]
    pub legacy_working_dir: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionDto {
    pub id: String,
    pub shell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub alive: bool,
    /// Exit code of the shell itself once it has exited on its own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl SessionDto {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            shell: session.shell().to_string(),
            pid: session.pid(),
            alive: !session.is_cancelled(),
            shell_exit_code: session.exit_status().flatten(),
            created_at: session.created_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionDto>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub session: SessionDto,
    pub commands: Vec<CommandDto>,
}

#[derive(Debug, Serialize)]
pub struct CommandDto {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub suppress_input_echo: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&SessionCommand> for CommandDto {
    fn from(command: &SessionCommand) -> Self {
        Self {
            id: command.id.clone(),
            command: command.command.clone(),
            exit_code: command.exit_code(),
            suppress_input_echo: command.suppress_input_echo,
            created_at: command.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandsResponse {
    pub commands: Vec<CommandDto>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub command: String,
    #[serde(default, alias = "async")]
    pub run_async: bool,
    #[serde(default)]
    pub combined_output: bool,
    #[serde(default)]
    pub suppress_input_echo: bool,
    /// Stop waiting for a synchronous command after this many milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub command_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ExecuteResponse {
    pub fn new(command_id: String, result: Option<CommandResult>) -> Self {
        match result {
            Some(result) => Self {
                command_id,
                exit_code: Some(result.exit_code),
                output: Some(String::from_utf8_lossy(&result.output).into_owned()),
                stdout: Some(String::from_utf8_lossy(&result.stdout).into_owned()),
                stderr: Some(String::from_utf8_lossy(&result.stderr).into_owned()),
            },
            None => Self {
                command_id,
                exit_code: None,
                output: None,
                stdout: None,
                stderr: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendInputBody {
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default, deserialize_with = "query_flag")]
    pub combined_output: bool,
    #[serde(default, deserialize_with = "query_flag")]
    pub follow: bool,
}

/// Accepts `?follow`, `?follow=true` and `?follow=1`
fn query_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = String::deserialize(deserializer)?;
    match value.as_str() {
        "" | "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "invalid flag value '{other}'"
        ))),
    }
}
