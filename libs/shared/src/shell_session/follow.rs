//! Log Following
//!
//! Tails a command's log from the beginning and forwards it in chunks,
//! optionally with stream-origin prefixes stripped. In follow mode the
//! follower keeps waiting for new bytes until the command's exit-code
//! sentinel appears or the session is cancelled.

use super::command::SessionCommand;
use super::demux::LogDemuxer;
use super::executor::require_command;
use super::manager::SessionRegistry;
use super::session::{Session, SessionError};
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Why a follower stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowEnd {
    /// The whole log was delivered (command finished, or snapshot mode)
    Completed,
    /// The session was deleted or its shell exited before the command finished
    SessionCancelled,
    /// The receiving side went away
    ReceiverClosed,
}

#[derive(Debug, Clone)]
pub struct LogFollower {
    log_path: PathBuf,
    exit_code_path: PathBuf,
    combined_output: bool,
    follow: bool,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl LogFollower {
    pub fn new(
        session: &Session,
        command: &SessionCommand,
        combined_output: bool,
        follow: bool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            log_path: command.paths().log.clone(),
            exit_code_path: command.paths().exit_code.clone(),
            combined_output,
            follow,
            poll_interval,
            cancel: session.cancellation(),
        }
    }

    /// Stream the log into `tx` until one of the [`FollowEnd`] conditions.
    ///
    /// Bytes held back by the demultiplexer are always flushed before
    /// returning, whatever the reason.
    pub async fn run(self, tx: mpsc::Sender<Bytes>) -> std::io::Result<FollowEnd> {
        let mut file = File::open(&self.log_path).await?;
        let mut demuxer = self.combined_output.then(LogDemuxer::new);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        let end = loop {
            // Checked before reading: once the sentinel exists the log is complete,
            // so an empty read after seeing it means everything was delivered.
            let finished = tokio::fs::try_exists(&self.exit_code_path)
                .await
                .unwrap_or(false);

            let n = file.read(&mut buf).await?;
            if n > 0 {
                if !forward(&tx, &mut demuxer, &buf[..n]).await {
                    break FollowEnd::ReceiverClosed;
                }
                continue;
            }

            if !self.follow || finished {
                break FollowEnd::Completed;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Deliver whatever the command managed to write before teardown.
                    let mut drained = true;
                    loop {
                        let n = file.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        if !forward(&tx, &mut demuxer, &buf[..n]).await {
                            drained = false;
                            break;
                        }
                    }
                    break if drained { FollowEnd::SessionCancelled } else { FollowEnd::ReceiverClosed };
                }
                _ = tx.closed() => break FollowEnd::ReceiverClosed,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        if let Some(mut demuxer) = demuxer {
            let rest = demuxer.finish();
            if !rest.is_empty() && end != FollowEnd::ReceiverClosed {
                let _ = tx.send(Bytes::from(rest)).await;
            }
        }

        debug!(log = %self.log_path.display(), end = ?end, "Log follower finished");
        Ok(end)
    }
}

impl SessionRegistry {
    /// Build a follower for a command's log, using the registry's poll interval
    pub async fn log_follower(
        &self,
        session_id: &str,
        command_id: &str,
        combined_output: bool,
        follow: bool,
    ) -> Result<LogFollower, SessionError> {
        let session = self.require(session_id).await?;
        let command = require_command(&session, command_id).await?;
        // Open once up front so a missing or unreadable log is reported to the caller.
        match File::open(&command.paths().log).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::CommandNotFound {
                    session_id: session_id.to_string(),
                    command_id: command_id.to_string(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(SessionError::Forbidden(
                    command.paths().log.display().to_string(),
                ));
            }
            Err(e) => return Err(SessionError::IoError(e)),
        }
        Ok(LogFollower::new(
            &session,
            &command,
            combined_output,
            follow,
            self.config.poll_interval,
        ))
    }
}

/// Send one chunk, demultiplexed if requested. False once the receiver is gone.
async fn forward(
    tx: &mpsc::Sender<Bytes>,
    demuxer: &mut Option<LogDemuxer>,
    chunk: &[u8],
) -> bool {
    let out = match demuxer {
        Some(demuxer) => demuxer.push(chunk),
        None => chunk.to_vec(),
    };
    if out.is_empty() {
        return true;
    }
    tx.send(Bytes::from(out)).await.is_ok()
}
