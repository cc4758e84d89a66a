//! Process-group termination for session shells.
//!
//! Session shells are spawned as process-group leaders, so every command,
//! pipe reader and stdin holder started by the shell shares its group id.

use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No process in the group existed when the first signal was sent
    AlreadyExited,
    /// The group exited within the grace period after SIGTERM
    Graceful,
    /// Survivors were sent SIGKILL after the grace period
    Killed,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<bool> {
    // SAFETY: kill(2) with a negative pid only signals the process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(true);
    }

    let error = io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        _ => Err(error),
    }
}

/// True while at least one process in the group can still be signalled
#[cfg(unix)]
pub fn group_alive(pgid: i32) -> bool {
    matches!(signal_group(pgid, 0), Ok(true))
}

/// Terminate every process in the group led by `pgid`.
///
/// Sends SIGTERM, polls every `poll_interval` for up to `grace_period`, then
/// sends SIGKILL to whatever is left. "No such process" is never an error.
#[cfg(unix)]
pub async fn terminate_process_group(
    pgid: i32,
    grace_period: Duration,
    poll_interval: Duration,
) -> io::Result<Termination> {
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }

    if !signal_group(pgid, libc::SIGTERM)? {
        debug!(pgid, "Process group already gone");
        return Ok(Termination::AlreadyExited);
    }

    let deadline = Instant::now() + grace_period;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            debug!(pgid, "Process group exited after SIGTERM");
            return Ok(Termination::Graceful);
        }
        tokio::time::sleep(poll_interval).await;
    }

    warn!(
        pgid,
        grace_period_ms = grace_period.as_millis(),
        "Process group survived SIGTERM, sending SIGKILL"
    );
    if !signal_group(pgid, libc::SIGKILL)? {
        return Ok(Termination::Graceful);
    }
    Ok(Termination::Killed)
}

#[cfg(not(unix))]
pub async fn terminate_process_group(
    _pgid: i32,
    _grace_period: Duration,
    _poll_interval: Duration,
) -> io::Result<Termination> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_group(script: &str) -> tokio::process::Child {
        match Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => panic!("failed to spawn test process: {error}"),
        }
    }

    fn pgid_of(child: &tokio::process::Child) -> i32 {
        match child.id() {
            Some(pid) => pid as i32,
            None => panic!("child should still have a pid"),
        }
    }

    #[tokio::test]
    async fn test_terminates_cooperative_group() {
        let mut child = spawn_group("sleep 30 & sleep 30; wait");
        let pgid = pgid_of(&child);
        let reaper = tokio::spawn(async move { child.wait().await });

        let result = terminate_process_group(
            pgid,
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Ok(Termination::Graceful) | Ok(Termination::Killed)));
        let _ = reaper.await;
    }

    #[tokio::test]
    async fn test_escalates_to_sigkill_when_term_is_ignored() {
        let mut child = spawn_group("trap '' TERM; while :; do sleep 1; done");
        let pgid = pgid_of(&child);
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reaper = tokio::spawn(async move { child.wait().await });

        let result = terminate_process_group(
            pgid,
            Duration::from_millis(300),
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Ok(Termination::Killed)));
        let _ = reaper.await;
    }

    #[tokio::test]
    async fn test_already_exited_group_is_not_an_error() {
        let mut child = spawn_group("exit 0");
        let pgid = pgid_of(&child);
        let _ = child.wait().await;

        let result =
            terminate_process_group(pgid, Duration::from_millis(100), Duration::from_millis(10))
                .await;

        assert!(matches!(result, Ok(Termination::AlreadyExited)));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_group_id() {
        let result =
            terminate_process_group(0, Duration::from_millis(10), Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
