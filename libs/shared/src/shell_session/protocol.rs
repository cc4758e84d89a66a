//! Command Execution Protocol
//!
//! Renders the script that is written to a session shell's stdin to run one
//! command. The script wires the command to three per-command named pipes:
//!
//! ```text
//!   command stdout ──► stdout.pipe ──► reader 1 ──┐ (01 01 01 + line)
//!                                                 ├──► output.log
//!   command stderr ──► stderr.pipe ──► reader 2 ──┘ (02 02 02 + line)
//!   SendInput ───────► input.pipe  ──► command stdin (held open by a sleeper)
//! ```
//!
//! The command runs through `command eval` in the session shell itself, so
//! `cd`, `export` and friends carry over to the next command. `command`
//! strips `eval` of its special-built-in status, so a syntax error in the
//! command fails with status 2 instead of exiting the shell. Its exit status is
//! published to `exit_code` (temp file + rename) only after both readers have
//! drained, so a present sentinel always means the log is complete.
//!
//! Pipes are unlinked on every exit path: normal completion, the command
//! calling `exit` (EXIT trap), and HUP/INT/TERM.

use super::command::CommandPaths;
use std::path::Path;

/// Variables and functions defined by the wrapper; all unset afterwards.
const SCRIPT_VARS: &[&str] = &[
    "__sbx_log",
    "__sbx_ec_file",
    "__sbx_op",
    "__sbx_ep",
    "__sbx_ip",
    "__sbx_cmd",
    "__sbx_r1",
    "__sbx_r2",
    "__sbx_holder",
    "__sbx_rc",
    "__sbx_ec",
];

/// Quote `value` as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Build the wrapper script for one command
pub fn render_wrapper_script(paths: &CommandPaths, command: &str) -> String {
    let mut script = String::with_capacity(2048 + command.len());

    script.push_str(&format!("__sbx_log={}\n", quote_path(&paths.log)));
    script.push_str(&format!("__sbx_ec_file={}\n", quote_path(&paths.exit_code)));
    script.push_str(&format!("__sbx_op={}\n", quote_path(&paths.stdout_pipe)));
    script.push_str(&format!("__sbx_ep={}\n", quote_path(&paths.stderr_pipe)));
    script.push_str(&format!("__sbx_ip={}\n", quote_path(&paths.input_pipe)));
    script.push_str(&format!("__sbx_cmd={}\n", shell_quote(command)));

    script.push_str(
        r#"__sbx_finish() {
  __sbx_ec=$1
  kill "$__sbx_holder" 2>/dev/null
  wait "$__sbx_holder" "$__sbx_r1" "$__sbx_r2" 2>/dev/null
  printf '%s\n' "$__sbx_ec" > "$__sbx_ec_file.tmp" && mv -f "$__sbx_ec_file.tmp" "$__sbx_ec_file"
  rm -f "$__sbx_op" "$__sbx_ep" "$__sbx_ip"
}
rm -f "$__sbx_op" "$__sbx_ep" "$__sbx_ip"
if mkfifo "$__sbx_op" "$__sbx_ep" "$__sbx_ip"; then
  trap '__sbx_rc=$?; exec >/dev/null 2>&1 </dev/null; __sbx_finish "$__sbx_rc"' EXIT
  trap 'rm -f "$__sbx_op" "$__sbx_ep" "$__sbx_ip"; exit 143' HUP INT TERM
  (while IFS= read -r __sbx_line || [ -n "$__sbx_line" ]; do printf '\001\001\001%s\n' "$__sbx_line"; done) < "$__sbx_op" >> "$__sbx_log" &
  __sbx_r1=$!
  (while IFS= read -r __sbx_line || [ -n "$__sbx_line" ]; do printf '\002\002\002%s\n' "$__sbx_line"; done) < "$__sbx_ep" >> "$__sbx_log" &
  __sbx_r2=$!
  sleep 2147483647 > "$__sbx_ip" &
  __sbx_holder=$!
  { command eval "$__sbx_cmd"; } > "$__sbx_op" 2> "$__sbx_ep" < "$__sbx_ip"
  __sbx_rc=$?
  trap - EXIT HUP INT TERM
  __sbx_finish "$__sbx_rc"
else
  printf '\002\002\002%s\n' "sandboxd: failed to create command pipes" >> "$__sbx_log"
  printf '%s\n' 1 > "$__sbx_ec_file"
fi
unset -f __sbx_finish
"#,
    );

    script.push_str("unset");
    for var in SCRIPT_VARS {
        script.push(' ');
        script.push_str(var);
    }
    script.push('\n');

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_script_references_every_command_path() {
        let paths = CommandPaths::new(&PathBuf::from("/var/sbx/sessions/s 1"), "abc");
        let script = render_wrapper_script(&paths, "echo hello");

        assert!(script.contains("__sbx_log='/var/sbx/sessions/s 1/abc/output.log'"));
        assert!(script.contains("__sbx_ec_file='/var/sbx/sessions/s 1/abc/exit_code'"));
        assert!(script.contains("__sbx_ip='/var/sbx/sessions/s 1/abc/input.pipe'"));
        assert!(script.contains("__sbx_cmd='echo hello'"));
        assert!(script.contains(r"\001\001\001"));
        assert!(script.contains(r"\002\002\002"));
        assert!(script.ends_with("__sbx_ec\n"));
    }

    #[test]
    fn test_command_text_is_quoted_not_interpreted() {
        let paths = CommandPaths::new(&PathBuf::from("/tmp/s"), "c");
        let script = render_wrapper_script(&paths, "echo '$HOME'; exit 3");

        assert!(script.contains(r#"__sbx_cmd='echo '\''$HOME'\''; exit 3'"#));
    }

    #[cfg(unix)]
    mod shell {
        use super::super::*;
        use crate::shell_session::demux::{split_streams, strip_prefixes};
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        /// Feed the script to a fresh `sh`, then close its stdin so it exits
        async fn run_in_sh(script: &str) -> std::process::ExitStatus {
            let mut child = match Command::new("/bin/sh")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(error) => panic!("failed to spawn sh: {error}"),
            };

            let mut stdin = match child.stdin.take() {
                Some(stdin) => stdin,
                None => panic!("sh stdin should be piped"),
            };
            if let Err(error) = stdin.write_all(script.as_bytes()).await {
                panic!("failed to write script: {error}");
            }
            drop(stdin);

            match tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await {
                Ok(Ok(status)) => status,
                Ok(Err(error)) => panic!("failed to wait for sh: {error}"),
                Err(_) => panic!("wrapper script did not finish"),
            }
        }

        fn setup(command: &str) -> (tempfile::TempDir, CommandPaths, String) {
            let dir = match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(error) => panic!("tempdir: {error}"),
            };
            let paths = CommandPaths::new(dir.path(), "cmd");
            if let Err(error) = std::fs::create_dir_all(&paths.dir) {
                panic!("create command dir: {error}");
            }
            let script = render_wrapper_script(&paths, command);
            (dir, paths, script)
        }

        #[tokio::test]
        async fn test_script_captures_tagged_streams_and_exit_code() {
            let (_dir, paths, script) = setup("echo out; echo err >&2; false");

            run_in_sh(&script).await;

            let log = std::fs::read(&paths.log).unwrap_or_default();
            assert!(log.windows(7).any(|w| w == b"\x01\x01\x01out\n"));
            assert!(log.windows(7).any(|w| w == b"\x02\x02\x02err\n"));

            let streams = split_streams(&log);
            assert_eq!(streams.stdout, b"out\n".to_vec());
            assert_eq!(streams.stderr, b"err\n".to_vec());

            let exit_code = std::fs::read_to_string(&paths.exit_code).unwrap_or_default();
            assert_eq!(exit_code.trim(), "1");
        }

        #[tokio::test]
        async fn test_script_removes_pipes_after_completion() {
            let (_dir, paths, script) = setup("echo done");

            run_in_sh(&script).await;

            assert!(!paths.stdout_pipe.exists());
            assert!(!paths.stderr_pipe.exists());
            assert!(!paths.input_pipe.exists());
            assert!(paths.exit_code.exists());
            assert_eq!(strip_prefixes(&std::fs::read(&paths.log).unwrap_or_default()), b"done\n");
        }

        #[tokio::test]
        async fn test_exit_in_command_still_publishes_exit_code() {
            let (_dir, paths, script) = setup("echo bye; exit 3");

            run_in_sh(&script).await;

            let exit_code = std::fs::read_to_string(&paths.exit_code).unwrap_or_default();
            assert_eq!(exit_code.trim(), "3");
            assert_eq!(strip_prefixes(&std::fs::read(&paths.log).unwrap_or_default()), b"bye\n");
            assert!(!paths.input_pipe.exists());
        }

        #[tokio::test]
        async fn test_shell_state_persists_between_commands() {
            let (dir, first, first_script) = setup("export SBX_PROTOCOL_TEST=kept");
            let second = CommandPaths::new(dir.path(), "cmd2");
            if let Err(error) = std::fs::create_dir_all(&second.dir) {
                panic!("create command dir: {error}");
            }
            let second_script = render_wrapper_script(&second, "echo \"$SBX_PROTOCOL_TEST\"");

            run_in_sh(&format!("{first_script}{second_script}")).await;

            assert!(first.exit_code.exists());
            let log = std::fs::read(&second.log).unwrap_or_default();
            assert_eq!(strip_prefixes(&log), b"kept\n");
        }

        #[tokio::test]
        async fn test_unterminated_last_line_is_flushed() {
            let (_dir, paths, script) = setup("printf 'no newline'");

            run_in_sh(&script).await;

            let log = std::fs::read(&paths.log).unwrap_or_default();
            assert_eq!(log, b"\x01\x01\x01no newline\n".to_vec());
        }
    }
}
