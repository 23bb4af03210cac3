//! Child process execution with output capture and a hard deadline.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::CommandOutput;

/// Runs a prepared command to completion, killing its whole process group
/// if it outlives `timeout`.
pub(crate) async fn run_process(
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    label: &str,
) -> Result<CommandOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so a timeout can take down grandchildren as well.
    #[cfg(unix)]
    command.process_group(0);

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| Error::Runner(format!("failed to spawn `{}`: {}", label, e)))?;
    let pid = child.id();

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&input).await {
                tracing::debug!(error = %e, "child closed stdin early");
            }
        });
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: start.elapsed(),
            };
            tracing::debug!(
                command = %label,
                exit_code = result.exit_code,
                duration = ?result.duration,
                "command finished"
            );
            Ok(result)
        }
        Ok(Err(e)) => Err(Error::Runner(format!(
            "failed to wait for `{}`: {}",
            label, e
        ))),
        Err(_) => {
            // The direct child was killed when the wait future dropped.
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            tracing::warn!(command = %label, ?timeout, "command timed out, process group killed");
            Err(Error::Timeout {
                command: label.to_string(),
                timeout,
            })
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg only sends a signal; an already-empty group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, "process group already exited");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let output = run_process(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
            "sh",
        )
        .await
        .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn feeds_stdin_verbatim() {
        let payload = "$(whoami) `id` ; echo injected";
        let output = run_process(
            Command::new("cat"),
            Some(payload.as_bytes().to_vec()),
            Duration::from_secs(5),
            "cat",
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, payload);
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let start = Instant::now();
        let err = run_process(
            sh("sleep 30 & sleep 30"),
            None,
            Duration::from_millis(200),
            "sleepers",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    /// Whether `pid` is a live process. Zombies count as dead.
    #[cfg(unix)]
    fn is_alive(pid: i32) -> bool {
        // SAFETY: signal 0 only checks that the process exists.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(true, |state| state != "Z"),
            Err(_) => true,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_background_grandchildren() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pidfile.display());

        let err = run_process(sh(&script), None, Duration::from_millis(300), "sh")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..100 {
            alive = is_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background sleep {} survived the timeout", pid);
    }

    #[tokio::test]
    async fn missing_program_is_a_runner_error() {
        let err = run_process(
            Command::new("definitely-not-a-real-program-xyz"),
            None,
            Duration::from_secs(1),
            "missing",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Runner(_)));
    }
}
