//! Command execution inside sandboxes.
//!
//! Commands are described by a typed [`Invocation`] (program, argv, env,
//! stdin). Nothing is ever assembled into a shell line, so untrusted text
//! such as an issue title can only reach a command as stdin or as one argv
//! element.

mod process;
mod sandboxed;

pub(crate) use process::run_process;
pub use sandboxed::SandboxCommandRunner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::sandbox::SandboxHandle;

/// A command to run, described structurally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory; relative paths resolve against the sandbox workdir.
    pub workdir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and arguments for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into [`Error::Runner`].
    pub fn into_success(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(Error::Runner(format!(
            "`{}` exited with code {}: {}",
            what, self.exit_code, detail
        )))
    }
}

/// Executes one command inside a sandbox.
///
/// Implementations enforce `timeout` per call and never retry.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        handle: &SandboxHandle,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_builder_keeps_arguments_separate() {
        let invocation = Invocation::new("git")
            .args(["commit", "-F", "-"])
            .env("GIT_AUTHOR_NAME", "bot")
            .stdin("fix: it's \"quoted\"; rm -rf /");

        assert_eq!(invocation.args, vec!["commit", "-F", "-"]);
        assert_eq!(invocation.env["GIT_AUTHOR_NAME"], "bot");
        assert_eq!(invocation.display(), "git commit -F -");
    }

    #[test]
    fn non_zero_exit_becomes_runner_error() {
        let output = CommandOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "fatal: not a git repository\n".to_string(),
            duration: Duration::ZERO,
        };

        let err = output.into_success("git status").unwrap_err();
        assert!(matches!(err, Error::Runner(ref msg) if msg.contains("not a git repository")));
    }

    #[test]
    fn zero_exit_passes_through() {
        let output = CommandOutput {
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
            duration: Duration::ZERO,
        };
        assert_eq!(output.into_success("true").unwrap().stdout, "ok");
    }
}
