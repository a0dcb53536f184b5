//! Async runner for the external tools (`ip`, `tc`, `arping`, `gobgp`) that
//! program the host data plane.

use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Executes an external program and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands on the local host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommand;

#[async_trait]
impl CommandRunner for SystemCommand {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let rendered = render(program, args);
        debug!(command = %rendered, "Running command");

        let output = Command::new(program).args(args).output().await?;

        if !output.status.success() {
            return Err(Error::command_failed(
                rendered,
                String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Run a command that installs something, treating "already exists" as success.
pub async fn ensure_present(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<()> {
    match runner.run(program, args).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_present() => {
            debug!(command = %render(program, args), "Already present");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Run a command that removes something, treating "not found" as success.
pub async fn ensure_absent(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<()> {
    match runner.run(program, args).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_absent() => {
            debug!(command = %render(program, args), "Already absent");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Flags whose value must never reach logs or error messages.
const SECRET_FLAGS: &[&str] = &["auth-password"];

const REDACTED: &str = "******";

/// Render a command line for logs and errors, masking secret values.
fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    let mut masked = false;
    for arg in args {
        line.push(' ');
        line.push_str(if masked { REDACTED } else { arg });
        masked = SECRET_FLAGS.contains(&arg.as_str());
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(&'static str);

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, program: &str, args: &[String]) -> Result<String> {
            Err(Error::command_failed(render(program, args), self.0))
        }
    }

    #[tokio::test]
    async fn test_system_command_captures_stdout() {
        let out = SystemCommand
            .run("sh", &args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_command_reports_stderr_on_failure() {
        let err = SystemCommand
            .run("sh", &args(["-c", "echo boom 1>&2; exit 3"]))
            .await
            .unwrap_err();

        match err {
            Error::CommandFailed { command, stderr } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ensure_present_tolerates_existing() {
        let runner = Scripted("RTNETLINK answers: File exists");
        assert!(ensure_present(&runner, "ip", &args(["addr", "add"])).await.is_ok());
        assert!(ensure_absent(&runner, "ip", &args(["addr", "del"])).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_absent_tolerates_missing() {
        let runner = Scripted("RTNETLINK answers: Cannot assign requested address");
        assert!(ensure_absent(&runner, "ip", &args(["addr", "del"])).await.is_ok());
        assert!(ensure_present(&runner, "ip", &args(["addr", "add"])).await.is_err());
    }

    #[test]
    fn test_render_masks_secrets() {
        assert_eq!(render("ip", &[]), "ip");
        assert_eq!(
            render("gobgp", &args(["neighbor", "add", "10.0.0.1", "auth-password", "hunter2"])),
            "gobgp neighbor add 10.0.0.1 auth-password ******"
        );
    }

    #[tokio::test]
    async fn test_failed_command_does_not_leak_secret() {
        let err = SystemCommand
            .run("sh", &args(["-c", "exit 1", "auth-password", "hunter2"]))
            .await
            .unwrap_err();

        assert!(!err.to_string().contains("hunter2"));
        match err {
            Error::CommandFailed { command, .. } => {
                assert_eq!(command, "sh -c exit 1 auth-password ******");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
