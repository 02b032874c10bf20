//! Asynchronous utilities for use with Tokio.
//!
//! Model inference and image decoding are CPU-bound, and poppler and
//! tesseract are external processes. This keeps the glue for both in one place.

use std::{panic, pin::Pin};

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        // We never abort blocking tasks, and the runtime outlives them.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Some tools exit successfully after printing errors, so
/// standard error may be checked line by line with `is_error_line`.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        len = output.stdout.len(),
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Explain a failure to start an external tool, pointing at the package that
/// provides it when the binary is missing.
pub fn spawn_error(command_name: &str, package: &str, err: std::io::Error) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        anyhow!("{command_name} not found (install {package})")
    } else {
        anyhow::Error::new(err).context(format!("failed to run {command_name}"))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn successful_command_passes() -> Result<()> {
        let output = Command::new("true").output()?;
        check_for_command_failure("true", &output, None)
    }

    #[test]
    fn error_regex_flags_noisy_success() -> Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg("echo 'Syntax Error: bad xref' >&2")
            .output()?;
        let is_error_line = |line: &str| line.contains("Error");
        assert!(check_for_command_failure("sh", &output, Some(&is_error_line)).is_err());
        check_for_command_failure("sh", &output, None)
    }

    #[test]
    fn failed_command_reports_exit_code() -> Result<()> {
        let output = Command::new("false").output()?;
        let err = check_for_command_failure("false", &output, None).unwrap_err();
        assert!(err.to_string().contains("exit code 1"));
        Ok(())
    }

    #[test]
    fn missing_binary_names_the_package() {
        let err = spawn_error(
            "pdfinfo",
            "poppler-utils",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(err.to_string(), "pdfinfo not found (install poppler-utils)");
    }

    #[tokio::test]
    async fn spawn_blocking_returns_value() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }
}
