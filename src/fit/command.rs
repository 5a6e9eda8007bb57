//! External-process adapters for the fit and recalibration steps
//!
//! The fitter is invoked as `<program> [args..] <target-name> <cores>` with
//! the target serialized as JSON on stdin, and must print [`FitParameters`]
//! JSON on stdout. Exit codes:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | fitted, parameters on stdout |
//! | 2 | did not converge |
//! | 3 | bad or insufficient data |
//! | other | process failure |
//!
//! Children are killed when the fit future is dropped, so a timed-out fit
//! does not leave a process behind.

use std::io::ErrorKind;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{FitExecutor, Recalibrator};
use crate::models::{FitParameters, Target};
use crate::utils::error::FitError;

const EXIT_NON_CONVERGENCE: i32 = 2;
const EXIT_BAD_DATA: i32 = 3;
const STDERR_TAIL: usize = 512;

/// Runs an external fitting program per target
#[derive(Debug, Clone)]
pub struct CommandFitExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandFitExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl FitExecutor for CommandFitExecutor {
    async fn fit(&self, target: &Target, cores: usize) -> Result<FitParameters, FitError> {
        let payload =
            serde_json::to_vec(target).map_err(|e| FitError::BadData(e.to_string()))?;
        let trailing = [target.name.clone(), cores.to_string()];

        let output = run_program(&self.program, &self.args, &trailing, &payload)
            .await
            .map_err(FitError::ProcessFailed)?;

        match output.status.code() {
            Some(0) => serde_json::from_slice::<FitParameters>(&output.stdout)
                .map_err(|e| FitError::InvalidOutput(e.to_string())),
            Some(EXIT_NON_CONVERGENCE) => Err(FitError::NonConvergence(stderr_tail(&output))),
            Some(EXIT_BAD_DATA) => Err(FitError::BadData(stderr_tail(&output))),
            code => Err(FitError::ProcessFailed(format!(
                "{} exited with {}: {}",
                self.program,
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr_tail(&output)
            ))),
        }
    }
}

/// Runs an external error-recalibration program per target
#[derive(Debug, Clone)]
pub struct CommandRecalibrator {
    program: String,
    args: Vec<String>,
}

impl CommandRecalibrator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Recalibrator for CommandRecalibrator {
    async fn recalibrate(&self, target: &Target) -> Result<(), FitError> {
        let payload =
            serde_json::to_vec(target).map_err(|e| FitError::Recalibration(e.to_string()))?;
        let output = run_program(&self.program, &self.args, &[target.name.clone()], &payload)
            .await
            .map_err(FitError::Recalibration)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FitError::Recalibration(stderr_tail(&output)))
        }
    }
}

async fn run_program(
    program: &str,
    args: &[String],
    trailing: &[String],
    stdin_payload: &[u8],
) -> Result<Output, String> {
    let mut child = Command::new(program)
        .args(args)
        .args(trailing)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("cannot start {program}: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(stdin_payload).await {
            Ok(()) => {}
            // Program chose not to read its input
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => return Err(format!("cannot write to {program}: {e}")),
        }
    }

    child
        .wait_with_output()
        .await
        .map_err(|e| format!("{program} did not finish: {e}"))
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    trimmed[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::SkyPosition;

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string(), "fitter".to_string()]
    }

    fn target() -> Target {
        Target::new("Gaia24xyz", SkyPosition::new(270.1, -28.4)).with_classification("Microlensing")
    }

    #[tokio::test]
    async fn test_fit_parses_stdout() {
        let executor = CommandFitExecutor::new(
            "sh",
            shell(r#"cat >/dev/null; echo "{\"t0\": 2460500.5, \"u0\": 0.2, \"te\": $2}""#),
        );

        let params = executor.fit(&target(), 12).await.unwrap();
        assert_eq!(params.t0, 2460500.5);
        assert_eq!(params.te, 12.0);
        assert!(params.alive.is_none());
    }

    #[tokio::test]
    async fn test_fit_receives_target_name() {
        let executor = CommandFitExecutor::new(
            "sh",
            shell(r#"[ "$1" = "Gaia24xyz" ] || exit 9; echo '{"t0":1,"u0":1,"te":1}'"#),
        );
        assert!(executor.fit(&target(), 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_fit_errors() {
        let diverged = CommandFitExecutor::new("sh", shell("echo 'chi2 blew up' >&2; exit 2"));
        assert_eq!(
            diverged.fit(&target(), 1).await.unwrap_err(),
            FitError::NonConvergence("chi2 blew up".into())
        );

        let bad = CommandFitExecutor::new("sh", shell("exit 3"));
        assert!(matches!(
            bad.fit(&target(), 1).await,
            Err(FitError::BadData(_))
        ));

        let crashed = CommandFitExecutor::new("sh", shell("exit 1"));
        assert!(matches!(
            crashed.fit(&target(), 1).await,
            Err(FitError::ProcessFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_output_is_invalid() {
        let executor = CommandFitExecutor::new("sh", shell("echo not-json"));
        assert!(matches!(
            executor.fit(&target(), 1).await,
            Err(FitError::InvalidOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let executor = CommandFitExecutor::new("/nonexistent/pspl-fit", Vec::new());
        assert!(matches!(
            executor.fit(&target(), 1).await,
            Err(FitError::ProcessFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_recalibrator_status() {
        let ok = CommandRecalibrator::new("sh", shell("exit 0"));
        assert!(ok.recalibrate(&target()).await.is_ok());

        let failing = CommandRecalibrator::new("sh", shell("echo 'no DR3 match' >&2; exit 1"));
        assert_eq!(
            failing.recalibrate(&target()).await.unwrap_err(),
            FitError::Recalibration("no DR3 match".into())
        );
    }
}
