//! Isolation boundary for evaluating LLM-produced mutator artifacts.
//!
//! The source imports generated code straight into the host process; here
//! evaluation happens in a child `python3` process instead; see `spec.md`
//! §8's redesign note. Communication follows a line-delimited string
//! protocol, mirroring the control/status pipe discipline of
//! [`crate::execution::fork_server`] without inheriting its AFL-specific
//! framing — evaluation here is one request, one line of output, one exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::SandboxError;

/// Evaluation seam between the pipeline stages and artifact evaluation.
/// [`Sandbox`] is the real, subprocess-backed implementation; test harnesses
/// substitute a fake (`spec.md` §8's "in-process fake ... sandbox") so the
/// fixer's repair loops and the dispatch path can be exercised without a
/// `python3` interpreter.
#[async_trait]
pub trait MutationSandbox: Send + Sync {
    async fn evaluate(&self, code_text: &str, mode: EvalMode) -> Result<String, SandboxError>;
    async fn static_check(&self, code_text: &str) -> Result<(), String>;
    /// Synchronous counterpart to [`MutationSandbox::evaluate`], for the
    /// host's `fuzz()` thread (`spec.md` §5: it only suspends blocking on
    /// **ready**, so evaluation there must not touch the tokio reactor).
    fn dispatch_blocking(&self, artifact_path: &Path) -> Result<String, SandboxError>;
}

/// Which invocation mode the evaluator runs the artifact's `mutate()` in,
/// per `spec.md` §4.3 Phase B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// All masks resolved to their `ori` literal.
    MaskRespecting,
    /// At least one mask resolved to a non-`ori` candidate.
    Random,
}

impl EvalMode {
    fn env_value(self) -> &'static str {
        match self {
            Self::MaskRespecting => "mask_respecting",
            Self::Random => "random",
        }
    }
}

/// Embedded driver: loads the artifact module by path, sets `CHILO_MASK_MODE`
/// so the artifact's own mask-substitution logic (if any) can branch on it,
/// calls `mutate()`, and prints the result on a single stdout line.
const DRIVER_SOURCE: &str = r#"
import importlib.util
import sys

artifact_path = sys.argv[1]
spec = importlib.util.spec_from_file_location("chilo_artifact", artifact_path)
module = importlib.util.module_from_spec(spec)
spec.loader.exec_module(module)

result = module.mutate()
sys.stdout.write(str(result).replace("\n", "\\n"))
sys.stdout.write("\n")
sys.stdout.flush()
"#;

/// Spawns a fresh `python3` process per evaluation. Simpler than a resident
/// fork server, and acceptable here because artifact evaluation happens off
/// the host's hot `fuzz()` path (in the fixer and in background dispatch),
/// not once per fuzzer iteration.
#[derive(Debug, Clone)]
pub struct Sandbox {
    python_bin: PathBuf,
    timeout: Duration,
}

impl Sandbox {
    pub fn new(python_bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout,
        }
    }

    async fn run_driver(
        &self,
        driver_path: &Path,
        artifact_path: &Path,
        mode: EvalMode,
    ) -> Result<String, SandboxError> {
        let mut child = Command::new(&self.python_bin)
            .arg(driver_path)
            .arg(artifact_path)
            .env("CHILO_MASK_MODE", mode.env_value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SandboxError::Spawn)?;

        // Proactively drop stdin so a runaway artifact can't block waiting on input.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::NonZeroExit {
                status: -1,
                stderr: "evaluator timed out".to_owned(),
            })?
            .map_err(SandboxError::Spawn)?;

        parse_driver_output(output)
    }
}

#[async_trait]
impl MutationSandbox for Sandbox {
    /// Writes `code_text` to a scratch file and invokes its `mutate()` in
    /// `mode`, returning the single line of output it produced.
    async fn evaluate(&self, code_text: &str, mode: EvalMode) -> Result<String, SandboxError> {
        let scratch = TempDir::new().map_err(|source| SandboxError::Write {
            path: std::env::temp_dir(),
            source,
        })?;
        let artifact_path = scratch.path().join("artifact.py");
        tokio::fs::write(&artifact_path, code_text)
            .await
            .map_err(|source| SandboxError::Write {
                path: artifact_path.clone(),
                source,
            })?;
        let driver_path = scratch.path().join("driver.py");
        tokio::fs::write(&driver_path, DRIVER_SOURCE)
            .await
            .map_err(|source| SandboxError::Write {
                path: driver_path.clone(),
                source,
            })?;

        self.run_driver(&driver_path, &artifact_path, mode).await
    }

    /// Static soundness check for Phase A (`spec.md` §4.5): compiles the
    /// artifact with `py_compile` without executing it. `Ok(())` means the
    /// checker passed; `Err(stderr)` carries the compiler's error text for
    /// the LLM repair prompt.
    async fn static_check(&self, code_text: &str) -> Result<(), String> {
        let scratch = match TempDir::new() {
            Ok(dir) => dir,
            Err(err) => return Err(err.to_string()),
        };
        let artifact_path = scratch.path().join("artifact.py");
        if let Err(err) = tokio::fs::write(&artifact_path, code_text).await {
            return Err(err.to_string());
        }

        let output = Command::new(&self.python_bin)
            .arg("-m")
            .arg("py_compile")
            .arg(&artifact_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(String::from_utf8_lossy(&output.stderr).into_owned()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Runs a previously registered artifact file directly, for normal
    /// dispatch outside the fixer (`spec.md` §4.4's serving path). Always
    /// random mode: the host wants a fresh mutated string, not a soundness
    /// probe. Runs a plain child process rather than going through the tokio
    /// reactor, since the calling thread is not a tokio worker.
    fn dispatch_blocking(&self, artifact_path: &Path) -> Result<String, SandboxError> {
        let scratch = TempDir::new().map_err(|source| SandboxError::Write {
            path: std::env::temp_dir(),
            source,
        })?;
        let driver_path = scratch.path().join("driver.py");
        std::fs::write(&driver_path, DRIVER_SOURCE).map_err(|source| SandboxError::Write {
            path: driver_path.clone(),
            source,
        })?;

        let output = std::process::Command::new(&self.python_bin)
            .arg(&driver_path)
            .arg(artifact_path)
            .env("CHILO_MASK_MODE", EvalMode::Random.env_value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(SandboxError::Spawn)?;

        parse_driver_output(output)
    }
}

fn parse_driver_output(output: std::process::Output) -> Result<String, SandboxError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(SandboxError::NonZeroExit {
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    let stdout = String::from_utf8(output.stdout).map_err(|_| SandboxError::InvalidUtf8)?;
    let first_line = stdout.lines().next().ok_or(SandboxError::EmptyOutput)?;
    if first_line.is_empty() {
        return Err(SandboxError::EmptyOutput);
    }
    Ok(first_line.replace("\\n", "\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sandbox() -> Sandbox {
        Sandbox::new("python3", Duration::from_secs(5))
    }

    #[test]
    fn eval_mode_env_values_are_distinct() {
        assert_ne!(
            EvalMode::MaskRespecting.env_value(),
            EvalMode::Random.env_value()
        );
    }

    #[test]
    fn sandbox_constructs_with_given_timeout() {
        let sandbox = fake_sandbox();
        assert_eq!(sandbox.timeout, Duration::from_secs(5));
    }
}
