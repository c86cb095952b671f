//! Typed errors for each fallible subsystem.
//!
//! Library code returns these; only the CLI binary wraps them in `anyhow`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file {path} as YAML")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("output directory {path} already exists and is not empty")]
    DirtyOutputDir { path: PathBuf },

    #[error("preparing directory {path}")]
    PrepareDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM transport error after {attempts} attempt(s)")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("LLM returned HTTP status {status}")]
    Status { status: u16, body: String },

    #[error("LLM response contained no fenced `{tag}` block")]
    NoFencedBlock { tag: &'static str },
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("writing scratch artifact to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spawning sandbox evaluator")]
    Spawn(#[source] std::io::Error),

    #[error("sandbox evaluator exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },

    #[error("sandbox evaluator produced no output line")]
    EmptyOutput,

    #[error("sandbox evaluator output was not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum FixerError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("static checker reported errors after {attempts} attempt(s): {last_errors}")]
    StaticCheckExhausted { attempts: u32, last_errors: String },

    #[error("execution-soundness check failed after {attempts} attempt(s): {last_error}")]
    ExecutionCheckExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Error)]
pub enum ChiloError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Fixer(#[from] FixerError),

    #[error("writing telemetry row to {path}")]
    Telemetry {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}
