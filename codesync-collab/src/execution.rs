//! Code execution sandbox.
//!
//! The relay never sees a failed execution: spawn errors, timeouts and
//! unsupported languages all come back as an [`ExecutionResult`] with the
//! `error` field set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default wall-clock limit for one run.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Languages the local sandbox knows about but refuses to run.
const REMOTE_ONLY_LANGUAGES: &[&str] = &["c", "cpp", "java", "go", "php", "ruby"];

/// Output of one run, delivered to every connection of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub error: String,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0} execution not supported locally. Use Judge0 or Docker.")]
    NotSupportedLocally(String),

    #[error("Unsupported language")]
    UnsupportedLanguage(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
}

/// Something that can run a snippet of source code.
#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn execute(&self, source: &str, language: &str)
        -> Result<ExecutionResult, ExecutionError>;
}

/// Run in `sandbox`, folding every failure into the result payload.
pub async fn run_in_sandbox(
    sandbox: &dyn ExecutionSandbox,
    source: &str,
    language: &str,
) -> ExecutionResult {
    match sandbox.execute(source, language).await {
        Ok(result) => result,
        Err(e) => {
            log::debug!("Execution of {language} snippet failed: {e}");
            ExecutionResult::failed(e.to_string())
        }
    }
}

/// Runs JavaScript and Python through locally installed interpreters.
#[derive(Debug, Clone)]
pub struct LocalProcessSandbox {
    timeout: Duration,
    node_program: String,
    python_program: String,
}

impl Default for LocalProcessSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_EXEC_TIMEOUT)
    }
}

impl LocalProcessSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            node_program: "node".to_string(),
            python_program: "python".to_string(),
        }
    }

    /// Override the interpreter used for `python`, e.g. `python3`.
    pub fn with_python(mut self, program: impl Into<String>) -> Self {
        self.python_program = program.into();
        self
    }

    pub fn with_node(mut self, program: impl Into<String>) -> Self {
        self.node_program = program.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interpreter and inline-code flag for a language.
    fn command_for(&self, language: &str) -> Result<(&str, &'static str), ExecutionError> {
        match language {
            "javascript" => Ok((self.node_program.as_str(), "-e")),
            "python" => Ok((self.python_program.as_str(), "-c")),
            lang if REMOTE_ONLY_LANGUAGES.contains(&lang) => {
                Err(ExecutionError::NotSupportedLocally(lang.to_uppercase()))
            }
            other => Err(ExecutionError::UnsupportedLanguage(other.to_string())),
        }
    }
}

#[async_trait]
impl ExecutionSandbox for LocalProcessSandbox {
    async fn execute(
        &self,
        source: &str,
        language: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        let (program, flag) = self.command_for(language)?;

        let child = Command::new(program)
            .arg(flag)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutionError::Timeout(self.timeout))?
            .map_err(|source| ExecutionError::Spawn {
                program: program.to_string(),
                source,
            })?;

        log::debug!(
            "{program} exited with {} ({} bytes stdout, {} bytes stderr)",
            output.status,
            output.stdout.len(),
            output.stderr.len()
        );

        Ok(ExecutionResult {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
            error: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
