use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use taskrun_types::{Result, TaskrunError};

/// A single shell invocation: `program args... command`, run in `working_dir`
/// with `env` layered over the inherited process environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalCall {
    pub program: String,
    pub args: Vec<String>,
    pub command: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ExternalCall {
    /// Build a call from a shell setting such as `["sh", "-cu"]`.
    pub fn through_shell(
        shell: &[String],
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let (program, args) = shell
            .split_first()
            .ok_or_else(|| TaskrunError::Other("`set shell` must name a program".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        })
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Result of executing a shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured stdout. Empty when stdout was inherited.
    pub stdout: String,
    /// Last lines written to stderr.
    pub stderr_tail: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over how taskrun spawns processes.
///
/// `capture` is used for backtick expressions and collects stdout. `stream`
/// is used for recipe lines: stdout goes straight to the caller's terminal
/// and stderr is forwarded while its tail is kept for error reports.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn capture(&self, call: &ExternalCall) -> Result<ExecResult>;
    async fn stream(&self, call: &ExternalCall) -> Result<ExecResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn through_shell_splits_program_and_args() {
        let shell = vec!["bash".to_string(), "-euc".to_string()];
        let call = ExternalCall::through_shell(&shell, "echo hi", "/tmp").unwrap();
        assert_eq!(call.program, "bash");
        assert_eq!(call.args, vec!["-euc".to_string()]);
        assert_eq!(call.command, "echo hi");
        assert_eq!(call.working_dir, PathBuf::from("/tmp"));
        assert!(call.env.is_empty());
    }

    #[test]
    fn empty_shell_is_rejected() {
        let err = ExternalCall::through_shell(&[], "echo hi", "/tmp").unwrap_err();
        assert!(err.to_string().contains("set shell"));
    }

    #[test]
    fn with_env_replaces_environment() {
        let shell = vec!["sh".to_string(), "-cu".to_string()];
        let mut env = BTreeMap::new();
        env.insert("uv".to_string(), "path/to/uv".to_string());
        let call = ExternalCall::through_shell(&shell, "true", "/")
            .unwrap()
            .with_env(env);
        assert_eq!(call.env.get("uv").map(String::as_str), Some("path/to/uv"));
    }

    #[test]
    fn exec_result_success() {
        let ok = ExecResult::default();
        assert!(ok.success());
        let failed = ExecResult {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
