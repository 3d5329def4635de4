use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use taskrun_types::Result;

use crate::environment::{CommandRunner, ExecResult, ExternalCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Capture,
    Stream,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub mode: CallMode,
    pub call: ExternalCall,
}

/// A [`CommandRunner`] that spawns nothing.
///
/// Every call is recorded in order. Commands succeed with empty output unless
/// a scripted result was registered for the exact command text.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<RecordedCall>>,
    scripted: HashMap<String, ExecResult>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `command` succeeds and prints `stdout`.
    pub fn with_output(mut self, command: &str, stdout: &str) -> Self {
        self.scripted.insert(
            command.to_string(),
            ExecResult {
                stdout: stdout.to_string(),
                ..Default::default()
            },
        );
        self
    }

    /// `command` exits with `code` after writing `stderr`.
    pub fn with_exit_code(mut self, command: &str, code: i32, stderr: &str) -> Self {
        self.scripted.insert(
            command.to_string(),
            ExecResult {
                stderr_tail: stderr.to_string(),
                exit_code: code,
                ..Default::default()
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Command text of every call, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.call.command).collect()
    }

    /// Command text of recipe lines only.
    pub fn streamed(&self) -> Vec<String> {
        self.commands_in(CallMode::Stream)
    }

    /// Command text of backtick captures only.
    pub fn captured(&self) -> Vec<String> {
        self.commands_in(CallMode::Capture)
    }

    fn commands_in(&self, mode: CallMode) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.mode == mode)
            .map(|c| c.call.command)
            .collect()
    }

    fn record(&self, mode: CallMode, call: &ExternalCall) -> ExecResult {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                mode,
                call: call.clone(),
            });
        let mut result = self.scripted.get(&call.command).cloned().unwrap_or_default();
        if mode == CallMode::Stream {
            result.stdout.clear();
        }
        result
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn capture(&self, call: &ExternalCall) -> Result<ExecResult> {
        Ok(self.record(CallMode::Capture, call))
    }

    async fn stream(&self, call: &ExternalCall) -> Result<ExecResult> {
        Ok(self.record(CallMode::Stream, call))
    }
}
