use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use taskrun_types::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::environment::{CommandRunner, ExecResult, ExternalCall};
use crate::tail::{tail_lines, StderrTail, DEFAULT_TAIL_LINES};

/// Runs commands on the local machine through the configured shell.
pub struct LocalCommandRunner {
    tail_lines: usize,
}

impl LocalCommandRunner {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    fn command(call: &ExternalCall) -> Command {
        let mut cmd = Command::new(&call.program);
        cmd.args(&call.args)
            .arg(&call.command)
            .current_dir(&call.working_dir)
            .envs(&call.env)
            .stdin(Stdio::inherit());
        cmd
    }
}

impl Default for LocalCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Exit code of a finished child. A child killed by a signal reports
/// `128 + signal`, the shell convention.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn capture(&self, call: &ExternalCall) -> Result<ExecResult> {
        tracing::debug!(command = %call.command, cwd = %call.working_dir.display(), "capturing");
        let start = Instant::now();

        let mut cmd = Self::command(call);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = cmd.output().await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr_tail: tail_lines(&stderr, self.tail_lines),
            exit_code: exit_code(output.status),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, call: &ExternalCall) -> Result<ExecResult> {
        tracing::debug!(command = %call.command, cwd = %call.working_dir.display(), "spawning");
        let start = Instant::now();

        let mut cmd = Self::command(call);
        cmd.stdout(Stdio::inherit()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        // Forward stderr as it arrives and keep the tail for error reports.
        // Forwarding or read failures never skip the wait below.
        let mut tail = StderrTail::new(self.tail_lines);
        if let Some(stderr) = child.stderr.take() {
            let mut sink = tokio::io::stderr();
            drain_stderr(BufReader::new(stderr), &mut sink, &mut tail).await;
        }

        let status = child.wait().await?;
        Ok(ExecResult {
            stdout: String::new(),
            stderr_tail: tail.render(),
            exit_code: exit_code(status),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Copy `reader` into `sink` line by line, recording every line in `tail`.
/// Once `sink` fails, lines are still read and recorded so the child never
/// blocks on a full pipe.
async fn drain_stderr<R, W>(mut reader: R, sink: &mut W, tail: &mut StderrTail)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut forwarding = true;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "reading child stderr failed");
                break;
            }
        }
        if forwarding {
            if let Err(err) = sink.write_all(&buf).await {
                tracing::warn!(error = %err, "forwarding child stderr failed");
                forwarding = false;
            }
        }
        tail.push(&String::from_utf8_lossy(&buf));
    }
    if forwarding {
        let _ = sink.flush().await;
    }
}
