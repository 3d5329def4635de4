//! Process execution for taskrun.
//!
//! Provides the [`CommandRunner`] trait, the [`LocalCommandRunner`] that spawns
//! commands through the configured shell, and [`RecordingRunner`], a fake that
//! records calls without spawning anything.

pub mod environment;
pub mod local_env;
pub mod recording;
pub mod tail;

pub use environment::{CommandRunner, ExecResult, ExternalCall};
pub use local_env::LocalCommandRunner;
pub use recording::{CallMode, RecordedCall, RecordingRunner};
pub use tail::{tail_lines, StderrTail};
