//! Recipe graph, validation, evaluation and execution.
//!
//! This crate turns a parsed Runfile into a validated [`RecipeGraph`], resolves
//! variables lazily with memoized backtick captures, and runs recipes one line
//! at a time through a [`taskrun_shell::CommandRunner`].

pub mod evaluator;
pub mod events;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod validation;

pub use evaluator::{CaptureOrigin, Evaluator, Resolution, Scope};
pub use events::{EventEmitter, RunEvent};
pub use executor::{Executor, InvocationKey, RunConfig, RunContext, RunReport};
pub use functions::FunctionContext;
pub use graph::{DependencyEdge, RecipeGraph, RecipeId, RecipeNode};
pub use validation::{validate, Diagnostic, LintRule};
