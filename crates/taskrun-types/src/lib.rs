//! Shared error taxonomy for the taskrun recipe runner.
//!
//! Every other taskrun crate reports failures through [`TaskrunError`]. The
//! CLI turns an error into a process exit code with [`TaskrunError::exit_code`].

/// Unified error type for all taskrun subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TaskrunError {
    // === Parser Errors ===
    #[error("Parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    // === Document Errors ===
    #[error("Recipe `{name}` first defined on line {first_line} is redefined on line {line}")]
    DuplicateRecipe {
        name: String,
        first_line: usize,
        line: usize,
    },

    #[error("Variable `{name}` first defined on line {first_line} is redefined on line {line}")]
    DuplicateVariable {
        name: String,
        first_line: usize,
        line: usize,
    },

    #[error("Recipe `{recipe}` has invalid parameters: {message}")]
    InvalidParameters { recipe: String, message: String },

    #[error("Variable cycle detected: {}", .cycle.join(" -> "))]
    CyclicVariable { cycle: Vec<String> },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Unknown recipe `{name}`{}", referenced_by_suffix(.referenced_by))]
    UnknownRecipe {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("Unknown variable `{name}`{}", referenced_by_suffix(.referenced_by))]
    UnknownVariable {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("Unknown function `{name}`{}", referenced_by_suffix(.referenced_by))]
    UnknownFunction {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("Recipe `{recipe}` got {found} argument(s) but takes {expected}")]
    ArityError {
        recipe: String,
        found: usize,
        expected: String,
    },

    // === Execution Errors ===
    #[error("Recipe `{recipe}` failed on line {line} with exit code {code}")]
    SubprocessFailure {
        recipe: String,
        line: usize,
        command: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("Backtick `{command}` failed with exit code {code}")]
    CaptureFailed {
        command: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn referenced_by_suffix(referenced_by: &Option<String>) -> String {
    match referenced_by {
        Some(origin) => format!(" (referenced by `{origin}`)"),
        None => String::new(),
    }
}

impl TaskrunError {
    /// Process exit code for this error.
    ///
    /// Failed subprocesses surface their own exit code unchanged so callers
    /// can tell a failing linter from a failing test runner. Everything else
    /// maps to `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskrunError::SubprocessFailure { code, .. }
            | TaskrunError::CaptureFailed { code, .. } => {
                if *code == 0 {
                    1
                } else {
                    *code
                }
            }
            _ => 1,
        }
    }

    /// Trailing stderr captured from the failing subprocess, if any.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            TaskrunError::SubprocessFailure { stderr_tail, .. }
            | TaskrunError::CaptureFailed { stderr_tail, .. }
                if !stderr_tail.is_empty() =>
            {
                Some(stderr_tail.as_str())
            }
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, TaskrunError>`.
pub type Result<T> = std::result::Result<T, TaskrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse_error() {
        let err = TaskrunError::ParseError {
            line: 10,
            col: 5,
            message: "expected `:=`".into(),
            source_snippet: Some("name = value".into()),
        };
        assert_eq!(err.to_string(), "Parse error at line 10, col 5: expected `:=`");
    }

    #[test]
    fn error_display_cycles() {
        let err = TaskrunError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");

        let err = TaskrunError::CyclicVariable {
            cycle: vec!["x".into(), "x".into()],
        };
        assert_eq!(err.to_string(), "Variable cycle detected: x -> x");
    }

    #[test]
    fn error_display_unknown_recipe_with_origin() {
        let err = TaskrunError::UnknownRecipe {
            name: "lock".into(),
            referenced_by: Some("fmt".into()),
        };
        assert_eq!(
            err.to_string(),
            "Unknown recipe `lock` (referenced by `fmt`)"
        );
    }

    #[test]
    fn error_display_unknown_recipe_without_origin() {
        let err = TaskrunError::UnknownRecipe {
            name: "ghost".into(),
            referenced_by: None,
        };
        assert_eq!(err.to_string(), "Unknown recipe `ghost`");
    }

    #[test]
    fn error_display_arity() {
        let err = TaskrunError::ArityError {
            recipe: "lock".into(),
            found: 1,
            expected: "0".into(),
        };
        assert_eq!(
            err.to_string(),
            "Recipe `lock` got 1 argument(s) but takes 0"
        );
    }

    #[test]
    fn error_display_subprocess_failure() {
        let err = TaskrunError::SubprocessFailure {
            recipe: "lint".into(),
            line: 12,
            command: "ruff check".into(),
            code: 2,
            stderr_tail: "E501".into(),
        };
        assert_eq!(
            err.to_string(),
            "Recipe `lint` failed on line 12 with exit code 2"
        );
    }

    // --- exit_code ---

    #[test]
    fn exit_code_passes_subprocess_code_through() {
        let err = TaskrunError::SubprocessFailure {
            recipe: "unit".into(),
            line: 3,
            command: "pytest".into(),
            code: 5,
            stderr_tail: String::new(),
        };
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn exit_code_for_capture_failure() {
        let err = TaskrunError::CaptureFailed {
            command: "git describe".into(),
            code: 128,
            stderr_tail: "fatal: no names found".into(),
        };
        assert_eq!(err.exit_code(), 128);
        assert_eq!(err.stderr_tail(), Some("fatal: no names found"));
    }

    #[test]
    fn exit_code_never_reports_success_for_failure() {
        let err = TaskrunError::SubprocessFailure {
            recipe: "x".into(),
            line: 1,
            command: "true".into(),
            code: 0,
            stderr_tail: String::new(),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn exit_code_defaults_to_one() {
        let err = TaskrunError::Other("boom".into());
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.stderr_tail(), None);
    }

    // --- From impls ---

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TaskrunError = io_err.into();
        assert!(matches!(err, TaskrunError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TaskrunError = json_err.into();
        assert!(matches!(err, TaskrunError::Json(_)));
    }

    #[test]
    fn result_alias_err() {
        fn example() -> Result<()> {
            Err(TaskrunError::Other("fail".into()))
        }
        assert!(example().is_err());
    }
}
