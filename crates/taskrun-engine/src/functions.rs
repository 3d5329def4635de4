//! Builtin functions callable from expressions.

use std::path::{Path, PathBuf};

use taskrun_types::{Result, TaskrunError};

/// Directories the path functions report.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub runfile_directory: PathBuf,
    pub invocation_directory: PathBuf,
}

const FUNCTIONS: &[(&str, usize)] = &[
    ("arch", 0),
    ("env_var", 1),
    ("env_var_or_default", 2),
    ("invocation_directory", 0),
    ("lowercase", 1),
    ("os", 0),
    ("runfile_directory", 0),
    ("trim", 1),
    ("uppercase", 1),
];

/// Number of arguments a builtin takes, or `None` if no such builtin exists.
pub fn arity(name: &str) -> Option<usize> {
    FUNCTIONS
        .iter()
        .find(|(function, _)| *function == name)
        .map(|&(_, arity)| arity)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn call(name: &str, arguments: &[String], context: &FunctionContext) -> Result<String> {
    match (name, arguments) {
        ("arch", []) => Ok(std::env::consts::ARCH.to_string()),
        ("os", []) => Ok(std::env::consts::OS.to_string()),
        ("env_var", [key]) => std::env::var(key).map_err(|_| {
            TaskrunError::Evaluation(format!("environment variable `{key}` not present"))
        }),
        ("env_var_or_default", [key, default]) => {
            Ok(std::env::var(key).unwrap_or_else(|_| default.clone()))
        }
        ("runfile_directory", []) => Ok(path_string(&context.runfile_directory)),
        ("invocation_directory", []) => Ok(path_string(&context.invocation_directory)),
        ("uppercase", [s]) => Ok(s.to_uppercase()),
        ("lowercase", [s]) => Ok(s.to_lowercase()),
        ("trim", [s]) => Ok(s.trim().to_string()),
        _ => match arity(name) {
            Some(expected) => Err(TaskrunError::Evaluation(format!(
                "function `{name}` takes {expected} argument(s) but got {}",
                arguments.len()
            ))),
            None => Err(TaskrunError::UnknownFunction {
                name: name.to_string(),
                referenced_by: None,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> FunctionContext {
        FunctionContext {
            runfile_directory: PathBuf::from("/project"),
            invocation_directory: PathBuf::from("/project/src"),
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn string_functions() {
        let ctx = context();
        assert_eq!(call("uppercase", &args(&["abc"]), &ctx).unwrap(), "ABC");
        assert_eq!(call("lowercase", &args(&["AbC"]), &ctx).unwrap(), "abc");
        assert_eq!(call("trim", &args(&["  x \n"]), &ctx).unwrap(), "x");
    }

    #[test]
    fn platform_functions() {
        let ctx = context();
        assert_eq!(call("os", &[], &ctx).unwrap(), std::env::consts::OS);
        assert_eq!(call("arch", &[], &ctx).unwrap(), std::env::consts::ARCH);
    }

    #[test]
    fn directory_functions() {
        let ctx = context();
        assert_eq!(call("runfile_directory", &[], &ctx).unwrap(), "/project");
        assert_eq!(call("invocation_directory", &[], &ctx).unwrap(), "/project/src");
    }

    #[test]
    fn env_var_or_default_falls_back() {
        let ctx = context();
        let value = call(
            "env_var_or_default",
            &args(&["TASKRUN_SURELY_UNSET_VARIABLE", "fallback"]),
            &ctx,
        )
        .unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn env_var_missing_is_an_error() {
        let err = call("env_var", &args(&["TASKRUN_SURELY_UNSET_VARIABLE"]), &context())
            .unwrap_err();
        assert!(matches!(err, TaskrunError::Evaluation(_)));
    }

    #[test]
    fn unknown_and_misused_functions() {
        let ctx = context();
        assert!(matches!(
            call("nope", &[], &ctx),
            Err(TaskrunError::UnknownFunction { .. })
        ));
        assert!(matches!(
            call("uppercase", &[], &ctx),
            Err(TaskrunError::Evaluation(_))
        ));
        assert_eq!(arity("env_var_or_default"), Some(2));
        assert_eq!(arity("nope"), None);
    }
}
