//! Lazy, memoized expression evaluation.
//!
//! The evaluator never spawns processes. When an expression needs the output
//! of a backtick command, [`Evaluator`] returns [`Resolution::Pending`] with
//! the call to make; the caller runs it, hands the result to
//! [`Evaluator::record_capture`] and resolves again. Work already done is kept,
//! so each retry resumes where the previous attempt stopped.

use std::collections::{BTreeMap, HashMap};
use std::path::{PathBuf, MAIN_SEPARATOR};

use taskrun_shell::{ExecResult, ExternalCall};
use taskrun_syntax::{Expression, Fragment, Line};
use taskrun_types::{Result, TaskrunError};

use crate::functions::{self, FunctionContext};
use crate::graph::RecipeGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(String),
    Pending(ExternalCall),
}

/// Where a backtick was evaluated. Captures made for a variable live for the
/// whole run; captures made for a recipe line are dropped once the line is
/// built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CaptureOrigin {
    Variable(String),
    Line,
}

/// Parameter bindings for one recipe invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    values: HashMap<String, String>,
    exported: BTreeMap<String, String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: &str, value: String, export: bool) {
        if export {
            self.exported.insert(name.to_string(), value.clone());
        }
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Bound parameters that go into the line environment.
    pub fn exported(&self) -> &BTreeMap<String, String> {
        &self.exported
    }
}

/// Returns the ready value or propagates a pending capture to the caller.
macro_rules! ready {
    ($resolution:expr) => {
        match $resolution? {
            Resolution::Ready(value) => value,
            pending => return Ok(pending),
        }
    };
}

/// `a / b`: join with the platform separator unless `a` already ends in one.
fn join_path(lhs: &str, rhs: &str) -> String {
    if lhs.ends_with(MAIN_SEPARATOR) || lhs.ends_with('/') {
        format!("{lhs}{rhs}")
    } else {
        format!("{lhs}{MAIN_SEPARATOR}{rhs}")
    }
}

/// Per-run evaluation state: the variable cache and recorded captures.
pub struct Evaluator<'g> {
    graph: &'g RecipeGraph,
    functions: FunctionContext,
    working_dir: PathBuf,
    overrides: HashMap<String, String>,
    cache: HashMap<String, String>,
    captures: HashMap<(CaptureOrigin, String), String>,
    awaiting: Option<(CaptureOrigin, String)>,
    stack: Vec<String>,
}

impl<'g> Evaluator<'g> {
    /// `overrides` replace variable values before anything is evaluated.
    /// Overriding a variable that does not exist is an error.
    pub fn new(
        graph: &'g RecipeGraph,
        working_dir: PathBuf,
        invocation_dir: PathBuf,
        overrides: &[(String, String)],
    ) -> Result<Self> {
        let mut values = HashMap::new();
        for (name, value) in overrides {
            if !graph.has_variable(name) {
                return Err(TaskrunError::UnknownVariable {
                    name: name.clone(),
                    referenced_by: None,
                });
            }
            values.insert(name.clone(), value.clone());
        }
        Ok(Self {
            graph,
            functions: FunctionContext {
                runfile_directory: working_dir.clone(),
                invocation_directory: invocation_dir,
            },
            working_dir,
            overrides: values,
            cache: HashMap::new(),
            captures: HashMap::new(),
            awaiting: None,
            stack: Vec::new(),
        })
    }

    /// Resolve a top-level variable.
    pub fn resolve_variable(&mut self, name: &str) -> Result<Resolution> {
        self.stack.clear();
        self.variable(name)
    }

    /// Resolve an expression in a recipe scope (defaults, dependency arguments).
    pub fn resolve_expression(&mut self, expression: &Expression, scope: &Scope) -> Result<Resolution> {
        self.stack.clear();
        self.eval(expression, Some(scope), &CaptureOrigin::Line)
    }

    /// Interpolate a body line against `scope`.
    pub fn resolve_line(&mut self, line: &Line, scope: &Scope) -> Result<Resolution> {
        self.stack.clear();
        let mut text = String::new();
        for fragment in &line.fragments {
            match fragment {
                Fragment::Text(literal) => text.push_str(literal),
                Fragment::Interpolation(expression) => {
                    text.push_str(&ready!(self.eval(expression, Some(scope), &CaptureOrigin::Line)))
                }
            }
        }
        Ok(Resolution::Ready(text))
    }

    /// Feed back the result of the call returned by the last `Pending`.
    pub fn record_capture(&mut self, call: &ExternalCall, result: &ExecResult) -> Result<()> {
        let key = self
            .awaiting
            .take()
            .filter(|(_, command)| *command == call.command)
            .ok_or_else(|| {
                TaskrunError::Evaluation(format!("no capture pending for `{}`", call.command))
            })?;
        if !result.success() {
            return Err(TaskrunError::CaptureFailed {
                command: call.command.clone(),
                code: result.exit_code,
                stderr_tail: result.stderr_tail.clone(),
            });
        }
        tracing::debug!(command = %call.command, "captured backtick output");
        self.captures
            .insert(key, result.stdout.trim_end().to_string());
        Ok(())
    }

    /// Forget captures made while building a line or binding arguments.
    pub fn clear_line_captures(&mut self) {
        self.captures
            .retain(|(origin, _), _| !matches!(origin, CaptureOrigin::Line));
    }

    fn variable(&mut self, name: &str) -> Result<Resolution> {
        if let Some(value) = self.cache.get(name) {
            return Ok(Resolution::Ready(value.clone()));
        }
        if let Some(start) = self.stack.iter().position(|n| n == name) {
            let mut cycle = self.stack[start..].to_vec();
            cycle.push(name.to_string());
            return Err(TaskrunError::CyclicVariable { cycle });
        }

        let graph = self.graph;
        let assignment = graph
            .assignment(name)
            .ok_or_else(|| TaskrunError::UnknownVariable {
                name: name.to_string(),
                referenced_by: self.stack.last().cloned(),
            })?;

        let value = match self.overrides.get(name) {
            Some(value) => value.clone(),
            None => {
                self.stack.push(name.to_string());
                let origin = CaptureOrigin::Variable(name.to_string());
                let resolution = self.eval(&assignment.expression, None, &origin);
                self.stack.pop();
                ready!(resolution)
            }
        };

        tracing::debug!(variable = %name, "evaluated variable");
        self.cache.insert(name.to_string(), value.clone());
        Ok(Resolution::Ready(value))
    }

    fn eval(
        &mut self,
        expression: &Expression,
        scope: Option<&Scope>,
        origin: &CaptureOrigin,
    ) -> Result<Resolution> {
        let value = match expression {
            Expression::StringLiteral(s) => s.clone(),
            Expression::Variable(name) => match scope.and_then(|s| s.get(name)) {
                Some(bound) => bound.to_string(),
                None => ready!(self.variable(name)),
            },
            Expression::Backtick(command) => {
                let key = (origin.clone(), command.clone());
                match self.captures.get(&key) {
                    Some(output) => output.clone(),
                    None => {
                        let call = ExternalCall::through_shell(
                            &self.graph.settings().shell,
                            command.as_str(),
                            self.working_dir.clone(),
                        )?;
                        self.awaiting = Some(key);
                        return Ok(Resolution::Pending(call));
                    }
                }
            }
            Expression::Call { name, arguments } => {
                let mut values = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    values.push(ready!(self.eval(argument, scope, origin)));
                }
                functions::call(name, &values, &self.functions)?
            }
            Expression::Join(lhs, rhs) => {
                let lhs = ready!(self.eval(lhs, scope, origin));
                let rhs = ready!(self.eval(rhs, scope, origin));
                join_path(&lhs, &rhs)
            }
            Expression::Concat(lhs, rhs) => {
                let mut lhs = ready!(self.eval(lhs, scope, origin));
                lhs.push_str(&ready!(self.eval(rhs, scope, origin)));
                lhs
            }
            Expression::Group(inner) => ready!(self.eval(inner, scope, origin)),
        };
        Ok(Resolution::Ready(value))
    }
}
