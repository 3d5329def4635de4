//! Recipe execution: bind, plan, then run every line in order.
//!
//! A run is strictly sequential. Arguments are bound before anything is
//! evaluated, the plan is built depth-first with dependencies ahead of their
//! dependents, and the first failing line aborts the run with its exit code.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use taskrun_shell::{CommandRunner, ExternalCall};
use taskrun_syntax::{ParameterKind, Recipe};
use taskrun_types::{Result, TaskrunError};

use crate::evaluator::{Evaluator, Resolution, Scope};
use crate::events::{EventEmitter, RunEvent};
use crate::graph::{RecipeGraph, RecipeId};
use crate::validation::validate;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Configuration for a run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Directory every line runs in. Reported by `runfile_directory()`.
    pub working_dir: PathBuf,
    /// Reported by `invocation_directory()`.
    pub invocation_dir: PathBuf,
    /// Print each line instead of running it. Backticks still run.
    pub dry_run: bool,
    /// Never echo lines.
    pub quiet: bool,
    /// `--set NAME VALUE` pairs, applied before evaluation.
    pub overrides: Vec<(String, String)>,
}

impl RunConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        Self {
            invocation_dir: working_dir.clone(),
            working_dir,
            ..Default::default()
        }
    }
}

/// One unit of work: a recipe together with its bound arguments. Two
/// invocations with the same key run once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InvocationKey {
    pub recipe: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Invocations in the order they ran.
    pub invocations: Vec<InvocationKey>,
    pub lines_run: usize,
    pub duration_ms: u64,
}

/// Exported environment and working directory shared by every line of a run.
/// The environment is resolved on first use.
#[derive(Debug)]
pub struct RunContext {
    pub working_dir: PathBuf,
    environment: Option<BTreeMap<String, String>>,
}

impl RunContext {
    fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            environment: None,
        }
    }

    /// Run-wide exports with the invocation's exported parameters on top.
    fn environment_for(&self, scope: &Scope) -> BTreeMap<String, String> {
        let mut env = self.environment.clone().unwrap_or_default();
        env.extend(
            scope
                .exported()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        env
    }
}

struct Invocation {
    id: RecipeId,
    key: InvocationKey,
    scope: Scope,
}

/// Planned invocations in run order. Each skipped key remembers how many
/// invocations were planned before it, so its event fires at that point.
#[derive(Default)]
struct Plan {
    invocations: Vec<Invocation>,
    skipped: Vec<(usize, InvocationKey)>,
    visited: HashSet<InvocationKey>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_arity(recipe: &Recipe, found: usize) -> Result<()> {
    if recipe.accepts(found) {
        Ok(())
    } else {
        Err(TaskrunError::ArityError {
            recipe: recipe.name.clone(),
            found,
            expected: recipe.arity_description(),
        })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Drives one graph through a [`CommandRunner`].
pub struct Executor<'g> {
    graph: &'g RecipeGraph,
    runner: Arc<dyn CommandRunner>,
    config: RunConfig,
    emitter: EventEmitter,
}

impl<'g> Executor<'g> {
    pub fn new(graph: &'g RecipeGraph, runner: Arc<dyn CommandRunner>, config: RunConfig) -> Self {
        Self {
            graph,
            runner,
            config,
            emitter: EventEmitter::default(),
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Run `target` (the first recipe when `None`) with positional `arguments`.
    pub async fn run(&self, target: Option<&str>, arguments: &[String]) -> Result<RunReport> {
        let start = Instant::now();
        validate(self.graph)?;

        let root = match target {
            Some(name) => self.graph.recipe_id(name)?,
            None => self
                .graph
                .default_recipe()
                .map(|node| node.id)
                .ok_or_else(|| TaskrunError::Other("Runfile contains no recipes".into()))?,
        };
        let root_recipe = &self.graph.node(root).recipe;
        check_arity(root_recipe, arguments.len())?;

        self.emitter.emit(RunEvent::RunStarted {
            target: root_recipe.name.clone(),
            arguments: arguments.to_vec(),
        });
        tracing::info!(recipe = %root_recipe.name, arguments = arguments.len(), "starting run");

        match self.execute(root, arguments).await {
            Ok(mut report) => {
                report.duration_ms = start.elapsed().as_millis() as u64;
                self.emitter.emit(RunEvent::RunCompleted {
                    target: root_recipe.name.clone(),
                    invocations: report.invocations.len(),
                    duration_ms: report.duration_ms,
                });
                tracing::info!(
                    recipe = %root_recipe.name,
                    invocations = report.invocations.len(),
                    duration_ms = report.duration_ms,
                    "run completed"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(recipe = %root_recipe.name, error = %err, "run failed");
                self.emitter.emit(RunEvent::RunFailed {
                    target: root_recipe.name.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Resolve variables in declaration order, or only `names` when given.
    pub async fn evaluate(&self, names: &[String]) -> Result<Vec<(String, String)>> {
        validate(self.graph)?;
        let mut evaluator = self.evaluator()?;
        let selected: Vec<String> = if names.is_empty() {
            self.graph
                .assignments()
                .iter()
                .map(|a| a.name.clone())
                .collect()
        } else {
            names.to_vec()
        };

        let mut values = Vec::with_capacity(selected.len());
        for name in selected {
            let value = self
                .settle(&mut evaluator, |ev| ev.resolve_variable(&name))
                .await?;
            values.push((name, value));
        }
        Ok(values)
    }

    fn evaluator(&self) -> Result<Evaluator<'g>> {
        Evaluator::new(
            self.graph,
            self.config.working_dir.clone(),
            self.config.invocation_dir.clone(),
            &self.config.overrides,
        )
    }

    async fn execute(&self, root: RecipeId, arguments: &[String]) -> Result<RunReport> {
        let mut evaluator = self.evaluator()?;

        let mut plan = Plan::default();
        self.visit(&mut evaluator, root, arguments.to_vec(), &mut plan)
            .await?;
        tracing::debug!(
            invocations = plan.invocations.len(),
            skipped = plan.skipped.len(),
            "planned run"
        );

        let mut context = RunContext::new(self.config.working_dir.clone());
        let mut report = RunReport::default();
        let mut skipped = plan.skipped.into_iter().peekable();
        for (position, invocation) in plan.invocations.iter().enumerate() {
            while let Some((_, key)) = skipped.next_if(|(at, _)| *at <= position) {
                self.skip(key);
            }
            self.run_invocation(&mut evaluator, &mut context, invocation, &mut report)
                .await?;
            report.invocations.push(invocation.key.clone());
        }
        for (_, key) in skipped {
            self.skip(key);
        }
        Ok(report)
    }

    fn skip(&self, key: InvocationKey) {
        tracing::debug!(recipe = %key.recipe, arguments = ?key.arguments, "already ran, skipping");
        self.emitter.emit(RunEvent::RecipeSkipped {
            recipe: key.recipe,
            arguments: key.arguments,
        });
    }

    /// Depth-first planning: dependencies are appended before the recipe
    /// that needs them. An invocation whose bound arguments were already
    /// planned is skipped.
    async fn visit(
        &self,
        evaluator: &mut Evaluator<'g>,
        id: RecipeId,
        arguments: Vec<String>,
        plan: &mut Plan,
    ) -> Result<()> {
        let node = self.graph.node(id);
        check_arity(&node.recipe, arguments.len())?;
        let (scope, bound) = self.bind(evaluator, &node.recipe, &arguments).await?;

        let key = InvocationKey {
            recipe: node.name().to_string(),
            arguments: bound,
        };
        if !plan.visited.insert(key.clone()) {
            plan.skipped.push((plan.invocations.len(), key));
            return Ok(());
        }

        for edge in &node.dependencies {
            let mut dependency_arguments = Vec::with_capacity(edge.arguments.len());
            for expression in &edge.arguments {
                let value = self
                    .settle(evaluator, |ev| ev.resolve_expression(expression, &scope))
                    .await?;
                dependency_arguments.push(value);
            }
            evaluator.clear_line_captures();
            Box::pin(self.visit(evaluator, edge.target, dependency_arguments, plan)).await?;
        }

        plan.invocations.push(Invocation { id, key, scope });
        Ok(())
    }

    /// Bind positional arguments to parameters. Trailing arguments go to the
    /// variadic parameter, joined with spaces; missing defaulted parameters are
    /// evaluated with the parameters bound so far in scope.
    ///
    /// Also returns the bound values in parameter order, variadic arguments
    /// kept separate, for use as the invocation key.
    async fn bind(
        &self,
        evaluator: &mut Evaluator<'g>,
        recipe: &'g Recipe,
        arguments: &[String],
    ) -> Result<(Scope, Vec<String>)> {
        let export_all = self.graph.settings().export_all;
        let mut scope = Scope::new();
        let mut bound = Vec::with_capacity(recipe.parameters.len());

        for (i, parameter) in recipe.parameters.iter().enumerate() {
            let value = match &parameter.kind {
                ParameterKind::Star | ParameterKind::Plus => {
                    let rest = arguments.get(i..).unwrap_or_default();
                    bound.extend(rest.iter().cloned());
                    rest.join(" ")
                }
                ParameterKind::Default(expression) => {
                    let value = match arguments.get(i) {
                        Some(value) => value.clone(),
                        None => {
                            let scope = &scope;
                            self.settle(evaluator, |ev| ev.resolve_expression(expression, scope))
                                .await?
                        }
                    };
                    bound.push(value.clone());
                    value
                }
                ParameterKind::Required => {
                    let value = arguments.get(i).cloned().ok_or_else(|| {
                        TaskrunError::ArityError {
                            recipe: recipe.name.clone(),
                            found: arguments.len(),
                            expected: recipe.arity_description(),
                        }
                    })?;
                    bound.push(value.clone());
                    value
                }
            };
            scope.bind(&parameter.name, value, parameter.export || export_all);
        }
        evaluator.clear_line_captures();
        Ok((scope, bound))
    }

    async fn run_invocation(
        &self,
        evaluator: &mut Evaluator<'g>,
        context: &mut RunContext,
        invocation: &Invocation,
        report: &mut RunReport,
    ) -> Result<()> {
        let recipe = &self.graph.node(invocation.id).recipe;
        let started = Instant::now();
        self.emitter.emit(RunEvent::RecipeStarted {
            recipe: recipe.name.clone(),
            arguments: invocation.key.arguments.clone(),
        });
        tracing::info!(recipe = %recipe.name, arguments = ?invocation.key.arguments, "running recipe");

        for line in &recipe.body {
            let command = self
                .settle(evaluator, |ev| ev.resolve_line(line, &invocation.scope))
                .await?;
            evaluator.clear_line_captures();

            if self.config.dry_run {
                eprintln!("{command}");
                continue;
            }
            // `@` on a line inverts the recipe's own echo setting
            if !self.config.quiet && recipe.quiet == line.echo_toggle {
                eprintln!("{command}");
            }

            if context.environment.is_none() {
                context.environment = Some(self.exported_environment(evaluator).await?);
            }
            let call = ExternalCall::through_shell(
                &self.graph.settings().shell,
                command.as_str(),
                context.working_dir.clone(),
            )?
            .with_env(context.environment_for(&invocation.scope));

            self.emitter.emit(RunEvent::LineStarted {
                recipe: recipe.name.clone(),
                line: line.number,
                command: command.clone(),
            });
            tracing::debug!(recipe = %recipe.name, line = line.number, command = %command, "running line");

            let result = self.runner.stream(&call).await?;
            report.lines_run += 1;
            if !result.success() {
                tracing::warn!(
                    recipe = %recipe.name,
                    line = line.number,
                    code = result.exit_code,
                    "line failed"
                );
                return Err(TaskrunError::SubprocessFailure {
                    recipe: recipe.name.clone(),
                    line: line.number,
                    command,
                    code: result.exit_code,
                    stderr_tail: result.stderr_tail,
                });
            }
        }

        self.emitter.emit(RunEvent::RecipeCompleted {
            recipe: recipe.name.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    async fn exported_environment(
        &self,
        evaluator: &mut Evaluator<'g>,
    ) -> Result<BTreeMap<String, String>> {
        let mut exports = BTreeMap::new();
        for assignment in self.graph.exported_variables() {
            let name = assignment.name.as_str();
            let value = self
                .settle(evaluator, |ev| ev.resolve_variable(name))
                .await?;
            exports.insert(assignment.name.clone(), value);
        }
        tracing::debug!(exports = exports.len(), "resolved exported environment");
        Ok(exports)
    }

    /// Resolve until ready, performing each pending capture through the runner.
    async fn settle<F>(&self, evaluator: &mut Evaluator<'g>, mut step: F) -> Result<String>
    where
        F: FnMut(&mut Evaluator<'g>) -> Result<Resolution>,
    {
        loop {
            match step(evaluator)? {
                Resolution::Ready(value) => return Ok(value),
                Resolution::Pending(call) => {
                    tracing::debug!(command = %call.command, "running backtick");
                    let result = self.runner.capture(&call).await?;
                    evaluator.record_capture(&call, &result)?;
                }
            }
        }
    }
}
