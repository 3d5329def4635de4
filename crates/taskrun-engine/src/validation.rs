//! Static checks over a [`RecipeGraph`].
//!
//! Every rule runs before anything is evaluated or spawned. Error rules fail
//! with the matching [`TaskrunError`]; advisory rules return [`Diagnostic`]s.
//! Call [`validate`] to run them all in order.

use std::collections::HashSet;

use taskrun_syntax::{Expression, ParameterKind, Recipe};
use taskrun_types::{Result, TaskrunError};

use crate::functions;
use crate::graph::{find_cycle, RecipeGraph};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

/// A non-fatal finding, printed by `taskrun check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub rule: String,
    pub message: String,
    pub recipe: Option<String>,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Every expression in a recipe, paired with the parameter names visible to it.
fn recipe_expressions(recipe: &Recipe) -> Vec<(&Expression, Vec<&str>)> {
    let all: Vec<&str> = recipe.parameters.iter().map(|p| p.name.as_str()).collect();
    let mut out = Vec::new();

    for (i, parameter) in recipe.parameters.iter().enumerate() {
        if let ParameterKind::Default(expression) = &parameter.kind {
            // defaults see only the parameters bound before them
            out.push((expression, all[..i].to_vec()));
        }
    }
    for dependency in &recipe.dependencies {
        for argument in &dependency.arguments {
            out.push((argument, all.clone()));
        }
    }
    for line in &recipe.body {
        for expression in line.expressions() {
            out.push((expression, all.clone()));
        }
    }
    out
}

fn function_calls(expression: &Expression) -> Vec<(&str, usize)> {
    let mut calls = Vec::new();
    expression.walk(&mut |e| {
        if let Expression::Call { name, arguments } = e {
            calls.push((name.as_str(), arguments.len()));
        }
    });
    calls
}

fn check_call(name: &str, found: usize, referenced_by: &str) -> Result<()> {
    match functions::arity(name) {
        None => Err(TaskrunError::UnknownFunction {
            name: name.to_string(),
            referenced_by: Some(referenced_by.to_string()),
        }),
        Some(expected) if expected != found => Err(TaskrunError::Evaluation(format!(
            "function `{name}` takes {expected} argument(s) but got {found} in `{referenced_by}`"
        ))),
        Some(_) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Unique names, at most one variadic and only in last position, no required
/// parameter after a defaulted one.
struct ParameterShapeRule;
impl LintRule for ParameterShapeRule {
    fn name(&self) -> &str { "parameter_shape" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        for node in graph.all_nodes() {
            let parameters = &node.recipe.parameters;
            let invalid = |message: String| TaskrunError::InvalidParameters {
                recipe: node.name().to_string(),
                message,
            };
            let mut seen = HashSet::new();
            let mut after_default = false;
            for (i, parameter) in parameters.iter().enumerate() {
                if !seen.insert(parameter.name.as_str()) {
                    return Err(invalid(format!(
                        "parameter `{}` is declared more than once",
                        parameter.name
                    )));
                }
                match &parameter.kind {
                    kind if kind.is_variadic() && i + 1 != parameters.len() => {
                        return Err(invalid(format!(
                            "variadic parameter `{}` must be the last parameter",
                            parameter.name
                        )));
                    }
                    ParameterKind::Required if after_default => {
                        return Err(invalid(format!(
                            "required parameter `{}` follows a parameter with a default",
                            parameter.name
                        )));
                    }
                    ParameterKind::Default(_) => after_default = true,
                    _ => {}
                }
            }
        }
        Ok(vec![])
    }
}

struct KnownFunctionsRule;
impl LintRule for KnownFunctionsRule {
    fn name(&self) -> &str { "known_functions" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        for assignment in graph.assignments() {
            for (name, found) in function_calls(&assignment.expression) {
                check_call(name, found, &assignment.name)?;
            }
        }
        for node in graph.all_nodes() {
            for (expression, _) in recipe_expressions(&node.recipe) {
                for (name, found) in function_calls(expression) {
                    check_call(name, found, node.name())?;
                }
            }
        }
        Ok(vec![])
    }
}

struct KnownVariablesRule;
impl LintRule for KnownVariablesRule {
    fn name(&self) -> &str { "known_variables" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        let unknown = |name: &str, referenced_by: &str| TaskrunError::UnknownVariable {
            name: name.to_string(),
            referenced_by: Some(referenced_by.to_string()),
        };
        for assignment in graph.assignments() {
            for name in assignment.expression.variables() {
                if !graph.has_variable(name) {
                    return Err(unknown(name, &assignment.name));
                }
            }
        }
        for node in graph.all_nodes() {
            for (expression, parameters) in recipe_expressions(&node.recipe) {
                for name in expression.variables() {
                    if !parameters.contains(&name) && !graph.has_variable(name) {
                        return Err(unknown(name, node.name()));
                    }
                }
            }
        }
        Ok(vec![])
    }
}

struct VariableCycleRule;
impl LintRule for VariableCycleRule {
    fn name(&self) -> &str { "variable_cycle" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        let successors: Vec<Vec<usize>> = graph
            .assignments()
            .iter()
            .map(|a| {
                a.expression
                    .variables()
                    .into_iter()
                    .filter_map(|name| graph.variable_index(name))
                    .collect()
            })
            .collect();
        match find_cycle(&successors) {
            Some(cycle) => Err(TaskrunError::CyclicVariable {
                cycle: cycle
                    .into_iter()
                    .map(|i| graph.assignments()[i].name.clone())
                    .collect(),
            }),
            None => Ok(vec![]),
        }
    }
}

struct DependencyArityRule;
impl LintRule for DependencyArityRule {
    fn name(&self) -> &str { "dependency_arity" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        for node in graph.all_nodes() {
            for edge in &node.dependencies {
                let target = &graph.node(edge.target).recipe;
                if !target.accepts(edge.arguments.len()) {
                    return Err(TaskrunError::ArityError {
                        recipe: target.name.clone(),
                        found: edge.arguments.len(),
                        expected: target.arity_description(),
                    });
                }
            }
        }
        Ok(vec![])
    }
}

struct DependencyCycleRule;
impl LintRule for DependencyCycleRule {
    fn name(&self) -> &str { "dependency_cycle" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        let successors: Vec<Vec<usize>> = graph
            .all_nodes()
            .iter()
            .map(|n| n.dependencies.iter().map(|e| e.target).collect())
            .collect();
        match find_cycle(&successors) {
            Some(cycle) => Err(TaskrunError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|id| graph.node(id).name().to_string())
                    .collect(),
            }),
            None => Ok(vec![]),
        }
    }
}

struct UnusedVariableRule;
impl LintRule for UnusedVariableRule {
    fn name(&self) -> &str { "unused_variable" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        let mut used: HashSet<&str> = HashSet::new();
        for assignment in graph.assignments() {
            used.extend(assignment.expression.variables());
        }
        for node in graph.all_nodes() {
            for (expression, _) in recipe_expressions(&node.recipe) {
                used.extend(expression.variables());
            }
        }
        let exported: HashSet<&str> = graph
            .exported_variables()
            .map(|a| a.name.as_str())
            .collect();

        Ok(graph
            .assignments()
            .iter()
            .filter(|a| !used.contains(a.name.as_str()) && !exported.contains(a.name.as_str()))
            .map(|a| Diagnostic {
                rule: self.name().into(),
                message: format!("variable `{}` is never used", a.name),
                recipe: None,
            })
            .collect())
    }
}

struct EmptyRecipeRule;
impl LintRule for EmptyRecipeRule {
    fn name(&self) -> &str { "empty_recipe" }
    fn apply(&self, graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
        Ok(graph
            .all_nodes()
            .iter()
            .filter(|n| n.recipe.body.is_empty() && n.dependencies.is_empty())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                message: format!("recipe `{}` has no body and no dependencies", n.name()),
                recipe: Some(n.name().to_string()),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run every rule in order. Fails on the first error; otherwise returns the
/// advisory diagnostics.
pub fn validate(graph: &RecipeGraph) -> Result<Vec<Diagnostic>> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(ParameterShapeRule),
        Box::new(KnownFunctionsRule),
        Box::new(KnownVariablesRule),
        Box::new(VariableCycleRule),
        Box::new(DependencyArityRule),
        Box::new(DependencyCycleRule),
        Box::new(UnusedVariableRule),
        Box::new(EmptyRecipeRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        tracing::trace!(rule = rule.name(), "applying rule");
        diagnostics.extend(rule.apply(graph)?);
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
