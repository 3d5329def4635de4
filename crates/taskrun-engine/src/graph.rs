use std::collections::HashMap;

use taskrun_syntax::{Assignment, Document, Expression, Item, Recipe, Settings};
use taskrun_types::{Result, TaskrunError};

/// Index of a recipe in the graph arena.
pub type RecipeId = usize;

#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub target: RecipeId,
    /// Argument expressions, evaluated in the dependent recipe's scope.
    pub arguments: Vec<Expression>,
}

#[derive(Debug, Clone)]
pub struct RecipeNode {
    pub id: RecipeId,
    pub recipe: Recipe,
    pub dependencies: Vec<DependencyEdge>,
}

impl RecipeNode {
    pub fn name(&self) -> &str {
        &self.recipe.name
    }
}

/// Recipes in declaration order plus their resolved dependency edges.
///
/// Recipe definitions are never mutated during a run; per-run state such as
/// "already ran" lives with the executor.
#[derive(Debug, Clone)]
pub struct RecipeGraph {
    nodes: Vec<RecipeNode>,
    index: HashMap<String, RecipeId>,
    assignments: Vec<Assignment>,
    variables: HashMap<String, usize>,
    settings: Settings,
}

impl RecipeGraph {
    /// Build the graph, rejecting duplicate names and dependencies on
    /// recipes that do not exist.
    pub fn from_document(document: Document) -> Result<Self> {
        let settings = document.settings();
        let mut assignments: Vec<Assignment> = Vec::new();
        let mut variables: HashMap<String, usize> = HashMap::new();
        let mut recipes: Vec<Recipe> = Vec::new();
        let mut index: HashMap<String, RecipeId> = HashMap::new();

        for item in document.items {
            match item {
                Item::Assignment(assignment) => {
                    if let Some(&first) = variables.get(&assignment.name) {
                        return Err(TaskrunError::DuplicateVariable {
                            name: assignment.name,
                            first_line: assignments[first].line,
                            line: assignment.line,
                        });
                    }
                    variables.insert(assignment.name.clone(), assignments.len());
                    assignments.push(assignment);
                }
                Item::Recipe(recipe) => {
                    if let Some(&first) = index.get(&recipe.name) {
                        return Err(TaskrunError::DuplicateRecipe {
                            name: recipe.name,
                            first_line: recipes[first].line,
                            line: recipe.line,
                        });
                    }
                    index.insert(recipe.name.clone(), recipes.len());
                    recipes.push(recipe);
                }
                Item::Setting(_) => {}
            }
        }

        let mut nodes = Vec::with_capacity(recipes.len());
        for (id, recipe) in recipes.into_iter().enumerate() {
            let mut dependencies = Vec::with_capacity(recipe.dependencies.len());
            for dependency in &recipe.dependencies {
                let target = *index.get(&dependency.recipe).ok_or_else(|| {
                    TaskrunError::UnknownRecipe {
                        name: dependency.recipe.clone(),
                        referenced_by: Some(recipe.name.clone()),
                    }
                })?;
                dependencies.push(DependencyEdge {
                    target,
                    arguments: dependency.arguments.clone(),
                });
            }
            nodes.push(RecipeNode {
                id,
                recipe,
                dependencies,
            });
        }

        tracing::debug!(
            recipes = nodes.len(),
            variables = assignments.len(),
            "built recipe graph"
        );

        Ok(Self {
            nodes,
            index,
            assignments,
            variables,
            settings,
        })
    }

    /// Parse Runfile source and build its graph.
    pub fn parse(source: &str) -> Result<Self> {
        Self::from_document(taskrun_syntax::parse(source)?)
    }

    pub fn node(&self, id: RecipeId) -> &RecipeNode {
        &self.nodes[id]
    }

    pub fn lookup(&self, name: &str) -> Option<&RecipeNode> {
        self.index.get(name).map(|&id| &self.nodes[id])
    }

    pub fn recipe_id(&self, name: &str) -> Result<RecipeId> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| TaskrunError::UnknownRecipe {
                name: name.to_string(),
                referenced_by: None,
            })
    }

    pub fn all_nodes(&self) -> &[RecipeNode] {
        &self.nodes
    }

    pub fn default_recipe(&self) -> Option<&RecipeNode> {
        self.nodes.first()
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn assignment(&self, name: &str) -> Option<&Assignment> {
        self.variables.get(name).map(|&i| &self.assignments[i])
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Index of a variable in declaration order.
    pub(crate) fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.get(name).copied()
    }

    /// Variables exported to every line subprocess.
    pub fn exported_variables(&self) -> impl Iterator<Item = &Assignment> {
        let all = self.settings.export_all;
        self.assignments.iter().filter(move |a| all || a.export)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Three-colour depth-first search. Returns the first cycle found as a path
/// that starts and ends on the same node, e.g. `[a, b, a]`.
pub(crate) fn find_cycle(successors: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn visit(
        node: usize,
        successors: &[Vec<usize>],
        colours: &mut [Colour],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colours[node] = Colour::Grey;
        stack.push(node);
        for &next in &successors[node] {
            match colours[next] {
                Colour::Grey => {
                    let start = stack.iter().position(|&n| n == next)?;
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Colour::White => {
                    if let Some(cycle) = visit(next, successors, colours, stack) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }
        stack.pop();
        colours[node] = Colour::Black;
        None
    }

    let mut colours = vec![Colour::White; successors.len()];
    let mut stack = Vec::new();
    for start in 0..successors.len() {
        if colours[start] == Colour::White {
            if let Some(cycle) = visit(start, successors, &mut colours, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
