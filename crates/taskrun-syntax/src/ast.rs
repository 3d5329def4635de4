use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed Runfile: top-level items in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Item {
    Assignment(Assignment),
    Recipe(Recipe),
    Setting(Setting),
}

/// `name := expr` or `export name := expr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub expression: Expression,
    pub export: bool,
    pub doc: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    /// `set shell := ["bash", "-cu"]`
    Shell(Vec<String>),
    /// `set export` / `set export := false`
    Export(bool),
}

/// Effective document settings after folding every `set` item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub shell: Vec<String>,
    pub export_all: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shell: vec!["sh".to_string(), "-cu".to_string()],
            export_all: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub doc: Option<String>,
    /// Declared with a leading `@`: body lines are not echoed.
    pub quiet: bool,
    pub parameters: Vec<Parameter>,
    pub dependencies: Vec<Dependency>,
    pub body: Vec<Line>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    /// Declared as `$name`: the bound value is exported to the recipe's lines.
    pub export: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Required,
    Default(Expression),
    /// `*name`: zero or more trailing arguments.
    Star,
    /// `+name`: one or more trailing arguments.
    Plus,
}

impl ParameterKind {
    pub fn is_variadic(&self) -> bool {
        matches!(self, ParameterKind::Star | ParameterKind::Plus)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub recipe: String,
    pub arguments: Vec<Expression>,
}

/// One command line of a recipe body. Continuation lines are folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub number: usize,
    /// Line started with `@`: inverts the recipe's echo behaviour.
    pub echo_toggle: bool,
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fragment {
    Text(String),
    Interpolation(Expression),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    StringLiteral(String),
    Variable(String),
    /// `` `cmd` ``: captured stdout of a shell command.
    Backtick(String),
    Call {
        name: String,
        arguments: Vec<Expression>,
    },
    /// `a / b`
    Join(Box<Expression>, Box<Expression>),
    /// `a + b`
    Concat(Box<Expression>, Box<Expression>),
    Group(Box<Expression>),
}

// --- Document accessors ---

impl Document {
    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.items.iter().filter_map(|item| match item {
            Item::Assignment(a) => Some(a),
            _ => None,
        })
    }

    pub fn recipes(&self) -> impl Iterator<Item = &Recipe> {
        self.items.iter().filter_map(|item| match item {
            Item::Recipe(r) => Some(r),
            _ => None,
        })
    }

    pub fn assignment(&self, name: &str) -> Option<&Assignment> {
        self.assignments().find(|a| a.name == name)
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes().find(|r| r.name == name)
    }

    /// Fold every `set` item in order; later settings win.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        for item in &self.items {
            if let Item::Setting(setting) = item {
                match setting {
                    Setting::Shell(command) => settings.shell = command.clone(),
                    Setting::Export(on) => settings.export_all = *on,
                }
            }
        }
        settings
    }
}

// --- Recipe arity ---

impl Recipe {
    /// Minimum number of positional arguments the recipe accepts.
    pub fn min_arguments(&self) -> usize {
        self.parameters
            .iter()
            .filter(|p| matches!(p.kind, ParameterKind::Required | ParameterKind::Plus))
            .count()
    }

    /// Maximum number of positional arguments, or `None` when variadic.
    pub fn max_arguments(&self) -> Option<usize> {
        if self.parameters.iter().any(|p| p.kind.is_variadic()) {
            None
        } else {
            Some(self.parameters.len())
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_arguments() && self.max_arguments().map_or(true, |max| count <= max)
    }

    /// Human-readable arity, e.g. `0`, `1 to 2`, `at least 1`.
    pub fn arity_description(&self) -> String {
        let min = self.min_arguments();
        match self.max_arguments() {
            None => format!("at least {min}"),
            Some(max) if max == min => min.to_string(),
            Some(max) => format!("{min} to {max}"),
        }
    }
}

// --- Expression traversal ---

impl Expression {
    /// Visit this expression and every sub-expression, parents first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expression)) {
        visit(self);
        match self {
            Expression::StringLiteral(_) | Expression::Variable(_) | Expression::Backtick(_) => {}
            Expression::Call { arguments, .. } => {
                for argument in arguments {
                    argument.walk(visit);
                }
            }
            Expression::Join(lhs, rhs) | Expression::Concat(lhs, rhs) => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expression::Group(inner) => inner.walk(visit),
        }
    }

    /// Names of every variable referenced, in source order.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.walk(&mut |e| {
            if let Expression::Variable(name) = e {
                names.push(name.as_str());
            }
        });
        names
    }
}

impl Line {
    pub fn expressions(&self) -> impl Iterator<Item = &Expression> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Interpolation(e) => Some(e),
            Fragment::Text(_) => None,
        })
    }
}

// --- Display (source form, used by `taskrun show`) ---

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\t', "\\t");
    write!(f, "\"{escaped}\"")
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::StringLiteral(s) => write_quoted(f, s),
            Expression::Variable(name) => write!(f, "{name}"),
            Expression::Backtick(command) => write!(f, "`{command}`"),
            Expression::Call { name, arguments } => {
                write!(f, "{name}(")?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{argument}")?;
                }
                write!(f, ")")
            }
            Expression::Join(lhs, rhs) => write!(f, "{lhs} / {rhs}"),
            Expression::Concat(lhs, rhs) => write!(f, "{lhs} + {rhs}"),
            Expression::Group(inner) => write!(f, "({inner})"),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.export {
            write!(f, "$")?;
        }
        match &self.kind {
            ParameterKind::Required => write!(f, "{}", self.name),
            ParameterKind::Default(value) => write!(f, "{}={}", self.name, value),
            ParameterKind::Star => write!(f, "*{}", self.name),
            ParameterKind::Plus => write!(f, "+{}", self.name),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arguments.is_empty() {
            return write!(f, "{}", self.recipe);
        }
        write!(f, "({}", self.recipe)?;
        for argument in &self.arguments {
            write!(f, " {argument}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.echo_toggle {
            write!(f, "@")?;
        }
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => write!(f, "{}", text.replace("{{", "{{{{"))?,
                Fragment::Interpolation(e) => write!(f, "{{{{{e}}}}}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(doc) = &self.doc {
            writeln!(f, "# {doc}")?;
        }
        if self.quiet {
            write!(f, "@")?;
        }
        write!(f, "{}", self.name)?;
        for parameter in &self.parameters {
            write!(f, " {parameter}")?;
        }
        write!(f, ":")?;
        for dependency in &self.dependencies {
            write!(f, " {dependency}")?;
        }
        for line in &self.body {
            write!(f, "\n    ")?;
            // continuation lines keep their own indentation
            write!(f, "{}", line.to_string().replace('\n', "\n    "))?;
        }
        Ok(())
    }
}
