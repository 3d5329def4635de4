//! CLI binary for running and inspecting Runfile recipes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use taskrun_engine::{validate, Executor, RecipeGraph, RunConfig};
use taskrun_shell::LocalCommandRunner;
use taskrun_types::TaskrunError;
use tracing_subscriber::EnvFilter;

const RUNFILE_NAMES: &[&str] = &["Runfile", "runfile"];

#[derive(Parser)]
#[command(name = "taskrun", version, about = "Run recipes declared in a Runfile")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the Runfile (default: nearest `Runfile` in this or a parent directory)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Directory recipe lines run in (default: the Runfile's directory)
    #[arg(short = 'd', long, global = true)]
    working_directory: Option<PathBuf>,

    /// Override a variable before evaluation
    #[arg(long = "set", num_args = 2, value_names = ["NAME", "VALUE"], global = true)]
    overrides: Vec<String>,

    /// Print lines instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Don't echo lines before running them
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a recipe (the first one in the Runfile by default)
    Run {
        recipe: Option<String>,

        /// Positional arguments for the recipe
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// List recipes with their parameters and doc comments
    List,

    /// Print a recipe's source
    Show { recipe: String },

    /// Parse and validate the Runfile without running anything
    Check,

    /// Print the parsed Runfile as JSON
    Dump,

    /// List variable names
    Variables,

    /// Evaluate and print variables
    Evaluate { name: Option<String> },
}

/// A located Runfile and the directories a run needs.
struct Project {
    path: PathBuf,
    source: String,
    working_dir: PathBuf,
    invocation_dir: PathBuf,
}

impl Project {
    fn graph(&self) -> anyhow::Result<RecipeGraph> {
        Ok(RecipeGraph::parse(&self.source)?)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("TASKRUN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print `err` and turn it into the process exit code.
fn report(err: &anyhow::Error) -> ExitCode {
    eprintln!("error: {err}");
    let Some(error) = err.downcast_ref::<TaskrunError>() else {
        return ExitCode::FAILURE;
    };
    if let TaskrunError::ParseError {
        source_snippet: Some(snippet),
        col,
        ..
    } = error
    {
        eprintln!("  | {snippet}");
        eprintln!("  | {}^", " ".repeat(col.saturating_sub(1)));
    }
    // a failing line's stderr was already streamed to the terminal
    if !matches!(error, TaskrunError::SubprocessFailure { .. }) {
        if let Some(tail) = error.stderr_tail() {
            eprintln!("{tail}");
        }
    }
    ExitCode::from(error.exit_code().clamp(1, 255) as u8)
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let project = locate(cli.file.as_deref(), cli.working_directory.as_deref())?;
    tracing::debug!(runfile = %project.path.display(), working_dir = %project.working_dir.display(), "loaded Runfile");

    match cli.command {
        Commands::Run { recipe, arguments } => {
            let config = RunConfig {
                working_dir: project.working_dir.clone(),
                invocation_dir: project.invocation_dir.clone(),
                dry_run: cli.dry_run,
                quiet: cli.quiet,
                overrides: pair_overrides(&cli.overrides)?,
            };
            cmd_run(&project, config, recipe.as_deref(), &arguments).await
        }
        Commands::List => cmd_list(&project),
        Commands::Show { recipe } => cmd_show(&project, &recipe),
        Commands::Check => cmd_check(&project),
        Commands::Dump => cmd_dump(&project),
        Commands::Variables => cmd_variables(&project),
        Commands::Evaluate { name } => {
            let mut config = RunConfig::new(project.working_dir.clone());
            config.invocation_dir = project.invocation_dir.clone();
            config.overrides = pair_overrides(&cli.overrides)?;
            cmd_evaluate(&project, config, name).await
        }
    }
}

/// Nearest Runfile in `start` or one of its ancestors.
fn find_runfile(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .flat_map(|dir| RUNFILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

fn locate(file: Option<&Path>, working_directory: Option<&Path>) -> anyhow::Result<Project> {
    let invocation_dir = std::env::current_dir().context("reading current directory")?;
    let path = match file {
        Some(path) => invocation_dir.join(path),
        None => find_runfile(&invocation_dir).with_context(|| {
            format!(
                "no Runfile found in {} or any parent directory",
                invocation_dir.display()
            )
        })?,
    };
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;

    let working_dir = match working_directory {
        Some(dir) => invocation_dir.join(dir),
        None => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| invocation_dir.clone()),
    };
    Ok(Project {
        path,
        source,
        working_dir,
        invocation_dir,
    })
}

/// `--set` values arrive flattened as NAME VALUE NAME VALUE ...
fn pair_overrides(values: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    if values.len() % 2 != 0 {
        anyhow::bail!("--set takes a NAME and a VALUE");
    }
    Ok(values
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

async fn cmd_run(
    project: &Project,
    config: RunConfig,
    recipe: Option<&str>,
    arguments: &[String],
) -> anyhow::Result<()> {
    let graph = project.graph()?;

    // Children share our process group and receive the interrupt themselves.
    // Keep running so their exit status is what we report.
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, waiting for the running line");
        }
    });
    tokio::task::yield_now().await;

    let executor = Executor::new(&graph, Arc::new(LocalCommandRunner::new()), config);
    let report = executor.run(recipe, arguments).await?;
    tracing::debug!(
        invocations = report.invocations.len(),
        lines = report.lines_run,
        duration_ms = report.duration_ms,
        "done"
    );
    Ok(())
}

fn cmd_list(project: &Project) -> anyhow::Result<()> {
    let graph = project.graph()?;
    let entries: Vec<(String, Option<&str>)> = graph
        .all_nodes()
        .iter()
        .map(|node| {
            let mut signature = node.name().to_string();
            for parameter in &node.recipe.parameters {
                signature.push(' ');
                signature.push_str(&parameter.to_string());
            }
            (signature, node.recipe.doc.as_deref())
        })
        .collect();
    let width = entries.iter().map(|(s, _)| s.len()).max().unwrap_or(0);

    println!("Available recipes:");
    for (signature, doc) in entries {
        match doc {
            Some(doc) => println!("    {signature:<width$} # {doc}"),
            None => println!("    {signature}"),
        }
    }
    Ok(())
}

fn cmd_show(project: &Project, name: &str) -> anyhow::Result<()> {
    let graph = project.graph()?;
    let id = graph.recipe_id(name)?;
    println!("{}", graph.node(id).recipe);
    Ok(())
}

fn cmd_check(project: &Project) -> anyhow::Result<()> {
    let graph = project.graph()?;
    let diagnostics = validate(&graph)?;
    for diag in &diagnostics {
        println!("[WARN] {}: {}", diag.rule, diag.message);
    }
    println!("{} is valid", project.path.display());
    Ok(())
}

fn cmd_dump(project: &Project) -> anyhow::Result<()> {
    let document = taskrun_syntax::parse(&project.source)?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

fn cmd_variables(project: &Project) -> anyhow::Result<()> {
    let graph = project.graph()?;
    for assignment in graph.assignments() {
        println!("{}", assignment.name);
    }
    Ok(())
}

async fn cmd_evaluate(
    project: &Project,
    config: RunConfig,
    name: Option<String>,
) -> anyhow::Result<()> {
    let graph = project.graph()?;
    let executor = Executor::new(&graph, Arc::new(LocalCommandRunner::new()), config);

    match name {
        Some(name) => {
            for (_, value) in executor.evaluate(&[name]).await? {
                println!("{value}");
            }
        }
        None => {
            let values = executor.evaluate(&[]).await?;
            let width = values.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
            for (name, value) in values {
                println!("{name:<width$} := \"{value}\"");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_runfile_in_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("Runfile"), "a:\n    echo a\n").unwrap();

        let found = find_runfile(&nested).unwrap();
        assert_eq!(found, dir.path().join("Runfile"));
    }

    #[test]
    fn nearest_runfile_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("sub");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("Runfile"), "").unwrap();
        std::fs::write(nested.join("Runfile"), "").unwrap();

        assert_eq!(find_runfile(&nested).unwrap(), nested.join("Runfile"));
    }

    #[test]
    fn locate_uses_runfile_directory_as_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Runfile");
        std::fs::write(&path, "a:\n    echo a\n").unwrap();

        let project = locate(Some(&path), None).unwrap();
        assert_eq!(project.working_dir, dir.path());
        assert_eq!(project.source, "a:\n    echo a\n");

        let other = tempfile::TempDir::new().unwrap();
        let project = locate(Some(&path), Some(other.path())).unwrap();
        assert_eq!(project.working_dir, other.path());
    }

    #[test]
    fn overrides_are_paired() {
        let values: Vec<String> = ["mode", "release", "uv", "/opt/uv"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let pairs = pair_overrides(&values).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("mode".to_string(), "release".to_string()),
                ("uv".to_string(), "/opt/uv".to_string()),
            ]
        );
        assert!(pair_overrides(&values[..3]).is_err());
    }

    #[test]
    fn parses_run_with_arguments_and_flags() {
        let cli = Cli::try_parse_from([
            "taskrun", "--dry-run", "--set", "mode", "fast", "run", "unit", "a.py", "b.py",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.overrides, vec!["mode", "fast"]);
        match cli.command {
            Commands::Run { recipe, arguments } => {
                assert_eq!(recipe.as_deref(), Some("unit"));
                assert_eq!(arguments, vec!["a.py", "b.py"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_without_recipe_uses_default() {
        let cli = Cli::try_parse_from(["taskrun", "run"]).unwrap();
        match cli.command {
            Commands::Run { recipe, arguments } => {
                assert!(recipe.is_none());
                assert!(arguments.is_empty());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn exit_code_follows_subprocess_failure() {
        let err = anyhow::Error::from(TaskrunError::SubprocessFailure {
            recipe: "unit".into(),
            line: 2,
            command: "pytest".into(),
            code: 5,
            stderr_tail: String::new(),
        });
        assert_eq!(report(&err), ExitCode::from(5));

        let capture = anyhow::Error::from(TaskrunError::CaptureFailed {
            command: "git describe".into(),
            code: 128,
            stderr_tail: "fatal: no names found".into(),
        });
        assert_eq!(report(&capture), ExitCode::from(128));

        let other = anyhow::anyhow!("no Runfile found");
        assert_eq!(report(&other), ExitCode::FAILURE);
    }
}
