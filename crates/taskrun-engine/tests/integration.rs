//! End-to-end tests: parse a Runfile, build the graph, validate, run, verify.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use taskrun_engine::{validate, EventEmitter, Executor, RecipeGraph, RunConfig, RunEvent};
use taskrun_shell::{
    CommandRunner, ExecResult, ExternalCall, LocalCommandRunner, RecordingRunner,
};
use taskrun_types::{Result, TaskrunError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_graph(source: &str) -> RecipeGraph {
    RecipeGraph::parse(source).expect("Runfile should parse")
}

fn quiet_config(dir: impl AsRef<Path>) -> RunConfig {
    let mut config = RunConfig::new(dir.as_ref());
    config.quiet = true;
    config
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Records when each streamed line starts and finishes.
#[derive(Default)]
struct TimelineRunner {
    timeline: Mutex<Vec<String>>,
}

impl TimelineRunner {
    fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for TimelineRunner {
    async fn capture(&self, call: &ExternalCall) -> Result<ExecResult> {
        self.timeline
            .lock()
            .unwrap()
            .push(format!("capture {}", call.command));
        Ok(ExecResult {
            stdout: "captured\n".into(),
            ..Default::default()
        })
    }

    async fn stream(&self, call: &ExternalCall) -> Result<ExecResult> {
        self.timeline
            .lock()
            .unwrap()
            .push(format!("start {}", call.command));
        tokio::task::yield_now().await;
        self.timeline
            .lock()
            .unwrap()
            .push(format!("end {}", call.command));
        Ok(ExecResult::default())
    }
}

const PROJECT: &str = r#"
export uv := "path/to/uv"
python := "3.12"

# Lock dependencies
lock:
    {{uv}} lock

# Export a requirements file
requirements: lock
    {{uv}} export --format requirements-txt > requirements.txt

fmt: lock
    {{uv}} run ruff format .

lint: lock
    {{uv}} run ruff check .

static: lock
    {{uv}} run mypy .

unit *args: lock
    {{uv}} run --python {{python}} pytest {{args}}

check: fmt lint static unit
"#;

// ---------------------------------------------------------------------------
// Deduplication and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_dependency_runs_shared_recipe_once() {
    let graph = build_graph(
        "a: b c\n    echo a\nb: d\n    echo b\nc: d\n    echo c\nd:\n    echo d\n",
    );
    let runner = Arc::new(RecordingRunner::new());
    let report = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("a"), &[])
        .await
        .expect("run should succeed");

    assert_eq!(runner.streamed(), vec!["echo d", "echo b", "echo c", "echo a"]);
    let names: Vec<_> = report.invocations.iter().map(|i| i.recipe.as_str()).collect();
    assert_eq!(names, vec!["d", "b", "c", "a"]);
}

#[tokio::test]
async fn lock_runs_once_across_every_dependent() {
    let graph = build_graph(PROJECT);
    let runner = Arc::new(RecordingRunner::new());
    Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("check"), &[])
        .await
        .expect("run should succeed");

    let streamed = runner.streamed();
    assert_eq!(
        streamed.iter().filter(|c| *c == "path/to/uv lock").count(),
        1
    );
    assert_eq!(streamed[0], "path/to/uv lock");
    assert_eq!(streamed.len(), 5);
}

#[tokio::test]
async fn default_binding_and_explicit_argument_run_once() {
    let graph = build_graph(
        "\
mode := \"debug\"

build profile=mode:
    cargo build --profile {{profile}}

test: build
    cargo test

ci: test (build \"debug\") (build \"release\")
    echo ci
",
    );
    let runner = Arc::new(RecordingRunner::new());
    let report = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("ci"), &[])
        .await
        .unwrap();

    assert_eq!(
        runner.streamed(),
        vec![
            "cargo build --profile debug",
            "cargo test",
            "cargo build --profile release",
            "echo ci",
        ]
    );
    let builds: Vec<_> = report
        .invocations
        .iter()
        .filter(|i| i.recipe == "build")
        .map(|i| i.arguments.clone())
        .collect();
    assert_eq!(builds, vec![vec!["debug".to_string()], vec!["release".to_string()]]);
}

#[tokio::test]
async fn dependency_lines_finish_before_dependent_lines_start() {
    let graph = build_graph("build: prep\n    make\n    make install\nprep:\n    mkdir out\n");
    let runner = Arc::new(TimelineRunner::default());
    Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("build"), &[])
        .await
        .unwrap();

    assert_eq!(
        runner.timeline(),
        vec![
            "start mkdir out",
            "end mkdir out",
            "start make",
            "end make",
            "start make install",
            "end make install",
        ]
    );
}

#[tokio::test]
async fn requirements_target_runs_lock_then_requirements_only() {
    let graph = build_graph(PROJECT);
    let runner = Arc::new(RecordingRunner::new());
    let report = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("requirements"), &[])
        .await
        .unwrap();

    assert_eq!(
        runner.streamed(),
        vec![
            "path/to/uv lock",
            "path/to/uv export --format requirements-txt > requirements.txt",
        ]
    );
    assert!(report.invocations.iter().all(|i| i.recipe != "fmt"));
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_failing_line_aborts_the_run_with_its_code() {
    let graph = build_graph("all: one two\none:\n    step-1\n    step-2\ntwo:\n    step-3\n");
    let runner = Arc::new(RecordingRunner::new().with_exit_code("step-1", 4, "broken\n"));
    let err = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("all"), &[])
        .await
        .unwrap_err();

    match &err {
        TaskrunError::SubprocessFailure {
            recipe,
            line,
            code,
            stderr_tail,
            ..
        } => {
            assert_eq!(recipe, "one");
            assert_eq!(*line, 3);
            assert_eq!(*code, 4);
            assert_eq!(stderr_tail, "broken\n");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.exit_code(), 4);
    assert_eq!(runner.streamed(), vec!["step-1"]);
}

#[tokio::test]
async fn failure_is_reported_as_event() {
    let graph = build_graph("a:\n    false\n");
    let runner = Arc::new(RecordingRunner::new().with_exit_code("false", 1, ""));
    let emitter = EventEmitter::new(32);
    let mut rx = emitter.subscribe();

    let _ = Executor::new(&graph, runner, quiet_config("/p"))
        .with_emitter(emitter)
        .run(Some("a"), &[])
        .await;

    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::RunFailed { target, .. } = event {
            assert_eq!(target, "a");
            failed = true;
        }
    }
    assert!(failed, "expected a RunFailed event");
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capturing_variable_runs_once_per_run() {
    let graph = build_graph(
        "rev := `git rev-parse HEAD`\na: b\n    echo a {{rev}}\nb:\n    echo b {{rev}}\n    echo again {{rev}}\n",
    );
    let runner = Arc::new(RecordingRunner::new().with_output("git rev-parse HEAD", "f00d\n"));
    Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("a"), &[])
        .await
        .unwrap();

    assert_eq!(runner.captured(), vec!["git rev-parse HEAD"]);
    assert_eq!(
        runner.streamed(),
        vec!["echo b f00d", "echo again f00d", "echo a f00d"]
    );
}

#[tokio::test]
async fn unused_capturing_variable_never_runs() {
    let graph = build_graph("slow := `sleep 10`\na:\n    echo fast\n");
    let runner = Arc::new(RecordingRunner::new());
    Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("a"), &[])
        .await
        .unwrap();
    assert!(runner.captured().is_empty());
}

#[tokio::test]
async fn exported_variable_is_in_every_line_environment() {
    let graph = build_graph(PROJECT);
    let runner = Arc::new(RecordingRunner::new());
    Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("check"), &[])
        .await
        .unwrap();

    let calls = runner.calls();
    assert!(!calls.is_empty());
    for recorded in calls {
        assert_eq!(
            recorded.call.env.get("uv").map(String::as_str),
            Some("path/to/uv")
        );
        assert!(!recorded.call.env.contains_key("python"));
    }
}

#[tokio::test]
async fn variadic_arguments_are_forwarded() {
    let graph = build_graph(PROJECT);
    let runner = Arc::new(RecordingRunner::new());
    Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("unit"), &args(&["-k", "fast", "tests/"]))
        .await
        .unwrap();
    assert_eq!(
        runner.streamed().last().map(String::as_str),
        Some("path/to/uv run --python 3.12 pytest -k fast tests/")
    );
}

// ---------------------------------------------------------------------------
// Static errors: nothing is spawned
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependency_cycle_spawns_nothing() {
    let graph = build_graph("a: b\n    echo a\nb: a\n    echo b\n");
    let runner = Arc::new(RecordingRunner::new());
    let err = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("a"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskrunError::CyclicDependency { .. }));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn variable_cycle_spawns_nothing() {
    let graph = build_graph("x := `echo` + y\ny := x\na:\n    echo {{x}}\n");
    let runner = Arc::new(RecordingRunner::new());
    let err = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("a"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskrunError::CyclicVariable { .. }));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn extra_argument_is_arity_error() {
    let graph = build_graph("fmt:\n    ruff format\n");
    let runner = Arc::new(RecordingRunner::new());
    let err = Executor::new(&graph, runner.clone(), quiet_config("/p"))
        .run(Some("fmt"), &args(&["extra"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskrunError::ArityError { found: 1, .. }
    ));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn unknown_target_is_reported() {
    let graph = build_graph(PROJECT);
    let runner = Arc::new(RecordingRunner::new());
    let err = Executor::new(&graph, runner, quiet_config("/p"))
        .run(Some("deploy"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TaskrunError::UnknownRecipe { .. }));
}

#[test]
fn project_runfile_validates_cleanly() {
    let graph = build_graph(PROJECT);
    let diagnostics = validate(&graph).expect("validation should pass");
    assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
}

// ---------------------------------------------------------------------------
// Real subprocesses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_runner_runs_lines_in_project_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let graph = build_graph(
        "export greeting := \"hello\"\nwrite: prep\n    echo \"$greeting\" > out/greeting.txt\nprep:\n    mkdir -p out\n",
    );
    let runner = Arc::new(LocalCommandRunner::new());
    let report = Executor::new(&graph, runner, quiet_config(dir.path()))
        .run(Some("write"), &[])
        .await
        .unwrap();

    assert_eq!(report.lines_run, 2);
    let written = std::fs::read_to_string(dir.path().join("out/greeting.txt")).unwrap();
    assert_eq!(written, "hello\n");
}

#[tokio::test]
async fn local_runner_surfaces_exit_code_and_stderr() {
    let dir = tempfile::TempDir::new().unwrap();
    let graph = build_graph("fail:\n    echo 'bad input' >&2; exit 7\n    touch never\n");
    let runner = Arc::new(LocalCommandRunner::new());
    let err = Executor::new(&graph, runner, quiet_config(dir.path()))
        .run(Some("fail"), &[])
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 7);
    assert_eq!(err.stderr_tail(), Some("bad input"));
    assert!(!dir.path().join("never").exists());
}

#[tokio::test]
async fn local_runner_captures_backticks() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("VERSION"), "1.4.2\n").unwrap();
    let graph = build_graph(
        "version := `cat VERSION`\ntag:\n    echo v{{version}} > tag.txt\n",
    );
    let runner = Arc::new(LocalCommandRunner::new());
    Executor::new(&graph, runner, quiet_config(dir.path()))
        .run(Some("tag"), &[])
        .await
        .unwrap();

    let tag = std::fs::read_to_string(dir.path().join("tag.txt")).unwrap();
    assert_eq!(tag, "v1.4.2\n");
}
