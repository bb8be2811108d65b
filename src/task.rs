use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::config::{PipelineConfig, TaskSpec, expand_inputs};
use crate::error::PipelineError;
use crate::observability::MetricsCollector;
use crate::pipeline::{Artifact, PipelineContext, StagePipeline, StageRegistry};

/// Directories a task run reads from and writes into.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TaskContext {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            source_dir: config.source_dir.clone(),
            output_dir: config.output_dir.clone(),
        }
    }
}

/// A named build step: input globs, an output subpath and the stages applied
/// to every matched file.
pub struct Task {
    pub name: String,
    pub inputs: Vec<String>,
    pub output: PathBuf,
    pub depends_on: Vec<String>,
    pipeline: StagePipeline,
}

impl Task {
    pub fn from_spec(
        spec: &TaskSpec,
        registry: &StageRegistry,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        if !is_contained_subpath(&spec.output) {
            return Err(PipelineError::Config(format!(
                "task '{}' output '{}' must be a relative path inside the output directory",
                spec.name,
                spec.output.display()
            ))
            .into());
        }
        let pipeline = StagePipeline::from_specs(registry, &spec.stages, metrics)
            .with_context(|| format!("Failed to build stages for task '{}'", spec.name))?;
        Ok(Self {
            name: spec.name.clone(),
            inputs: spec.inputs.clone(),
            output: spec.output.clone(),
            depends_on: spec.depends_on.clone(),
            pipeline,
        })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }

    /// Runs every matched input through the stages. The first failing file
    /// aborts the task.
    fn execute(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>> {
        let inputs = expand_inputs(&ctx.source_dir, &self.inputs)?;
        let stage_ctx = PipelineContext {
            task: self.name.clone(),
            source_dir: ctx.source_dir.clone(),
            output_dir: ctx.output_dir.join(&self.output),
        };
        let mut outputs = Vec::new();
        for input in &inputs {
            let mut artifact = Artifact::load(input)?;
            self.pipeline.process(&mut artifact, &stage_ctx)?;
            outputs.append(&mut artifact.emitted);
        }
        Ok(outputs)
    }
}

fn is_contained_subpath(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub outputs: Vec<PathBuf>,
    pub duration_ms: f64,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn failed(task: &str, error: String) -> Self {
        Self {
            task: task.to_string(),
            status: TaskStatus::Failed { error },
            outputs: Vec::new(),
            duration_ms: 0.0,
        }
    }
}

/// Named tasks in registration order.
pub struct TaskRegistry {
    tasks: Vec<Task>,
    metrics: MetricsCollector,
}

impl TaskRegistry {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            tasks: Vec::new(),
            metrics,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        stages: &StageRegistry,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let mut registry = Self::new(metrics.clone());
        for spec in &config.tasks {
            registry.register(Task::from_spec(spec, stages, metrics.clone())?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, task: Task) -> Result<(), PipelineError> {
        if self.get(&task.name).is_some() {
            return Err(PipelineError::DuplicateTask(task.name));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn unknown(&self, name: &str) -> PipelineError {
        PipelineError::UnknownTask {
            name: name.to_string(),
            available: self.names().join(", "),
        }
    }

    /// Runs one task. Transform failures are logged and come back as a
    /// [`TaskStatus::Failed`] result; only an unknown task name is an error.
    #[instrument(skip(self, ctx))]
    pub fn run(&self, name: &str, ctx: &TaskContext) -> Result<TaskResult, PipelineError> {
        let task = self.get(name).ok_or_else(|| self.unknown(name))?;
        let started = Instant::now();
        let outcome = task.execute(ctx);
        let duration = started.elapsed();
        self.metrics
            .record_task(name, duration, outcome.is_ok());

        let result = match outcome {
            Ok(outputs) => {
                info!(
                    task = name,
                    outputs = outputs.len(),
                    duration_ms = as_millis(duration),
                    "Task finished"
                );
                TaskResult {
                    task: name.to_string(),
                    status: TaskStatus::Success,
                    outputs,
                    duration_ms: as_millis(duration),
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(task = name, error = %message, "Task failed");
                TaskResult {
                    task: name.to_string(),
                    status: TaskStatus::Failed { error: message },
                    outputs: Vec::new(),
                    duration_ms: as_millis(duration),
                }
            }
        };
        Ok(result)
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One execution of the build tasks. Results are collected while the run is
/// in flight and frozen by [`BuildRunRecorder::finish`].
#[derive(Debug, Clone, Serialize)]
pub struct BuildRun {
    id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    results: BTreeMap<String, TaskResult>,
}

impl BuildRun {
    pub fn start() -> BuildRunRecorder {
        let started_at = Utc::now();
        let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        BuildRunRecorder {
            id: format!("{}-{sequence}", started_at.format("%Y%m%dT%H%M%S%.3fZ")),
            started_at,
            results: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn results(&self) -> &BTreeMap<String, TaskResult> {
        &self.results
    }

    pub fn result(&self, task: &str) -> Option<&TaskResult> {
        self.results.get(task)
    }

    pub fn succeeded(&self) -> bool {
        self.results.values().all(TaskResult::succeeded)
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|result| !result.succeeded())
            .map(|result| result.task.as_str())
            .collect()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.results.values().flat_map(|result| result.outputs.iter())
    }
}

#[derive(Debug)]
pub struct BuildRunRecorder {
    id: String,
    started_at: DateTime<Utc>,
    results: BTreeMap<String, TaskResult>,
}

impl BuildRunRecorder {
    pub fn record(&mut self, result: TaskResult) {
        self.results.insert(result.task.clone(), result);
    }

    pub fn is_successful(&self, task: &str) -> bool {
        self.results.get(task).is_some_and(TaskResult::succeeded)
    }

    pub fn finish(self) -> BuildRun {
        BuildRun {
            id: self.id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            results: self.results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageSpec;
    use crate::stages::default_registry;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn copy_task(name: &str, inputs: &str) -> TaskSpec {
        TaskSpec {
            name: name.into(),
            inputs: vec![inputs.into()],
            output: PathBuf::from("."),
            depends_on: Vec::new(),
            watch: Vec::new(),
            stages: vec![StageSpec::named("write")],
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let stages = default_registry();
        let metrics = MetricsCollector::new();
        let mut registry = TaskRegistry::new(metrics.clone());
        let spec = copy_task("copy", "*.txt");
        registry
            .register(Task::from_spec(&spec, &stages, metrics.clone()).unwrap())
            .unwrap();
        let err = registry
            .register(Task::from_spec(&spec, &stages, metrics).unwrap())
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateTask(name) if name == "copy"));
    }

    #[test]
    fn escaping_output_is_a_config_error() {
        let mut spec = copy_task("copy", "*.txt");
        spec.output = PathBuf::from("../outside");
        let err = Task::from_spec(&spec, &default_registry(), MetricsCollector::new())
            .err()
            .expect("escaping output must fail");
        assert!(err.to_string().contains("inside the output directory"));
    }

    #[test]
    fn run_writes_outputs_and_reports_failures() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "hello").unwrap();
        fs::write(src.join("bad.js"), "function ( {").unwrap();

        let stages = default_registry();
        let metrics = MetricsCollector::new();
        let mut registry = TaskRegistry::new(metrics.clone());
        registry
            .register(Task::from_spec(&copy_task("copy", "*.txt"), &stages, metrics.clone()).unwrap())
            .unwrap();
        let mut broken = copy_task("broken", "*.js");
        broken.stages = vec![
            StageSpec::named("minify_js"),
            StageSpec::with_params("write", json!({ "source_map": false })),
        ];
        registry
            .register(Task::from_spec(&broken, &stages, metrics.clone()).unwrap())
            .unwrap();

        let ctx = TaskContext {
            source_dir: src,
            output_dir: temp.path().join("dist"),
        };
        let copied = registry.run("copy", &ctx).unwrap();
        assert!(copied.succeeded());
        assert_eq!(copied.outputs, vec![temp.path().join("dist/a.txt")]);

        let failed = registry.run("broken", &ctx).unwrap();
        assert!(matches!(failed.status, TaskStatus::Failed { .. }));
        assert!(!temp.path().join("dist/bad.js").exists());

        assert!(matches!(
            registry.run("nope", &ctx),
            Err(PipelineError::UnknownTask { .. })
        ));
        assert_eq!(metrics.snapshot().tasks["broken"].failures, 1);
    }

    #[test]
    fn build_run_summarises_results() {
        let mut recorder = BuildRun::start();
        recorder.record(TaskResult {
            task: "html".into(),
            status: TaskStatus::Success,
            outputs: vec![PathBuf::from("dist/index.html")],
            duration_ms: 1.0,
        });
        recorder.record(TaskResult::failed("style", "bad scss".into()));
        assert!(recorder.is_successful("html"));
        let run = recorder.finish();
        assert!(!run.succeeded());
        assert_eq!(run.failed_tasks(), vec!["style"]);
        assert_eq!(run.outputs().count(), 1);
        assert!(run.finished_at() >= run.started_at());

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["results"]["style"]["status"], "failed");
        assert_eq!(json["results"]["style"]["error"], "bad scss");
    }
}
