use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::config::InputFile;
use crate::observability::MetricsCollector;

/// A single file flowing through a task's stages.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub input_path: PathBuf,
    /// Output location relative to the task's output directory.
    pub relative: PathBuf,
    pub data: Vec<u8>,
    pub source_map: Option<String>,
    /// Files written by `write` stages so far.
    pub emitted: Vec<PathBuf>,
    pub metadata: Map<String, Value>,
}

impl Artifact {
    pub fn load(input: &InputFile) -> Result<Self> {
        let data = fs::read(&input.path)
            .with_context(|| format!("Failed to read input file: {}", input.path.display()))?;
        let mut artifact = Self::from_bytes(&input.path, &input.relative, data);
        artifact.metadata.insert(
            "input_path".to_string(),
            Value::String(input.path.to_string_lossy().to_string()),
        );
        Ok(artifact)
    }

    pub fn from_bytes(input_path: &Path, relative: &Path, data: Vec<u8>) -> Self {
        Self {
            input_path: input_path.to_path_buf(),
            relative: relative.to_path_buf(),
            data,
            source_map: None,
            emitted: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .with_context(|| format!("{} is not valid UTF-8", self.input_path.display()))
    }

    pub fn replace_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Replaces the output extension; `min.css` turns `main.css` into `main.min.css`.
    pub fn set_extension(&mut self, extension: &str) {
        self.relative.set_extension(extension.trim_start_matches('.'));
    }

    pub fn file_name(&self) -> String {
        self.relative
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string())
    }

    pub fn extension(&self) -> Option<String> {
        self.relative
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub task: String,
    pub source_dir: PathBuf,
    /// Directory this task is allowed to write into.
    pub output_dir: PathBuf,
}

pub type StageParameters = Map<String, Value>;

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, artifact: &mut Artifact, ctx: &PipelineContext) -> Result<()>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// An explicit ordered list of stages applied one after another to each
/// artifact of a task.
pub struct StagePipeline {
    stages: Vec<Box<dyn Stage>>,
    metrics: MetricsCollector,
}

impl StagePipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>, metrics: MetricsCollector) -> Self {
        Self { stages, metrics }
    }

    pub fn from_specs(
        registry: &StageRegistry,
        specs: &[StageSpec],
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let mut stages = Vec::with_capacity(specs.len());
        for spec in specs {
            let params = spec.params.clone().unwrap_or_default();
            let stage = registry
                .create(&spec.stage, params)
                .with_context(|| format!("Failed to configure stage '{}'", spec.stage))?;
            stages.push(stage);
        }
        Ok(Self::new(stages, metrics))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    #[instrument(skip_all, fields(task = %ctx.task, input = %artifact.input_path.display()))]
    pub fn process(&self, artifact: &mut Artifact, ctx: &PipelineContext) -> Result<()> {
        for stage in &self.stages {
            let span = tracing::span!(tracing::Level::DEBUG, "stage", stage = stage.name());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(stage.name());
            stage
                .run(artifact, ctx)
                .with_context(|| format!("Stage '{}' failed", stage.name()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn named(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            params: None,
        }
    }

    /// Builds a spec from a JSON object literal; non-object values yield no params.
    pub fn with_params(stage: &str, params: Value) -> Self {
        Self {
            stage: stage.to_string(),
            params: match params {
                Value::Object(map) => Some(map),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Stage for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
            let upper = artifact.text()?.to_uppercase();
            artifact.replace_data(upper.into_bytes());
            Ok(())
        }
    }

    struct Fail;

    impl Stage for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn run(&self, _artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
            Err(anyhow!("boom"))
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext {
            task: "test".into(),
            source_dir: PathBuf::from("src"),
            output_dir: PathBuf::from("dist"),
        }
    }

    #[test]
    fn stages_run_in_order_and_stop_on_error() {
        let metrics = MetricsCollector::new();
        let pipeline = StagePipeline::new(
            vec![Box::new(Upper), Box::new(Fail), Box::new(Upper)],
            metrics.clone(),
        );
        let mut artifact =
            Artifact::from_bytes(Path::new("a.txt"), Path::new("a.txt"), b"abc".to_vec());
        let err = pipeline.process(&mut artifact, &ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert_eq!(artifact.data, b"ABC");
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages.get("upper").map(|m| m.calls), Some(1));
        assert_eq!(snapshot.stages.get("fail").map(|m| m.calls), Some(1));
    }

    #[test]
    fn unknown_stage_lists_available() {
        let mut registry = StageRegistry::new();
        registry.register("upper", |_| Ok(Box::new(Upper)));
        let err = registry
            .create("nope", StageParameters::new())
            .err()
            .expect("unknown stage must fail");
        assert!(err.to_string().contains("Available stages: upper"));
    }

    #[test]
    fn set_extension_appends_min_suffix() {
        let mut artifact =
            Artifact::from_bytes(Path::new("main.css"), Path::new("main.css"), Vec::new());
        artifact.set_extension("min.css");
        assert_eq!(artifact.relative, PathBuf::from("main.min.css"));
    }
}
