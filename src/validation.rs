use std::collections::{BTreeMap, BTreeSet};
use std::path::Component;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{PipelineConfig, TaskSpec, compile_patterns, expand_inputs};
use crate::pipeline::{StageRegistry, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &PipelineConfig, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != 1 {
        report
            .errors
            .push(format!("Unsupported config version: {}", config.version));
    }

    if config.tasks.is_empty() {
        report.errors.push("At least one task is required".into());
    }

    if config.source_dir.starts_with(&config.output_dir) {
        report.errors.push(format!(
            "Output directory {} must not contain the source directory",
            config.output_dir.display()
        ));
    }
    if !config.source_dir.is_dir() {
        report.warnings.push(format!(
            "Source directory {} does not exist",
            config.source_dir.display()
        ));
    }

    if let Err(err) = config.server.socket_addr() {
        report.errors.push(format!("{err:#}"));
    }

    let mut seen = BTreeSet::new();
    for task in &config.tasks {
        if !seen.insert(task.name.as_str()) {
            report
                .errors
                .push(format!("Task '{}' is defined more than once", task.name));
        }
    }

    for task in &config.tasks {
        report.merge(validate_task(task, config, registry));
    }

    if let Some(cycle) = find_cycle(&config.tasks) {
        report.errors.push(format!(
            "Task dependency cycle detected: {}",
            cycle.join(" -> ")
        ));
    }

    report
}

fn validate_task(
    task: &TaskSpec,
    config: &PipelineConfig,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = format!("Task '{}'", task.name);

    if task.name.trim().is_empty() {
        report.errors.push("Task names cannot be empty".into());
    }

    if task.inputs.is_empty() {
        report
            .errors
            .push(format!("{label} needs at least one input pattern"));
    }
    for pattern in task.inputs.iter().chain(task.watch.iter()) {
        if pattern.trim().is_empty() {
            report
                .errors
                .push(format!("{label} has an empty glob pattern"));
        } else if let Err(err) = compile_patterns(pattern) {
            report.errors.push(format!("{label}: {err:#}"));
        }
    }

    let escapes = task
        .output
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        report.errors.push(format!(
            "{label} output '{}' must stay inside the output directory",
            task.output.display()
        ));
    }

    for dep in &task.depends_on {
        if dep == &task.name {
            report.errors.push(format!("{label} depends on itself"));
        } else if config.task(dep).is_none() {
            report
                .errors
                .push(format!("{label} depends on unknown task '{dep}'"));
        }
    }

    if task.stages.is_empty() {
        report
            .errors
            .push(format!("{label} must contain at least one stage"));
    }
    for (idx, stage) in task.stages.iter().enumerate() {
        if let Err(err) = validate_stage(stage, registry)
            .with_context(|| format!("{label} stage {} ('{}')", idx + 1, stage.stage))
        {
            report.errors.push(format!("{err:#}"));
        }
    }
    report.merge(validate_stage_order(&label, &task.stages));

    if config.source_dir.is_dir() {
        match expand_inputs(&config.source_dir, &task.inputs) {
            Ok(inputs) if inputs.is_empty() => report
                .warnings
                .push(format!("{label} inputs match no files")),
            Ok(_) => {}
            Err(err) => report.errors.push(format!("{label}: {err:#}")),
        }
    }

    report
}

fn validate_stage(stage: &StageSpec, registry: &StageRegistry) -> Result<()> {
    let params = stage.params.clone().unwrap_or_default();
    registry
        .create(&stage.stage, params)
        .context("Failed to instantiate stage")?;
    Ok(())
}

fn validate_stage_order(label: &str, stages: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    match stages.iter().rposition(|stage| stage.stage == "write") {
        None if !stages.is_empty() => report
            .warnings
            .push(format!("{label} has no write stage and produces no output")),
        Some(last_write) if last_write + 1 < stages.len() => {
            let trailing: Vec<_> = stages[last_write + 1..]
                .iter()
                .map(|stage| stage.stage.as_str())
                .collect();
            report.warnings.push(format!(
                "{label} stages after the final write have no effect: {}",
                trailing.join(", ")
            ));
        }
        _ => {}
    }
    if let Some(minify) = stages.iter().position(|stage| stage.stage == "minify_css")
        && let Some(prefix) = stages.iter().position(|stage| stage.stage == "autoprefix")
        && prefix > minify
    {
        report.warnings.push(format!(
            "{label} runs autoprefix after minify_css; the output will be expanded again"
        ));
    }
    report
}

/// Returns the tasks of one dependency cycle, first task repeated at the end.
fn find_cycle(tasks: &[TaskSpec]) -> Option<Vec<String>> {
    let graph: BTreeMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|task| {
            (
                task.name.as_str(),
                task.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        path.push(node);
        for dep in graph.get(node).into_iter().flatten() {
            if graph.contains_key(dep)
                && let Some(cycle) = visit(*dep, graph, marks, path)
            {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for node in graph.keys() {
        let mut path = Vec::new();
        if let Some(cycle) = visit(*node, &graph, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::default_registry;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config_in(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig::default().rooted_at(root)
    }

    #[test]
    fn default_config_is_valid() {
        let temp = tempdir().unwrap();
        let report = validate_config(&config_in(temp.path()), &default_registry());
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.contains("does not exist"))
        );
    }

    #[test]
    fn duplicate_names_and_unknown_stages_are_errors() {
        let temp = tempdir().unwrap();
        let mut config = config_in(temp.path());
        let mut copy = config.tasks[0].clone();
        copy.stages.push(StageSpec::named("teleport"));
        config.tasks.push(copy);

        let report = validate_config(&config, &default_registry());
        assert!(report.errors.iter().any(|e| e.contains("more than once")));
        assert!(report.errors.iter().any(|e| e.contains("teleport")));
    }

    #[test]
    fn bad_stage_params_are_reported_with_context() {
        let temp = tempdir().unwrap();
        let mut config = config_in(temp.path());
        config.tasks[3].stages[0] =
            StageSpec::with_params("optimize_image", json!({ "jpeg_quality": 500 }));
        let report = validate_config(&config, &default_registry());
        assert!(
            report
                .errors
                .iter()
                .any(|e| e.contains("Task 'media' stage 1 ('optimize_image')"))
        );
    }

    #[test]
    fn cycles_and_escaping_outputs_are_errors() {
        let temp = tempdir().unwrap();
        let mut config = config_in(temp.path());
        config.tasks[0].depends_on = vec!["style".into()];
        config.tasks[1].depends_on = vec!["html".into()];
        config.tasks[2].output = PathBuf::from("../elsewhere");

        let report = validate_config(&config, &default_registry());
        assert!(
            report
                .errors
                .iter()
                .any(|e| e.contains("cycle detected: html -> style -> html"))
        );
        assert!(report.errors.iter().any(|e| e.contains("inside the output")));
    }

    #[test]
    fn stage_order_warnings() {
        let temp = tempdir().unwrap();
        let mut config = config_in(temp.path());
        config.tasks[2].stages.push(StageSpec::named("minify_js"));
        config.tasks[0].stages.retain(|stage| stage.stage != "write");

        let report = validate_config(&config, &default_registry());
        assert!(report.is_ok());
        assert!(report.warnings.iter().any(|w| w.contains("after the final write")));
        assert!(report.warnings.iter().any(|w| w.contains("no write stage")));
    }

    #[test]
    fn empty_inputs_are_warned_when_source_exists() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::write(temp.path().join("src/index.html"), "<p>hi</p>").unwrap();
        let report = validate_config(&config_in(temp.path()), &default_registry());
        assert!(report.is_ok());
        assert!(
            !report
                .warnings
                .iter()
                .any(|w| w.contains("Task 'html' inputs match no files"))
        );
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.contains("Task 'style' inputs match no files"))
        );
    }
}
