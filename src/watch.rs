//! Filesystem watching.
//!
//! Each task contributes one binding per watch glob. A change that matches a
//! binding reruns exactly the bound task through the orchestrator; `clean`
//! and unrelated tasks are never touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use glob::Pattern;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_mini::{DebouncedEventKind, Debouncer, new_debouncer};
use tracing::{debug, info, warn};

use crate::config::{
    PipelineConfig, compile_patterns, expand_braces, literal_base, relative_match_options,
};
use crate::orchestrator::Orchestrator;
use crate::task::TaskResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBinding {
    pub pattern: String,
    pub task: String,
}

struct CompiledBinding {
    binding: WatchBinding,
    patterns: Vec<Pattern>,
}

/// Static glob-to-task table, built once at startup.
pub struct BindingSet {
    bindings: Vec<CompiledBinding>,
}

impl BindingSet {
    /// Uses each task's `watch` globs, falling back to its inputs.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let bindings = config
            .tasks
            .iter()
            .flat_map(|task| {
                let globs = if task.watch.is_empty() {
                    &task.inputs
                } else {
                    &task.watch
                };
                globs.iter().map(|pattern| WatchBinding {
                    pattern: pattern.clone(),
                    task: task.name.clone(),
                })
            })
            .collect();
        Self::new(bindings)
    }

    /// Bindings whose glob fails to compile are dropped with a warning.
    pub fn new(bindings: Vec<WatchBinding>) -> Self {
        let bindings = bindings
            .into_iter()
            .filter_map(|binding| match compile_patterns(&binding.pattern) {
                Ok(patterns) => Some(CompiledBinding { binding, patterns }),
                Err(err) => {
                    warn!(pattern = binding.pattern.as_str(), error = %err, "Ignoring watch binding");
                    None
                }
            })
            .collect();
        Self { bindings }
    }

    pub fn bindings(&self) -> impl Iterator<Item = &WatchBinding> {
        self.bindings.iter().map(|compiled| &compiled.binding)
    }

    /// Tasks bound to a path relative to the source directory, in binding
    /// order and without repeats.
    pub fn tasks_for(&self, relative: &Path) -> Vec<String> {
        let options = relative_match_options();
        let mut tasks: Vec<String> = Vec::new();
        for compiled in &self.bindings {
            let matched = compiled
                .patterns
                .iter()
                .any(|pattern| pattern.matches_path_with(relative, options));
            if matched && !tasks.contains(&compiled.binding.task) {
                tasks.push(compiled.binding.task.clone());
            }
        }
        tasks
    }

    /// Tasks affected by a batch of changed paths.
    pub fn tasks_for_changes(&self, source_dir: &Path, changed: &[PathBuf]) -> Vec<String> {
        let canonical_source = source_dir.canonicalize().ok();
        let mut tasks: Vec<String> = Vec::new();
        for path in changed {
            let relative = path
                .strip_prefix(source_dir)
                .ok()
                .or_else(|| {
                    canonical_source
                        .as_deref()
                        .and_then(|root| path.strip_prefix(root).ok())
                });
            let Some(relative) = relative else {
                continue;
            };
            for task in self.tasks_for(relative) {
                if !tasks.contains(&task) {
                    tasks.push(task);
                }
            }
        }
        tasks
    }

    /// Directories to observe: the literal base of every glob alternative.
    /// A root is watched recursively when any glob below it spans directories.
    pub fn watch_roots(&self, source_dir: &Path) -> BTreeMap<PathBuf, RecursiveMode> {
        let mut roots = BTreeMap::new();
        for compiled in &self.bindings {
            for alternative in expand_braces(&compiled.binding.pattern) {
                let base = literal_base(&alternative);
                let remainder = Path::new(&alternative)
                    .strip_prefix(&base)
                    .map(|rest| rest.to_string_lossy().to_string())
                    .unwrap_or_else(|_| alternative.clone());
                let mode = if remainder.contains('/') || remainder.contains("**") {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                let entry = roots.entry(source_dir.join(base)).or_insert(mode);
                if mode == RecursiveMode::Recursive {
                    *entry = RecursiveMode::Recursive;
                }
            }
        }
        roots
    }
}

pub struct Watcher {
    orchestrator: Arc<Orchestrator>,
    bindings: BindingSet,
}

impl Watcher {
    pub fn new(orchestrator: Arc<Orchestrator>, bindings: BindingSet) -> Self {
        Self {
            orchestrator,
            bindings,
        }
    }

    /// Reruns the tasks bound to the changed paths, one after another.
    pub fn dispatch(&self, changed: &[PathBuf]) -> Vec<TaskResult> {
        let source_dir = &self.orchestrator.config().source_dir;
        let mut results = Vec::new();
        for task in self.bindings.tasks_for_changes(source_dir, changed) {
            info!(task = task.as_str(), "Change detected, rerunning task");
            match self.orchestrator.run_task(&task) {
                Ok(result) => results.push(result),
                Err(err) => warn!(task = task.as_str(), error = %err, "Rerun failed"),
            }
        }
        results
    }

    /// Registers observers and runs the event loop on a background thread.
    /// Roots that cannot be observed are logged once and skipped.
    pub fn start(self, debounce: Duration) -> Result<WatchHandle> {
        let (tx, rx) = channel();
        let mut debouncer =
            new_debouncer(debounce, tx).context("Failed to initialize file watcher")?;

        let source_dir = self.orchestrator.config().source_dir.clone();
        let mut registered = 0usize;
        for (root, mode) in self.bindings.watch_roots(&source_dir) {
            if !root.is_dir() {
                warn!(path = %root.display(), "Watch path does not exist, skipping");
                continue;
            }
            match debouncer.watcher().watch(&root, mode) {
                Ok(()) => {
                    debug!(path = %root.display(), recursive = mode == RecursiveMode::Recursive, "Watching");
                    registered += 1;
                }
                Err(err) => warn!(path = %root.display(), error = %err, "Failed to watch path"),
            }
        }
        info!(roots = registered, source = %source_dir.display(), "Watching for changes");

        let thread = thread::Builder::new()
            .name("assetpipe-watch".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    match event {
                        Ok(events) => {
                            let changed: Vec<PathBuf> = events
                                .into_iter()
                                .filter(|event| matches!(event.kind, DebouncedEventKind::Any))
                                .map(|event| event.path)
                                .collect();
                            self.dispatch(&changed);
                        }
                        Err(error) => warn!(error = ?error, "Watch error"),
                    }
                }
                debug!("Watch channel closed");
            })
            .context("Failed to spawn watch thread")?;

        Ok(WatchHandle {
            debouncer: Some(debouncer),
            thread: Some(thread),
        })
    }
}

/// Keeps the observers alive. Stopping drops them, which closes the event
/// channel and ends the loop.
pub struct WatchHandle {
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.debouncer.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
