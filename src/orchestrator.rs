use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::observability::MetricsCollector;
use crate::pipeline::StageRegistry;
use crate::server::DevServer;
use crate::task::{BuildRun, TaskContext, TaskRegistry, TaskResult};
use crate::watch::{BindingSet, WatchHandle, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Cleaning,
    Building,
    Ready,
    Degraded,
    Watching,
}

/// Receives the files written by every successful task run.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, changed: &[PathBuf]);
}

/// Owns the task registry and the output directory. All writes into the
/// output directory go through the tasks it runs.
pub struct Orchestrator {
    config: PipelineConfig,
    tasks: TaskRegistry,
    waves: Vec<Vec<String>>,
    ctx: TaskContext,
    state: Mutex<OrchestratorState>,
    notifiers: RwLock<Vec<Arc<dyn ChangeNotifier>>>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        stages: &StageRegistry,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        if config.source_dir.starts_with(&config.output_dir) {
            return Err(PipelineError::Config(format!(
                "output directory {} must not contain the source directory {}",
                config.output_dir.display(),
                config.source_dir.display()
            ))
            .into());
        }
        let tasks = TaskRegistry::from_config(&config, stages, metrics)?;
        let waves = plan_waves(&tasks)?;
        let ctx = TaskContext::from_config(&config);
        Ok(Self {
            config,
            tasks,
            waves,
            ctx,
            state: Mutex::new(OrchestratorState::Idle),
            notifiers: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn metrics(&self) -> &MetricsCollector {
        self.tasks.metrics()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(OrchestratorState::Idle)
    }

    fn set_state(&self, next: OrchestratorState) {
        if let Ok(mut guard) = self.state.lock()
            && *guard != next
        {
            info!(from = ?*guard, to = ?next, "Pipeline state changed");
            *guard = next;
        }
    }

    pub fn add_notifier(&self, notifier: Arc<dyn ChangeNotifier>) {
        if let Ok(mut guard) = self.notifiers.write() {
            guard.push(notifier);
        }
    }

    pub fn enter_watching(&self) {
        self.set_state(OrchestratorState::Watching);
    }

    /// Removes the whole output directory. A missing directory is fine; any
    /// other failure aborts the run.
    #[instrument(skip(self), fields(output = %self.config.output_dir.display()))]
    pub fn clean(&self) -> Result<(), PipelineError> {
        self.set_state(OrchestratorState::Cleaning);
        let output = &self.config.output_dir;
        match fs::remove_dir_all(output) {
            Ok(()) => info!("Output directory removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("Output directory already absent")
            }
            Err(source) => {
                return Err(PipelineError::Clean {
                    path: output.clone(),
                    source,
                });
            }
        }
        self.set_state(OrchestratorState::Idle);
        Ok(())
    }

    /// Cleans, then runs every task. Tasks in the same dependency wave run
    /// concurrently; a task whose dependency failed is marked failed without
    /// running.
    #[instrument(skip(self))]
    pub fn build_all(&self) -> Result<BuildRun, PipelineError> {
        let started = Instant::now();
        self.clean()?;
        self.set_state(OrchestratorState::Building);

        let mut recorder = BuildRun::start();
        for wave in &self.waves {
            let mut runnable = Vec::new();
            for name in wave {
                let blocked = self
                    .tasks
                    .get(name)
                    .into_iter()
                    .flat_map(|task| task.depends_on.iter())
                    .find(|dep| !recorder.is_successful(dep));
                match blocked {
                    Some(dep) => {
                        warn!(task = name.as_str(), dependency = dep.as_str(), "Skipping task");
                        recorder.record(TaskResult::failed(
                            name,
                            format!("dependency '{dep}' failed"),
                        ));
                    }
                    None => runnable.push(name.as_str()),
                }
            }
            for result in self.run_concurrently(&runnable) {
                if result.succeeded() {
                    self.notify(&result.outputs);
                }
                recorder.record(result);
            }
        }

        let run = recorder.finish();
        self.metrics().record_total_duration(started.elapsed());
        self.set_state(if run.succeeded() {
            OrchestratorState::Ready
        } else {
            OrchestratorState::Degraded
        });
        info!(
            run = run.id(),
            tasks = run.results().len(),
            failed = run.failed_tasks().len(),
            "Build finished"
        );
        Ok(run)
    }

    fn run_concurrently(&self, names: &[&str]) -> Vec<TaskResult> {
        thread::scope(|scope| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let name = *name;
                    (name, scope.spawn(move || self.tasks.run(name, &self.ctx)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| match handle.join() {
                    Ok(Ok(result)) => result,
                    Ok(Err(err)) => TaskResult::failed(name, err.to_string()),
                    Err(_) => TaskResult::failed(name, "task panicked".to_string()),
                })
                .collect()
        })
    }

    /// Reruns a single task without cleaning. Used by one-shot task commands
    /// and by the watcher.
    pub fn run_task(&self, name: &str) -> Result<TaskResult, PipelineError> {
        let previous = self.state();
        self.set_state(OrchestratorState::Building);
        let outcome = self.tasks.run(name, &self.ctx);
        let next = match (&outcome, previous) {
            (_, OrchestratorState::Watching) => OrchestratorState::Watching,
            (Ok(result), _) if result.succeeded() => OrchestratorState::Ready,
            _ => OrchestratorState::Degraded,
        };
        self.set_state(next);
        let result = outcome?;
        if result.succeeded() {
            self.notify(&result.outputs);
        }
        Ok(result)
    }

    fn notify(&self, changed: &[PathBuf]) {
        if changed.is_empty() {
            return;
        }
        if let Ok(guard) = self.notifiers.read() {
            for notifier in guard.iter() {
                notifier.notify(changed);
            }
        }
    }
}

/// Groups tasks into waves so every task comes after the tasks it depends
/// on. Within a wave the registration order is kept.
pub fn plan_waves(tasks: &TaskRegistry) -> Result<Vec<Vec<String>>, PipelineError> {
    let names = tasks.names();
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for task in tasks.tasks() {
        let mut deps = BTreeSet::new();
        for dep in &task.depends_on {
            if tasks.get(dep).is_none() {
                return Err(tasks.unknown(dep));
            }
            deps.insert(dep.as_str());
        }
        remaining.insert(task.name.as_str(), deps);
    }

    let mut waves = Vec::new();
    let mut done: BTreeSet<&str> = BTreeSet::new();
    while !remaining.is_empty() {
        let wave: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| {
                remaining
                    .get(name)
                    .is_some_and(|deps| deps.iter().all(|dep| done.contains(dep)))
            })
            .collect();
        if wave.is_empty() {
            let cycle: Vec<&str> = remaining.keys().copied().collect();
            return Err(PipelineError::DependencyCycle(cycle.join(", ")));
        }
        for name in &wave {
            remaining.remove(name);
            done.insert(*name);
        }
        waves.push(wave.into_iter().map(str::to_string).collect());
    }
    Ok(waves)
}

/// Which long-running services [`OrchestratorContext::start`] brings up.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub watch: bool,
    pub serve: bool,
}

/// Owns the watcher and dev server handles for a running pipeline.
pub struct OrchestratorContext {
    orchestrator: Arc<Orchestrator>,
    watcher: Option<WatchHandle>,
    server: Option<DevServer>,
}

impl OrchestratorContext {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            watcher: None,
            server: None,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn server(&self) -> Option<&DevServer> {
        self.server.as_ref()
    }

    /// Starts the dev server first so a bind failure aborts before any
    /// watcher is registered.
    pub fn start(&mut self, options: StartOptions) -> Result<()> {
        let config = self.orchestrator.config();
        if options.serve && self.server.is_none() {
            let addr = config.server.socket_addr()?;
            let server = DevServer::start(
                addr,
                config.output_dir.clone(),
                config.server.live_reload,
                self.orchestrator.metrics().clone(),
            )?;
            self.orchestrator.add_notifier(Arc::new(server.reload_hub()));
            info!(address = %server.address(), "Dev server listening");
            self.server = Some(server);
        }
        if options.watch && self.watcher.is_none() {
            let bindings = BindingSet::from_config(config);
            let debounce = Duration::from_millis(config.watch.debounce_ms);
            let watcher = Watcher::new(self.orchestrator.clone(), bindings);
            self.watcher = Some(watcher.start(debounce)?);
            self.orchestrator.enter_watching();
        }
        Ok(())
    }

    /// Blocks until Ctrl-C, then stops the services.
    pub fn run_until_shutdown(mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build signal runtime")?;
        runtime
            .block_on(tokio::signal::ctrl_c())
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown requested");
        self.stop();
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }
}

impl Drop for OrchestratorContext {
    fn drop(&mut self) {
        self.stop();
    }
}
