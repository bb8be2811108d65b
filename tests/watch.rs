use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use assetpipe::observability::MetricsCollector;
use assetpipe::orchestrator::OrchestratorState;
use assetpipe::stages;
use assetpipe::watch::{BindingSet, Watcher};
use assetpipe::{Orchestrator, PipelineConfig};
use tempfile::tempdir;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn setup(root: &Path) -> Arc<Orchestrator> {
    write(&root.join("src/index.html"), "<p>one</p>");
    write(&root.join("src/styles/main.scss"), "a { color: red; }");
    write(
        &root.join("src/scripts/index.js"),
        "console.log('first');\n",
    );
    let config = PipelineConfig::default().rooted_at(root);
    Arc::new(
        Orchestrator::new(config, &stages::default_registry(), MetricsCollector::new()).unwrap(),
    )
}

#[test]
fn script_change_reruns_only_scripts() {
    let temp = tempdir().unwrap();
    let orchestrator = setup(temp.path());
    orchestrator.build_all().unwrap();
    let css_before = fs::read(temp.path().join("dist/main.min.css")).unwrap();

    let script = temp.path().join("src/scripts/index.js");
    write(&script, "console.log('second');\n");
    write(&temp.path().join("src/styles/main.scss"), "a { color: blue; }");

    let watcher = Watcher::new(
        orchestrator.clone(),
        BindingSet::from_config(orchestrator.config()),
    );
    let results = watcher.dispatch(&[script]);

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task, "scripts");
    assert!(results[0].succeeded());
    let js = fs::read_to_string(temp.path().join("dist/index.min.js")).unwrap();
    assert!(js.contains("second"));
    // style was not rerun, so the stale stylesheet survives
    assert_eq!(
        fs::read(temp.path().join("dist/main.min.css")).unwrap(),
        css_before
    );
}

#[test]
fn failed_rerun_keeps_previous_outputs() {
    let temp = tempdir().unwrap();
    let orchestrator = setup(temp.path());
    orchestrator.build_all().unwrap();

    let sheet = temp.path().join("src/styles/main.scss");
    write(&sheet, "a { color: ");
    let watcher = Watcher::new(
        orchestrator.clone(),
        BindingSet::from_config(orchestrator.config()),
    );
    let results = watcher.dispatch(&[sheet]);

    assert_eq!(results.len(), 1);
    assert!(!results[0].succeeded());
    assert!(temp.path().join("dist/main.min.css").is_file());
}

#[test]
fn live_watcher_rebuilds_on_save() {
    let temp = tempdir().unwrap();
    let orchestrator = setup(temp.path());
    orchestrator.build_all().unwrap();

    let watcher = Watcher::new(
        orchestrator.clone(),
        BindingSet::from_config(orchestrator.config()),
    );
    let handle = watcher.start(Duration::from_millis(50)).unwrap();
    orchestrator.enter_watching();
    assert_eq!(orchestrator.state(), OrchestratorState::Watching);

    write(&temp.path().join("src/index.html"), "<p>two</p>");
    let output = temp.path().join("dist/index.html");
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut rebuilt = false;
    while Instant::now() < deadline {
        if fs::read_to_string(&output).is_ok_and(|html| html.contains("two")) {
            rebuilt = true;
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    handle.stop();

    assert!(rebuilt, "html was not rebuilt after the change");
    assert_eq!(orchestrator.state(), OrchestratorState::Watching);
}
