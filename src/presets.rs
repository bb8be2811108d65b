use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{DEFAULT_CONFIG_FILE, PipelineConfig, default_tasks};

/// Project scaffolds written by `assetpipe init`.
pub const PRESETS: &[&str] = &["standard", "static"];

const STARTER_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <title>assetpipe starter</title>
    <!-- compiled by the style task -->
    <link rel="stylesheet" href="main.min.css">
  </head>
  <body>
    <main class="layout">
      <h1>It works</h1>
      <p id="greeting"></p>
    </main>
    <script src="index.min.js"></script>
  </body>
</html>
"#;

const STARTER_SCSS: &str = r#"$accent: #3b6ea5;

.layout {
  display: flex;
  flex-direction: column;
  gap: 1rem;

  h1 {
    color: $accent;
  }
}

@media (max-width: 600px) {
  .layout {
    padding: 0.5rem;
  }
}
"#;

const STARTER_JS: &str = r#"var greet = require('./greeting');

document.getElementById('greeting').textContent = greet('assetpipe');
"#;

const STARTER_GREETING_JS: &str = r#"module.exports = function greet(name) {
  return 'Hello from ' + name + '!';
};
"#;

#[derive(Debug, Default)]
pub struct InitOutcome {
    pub config: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

fn preset_config(name: &str) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::default();
    match name {
        "standard" => {}
        "static" => {
            config.tasks = default_tasks()
                .into_iter()
                .filter(|task| task.name == "html" || task.name == "media")
                .collect();
        }
        other => bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
    Ok(config)
}

fn starter_files(name: &str) -> Vec<(&'static str, &'static str)> {
    let mut files = vec![("index.html", STARTER_HTML), ("img/.gitkeep", "")];
    if name == "standard" {
        files.push(("styles/main.scss", STARTER_SCSS));
        files.push(("scripts/index.js", STARTER_JS));
        files.push(("scripts/greeting.js", STARTER_GREETING_JS));
    }
    files
}

/// Writes a configuration file and a starter source tree into `root`.
/// Existing source files are never overwritten; the configuration is only
/// replaced with `force`.
pub fn init_project(root: &Path, preset: &str, force: bool) -> Result<InitOutcome> {
    let config = preset_config(preset)?;
    let config_path = root.join(DEFAULT_CONFIG_FILE);
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            config_path.display()
        );
    }

    let mut outcome = InitOutcome {
        config: config_path.clone(),
        ..InitOutcome::default()
    };
    let rendered = serde_yaml::to_string(&config)?;
    write_file(&config_path, &rendered)?;

    let source_dir = root.join(&config.source_dir);
    for (relative, content) in starter_files(preset) {
        let path = source_dir.join(relative);
        if path.exists() {
            outcome.skipped.push(path);
            continue;
        }
        write_file(&path, content)?;
        outcome.created.push(path);
    }
    Ok(outcome)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_writes_loadable_config_and_sources() {
        let temp = tempdir().unwrap();
        let outcome = init_project(temp.path(), "standard", false).unwrap();
        assert_eq!(outcome.created.len(), 5);

        let config = PipelineConfig::load(&outcome.config).unwrap();
        assert_eq!(config.task_names(), vec!["html", "style", "scripts", "media"]);
        assert!(temp.path().join("src/styles/main.scss").is_file());
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempdir().unwrap();
        init_project(temp.path(), "static", false).unwrap();
        let err = init_project(temp.path(), "static", false).unwrap_err();
        assert!(err.to_string().contains("--force"));

        let outcome = init_project(temp.path(), "static", true).unwrap();
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.skipped.len(), 2);
        let config = PipelineConfig::load(&outcome.config).unwrap();
        assert_eq!(config.task_names(), vec!["html", "media"]);
    }

    #[test]
    fn unknown_preset_lists_available() {
        let temp = tempdir().unwrap();
        let err = init_project(temp.path(), "print", false).unwrap_err();
        assert!(err.to_string().contains("standard, static"));
    }
}
