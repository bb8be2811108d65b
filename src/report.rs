use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glob::{Pattern, glob};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::observability::MetricsSnapshot;
use crate::task::BuildRun;

#[derive(Debug, Serialize)]
pub struct OutputDigest {
    /// Path relative to the output directory, `/`-separated.
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Serialize)]
pub struct BuildReport<'a> {
    pub generated_at: DateTime<Utc>,
    pub succeeded: bool,
    pub run: &'a BuildRun,
    pub files: Vec<OutputDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

impl<'a> BuildReport<'a> {
    pub fn new(
        run: &'a BuildRun,
        output_dir: &Path,
        metrics: Option<MetricsSnapshot>,
    ) -> Result<Self> {
        let mut files = Vec::new();
        for path in run.outputs() {
            let bytes = fs::metadata(path)
                .with_context(|| format!("Failed to stat output: {}", path.display()))?
                .len();
            files.push(OutputDigest {
                path: relative_display(path, output_dir),
                bytes,
                sha256: compute_sha256(path)?,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self {
            generated_at: Utc::now(),
            succeeded: run.succeeded(),
            run,
            files,
            metrics,
        })
    }

    pub fn write(&self, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let rendered = serde_json::to_string_pretty(self)?;
        fs::write(destination, rendered)
            .with_context(|| format!("Failed to write build report: {}", destination.display()))
    }
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of every file below `root`, keyed by relative path.
pub fn digest_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let pattern = format!("{}/**/*", Pattern::escape(&root.to_string_lossy()));
    let mut digests = BTreeMap::new();
    for entry in glob(&pattern).context("Invalid output directory path")? {
        let path = entry?;
        if path.is_file() {
            digests.insert(relative_display(&path, root), compute_sha256(&path)?);
        }
    }
    Ok(digests)
}

fn relative_display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskResult, TaskStatus};
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        fs::write(&file_path, b"assetpipe").unwrap();
        assert_eq!(
            compute_sha256(&file_path).unwrap(),
            "f40ccb682234933afdbdd59cdafc9abb44eccfb47e9143cb01de77ae60bdbe7a"
        );
    }

    #[test]
    fn report_lists_outputs_relative_to_dist() {
        let temp = tempdir().unwrap();
        let dist = temp.path().join("dist");
        fs::create_dir_all(dist.join("img")).unwrap();
        fs::write(dist.join("img/a.png"), b"png").unwrap();
        fs::write(dist.join("main.css"), b"a{}").unwrap();

        let mut recorder = BuildRun::start();
        recorder.record(TaskResult {
            task: "style".into(),
            status: TaskStatus::Success,
            outputs: vec![dist.join("main.css")],
            duration_ms: 2.0,
        });
        recorder.record(TaskResult {
            task: "media".into(),
            status: TaskStatus::Success,
            outputs: vec![dist.join("img/a.png")],
            duration_ms: 3.0,
        });
        let run = recorder.finish();

        let report = BuildReport::new(&run, &dist, None).unwrap();
        let paths: Vec<_> = report.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["img/a.png", "main.css"]);

        let destination = temp.path().join("reports/build.json");
        report.write(&destination).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(destination).unwrap()).unwrap();
        assert_eq!(json["succeeded"], true);
        assert_eq!(json["files"][1]["bytes"], 3);

        let tree = digest_tree(&dist).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.contains_key("img/a.png"));
        assert!(!tree.contains_key("img"));
    }
}
