use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern, glob};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::pipeline::StageSpec;

pub const DEFAULT_CONFIG_FILE: &str = "assetpipe.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_tasks")]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub server: ServerSpec,
    #[serde(default)]
    pub watch: WatchSpec,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            source_dir: default_source_dir(),
            output_dir: default_output_dir(),
            tasks: default_tasks(),
            server: ServerSpec::default(),
            watch: WatchSpec::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration file. Relative source and output directories are
    /// resolved against the directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok(config.rooted_at(root))
    }

    /// Loads `path` when it exists, otherwise falls back to the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::load(path)
        } else {
            tracing::debug!(config = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn rooted_at(mut self, root: &Path) -> Self {
        if self.source_dir.is_relative() {
            self.source_dir = root.join(&self.source_dir);
        }
        if self.output_dir.is_relative() {
            self.output_dir = root.join(&self.output_dir);
        }
        self
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskSpec {
    pub name: String,
    pub inputs: Vec<String>,
    #[serde(default = "default_task_output")]
    pub output: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<String>,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSpec {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub live_reload: bool,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            live_reload: true,
        }
    }
}

impl ServerSpec {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid server host: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchSpec {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchSpec {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// A source file matched by a task input glob.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InputFile {
    pub path: PathBuf,
    /// Path below the glob's literal base directory; mirrored into the output.
    pub relative: PathBuf,
}

/// Resolves input globs below `source_dir`. Missing matches are not an
/// error: a task with nothing to do simply produces no outputs.
pub fn expand_inputs(source_dir: &Path, patterns: &[String]) -> Result<Vec<InputFile>> {
    let escaped_root = Pattern::escape(&source_dir.to_string_lossy());
    let mut resolved = BTreeMap::new();
    for pattern in patterns {
        for alternative in expand_braces(pattern) {
            let base = source_dir.join(literal_base(&alternative));
            let full = format!("{}/{}", escaped_root, alternative);
            let matches =
                glob(&full).with_context(|| format!("Invalid glob pattern: {}", pattern))?;
            for entry in matches {
                let path = entry?;
                if !path.is_file() {
                    continue;
                }
                let relative = path
                    .strip_prefix(&base)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));
                resolved.insert(path.clone(), InputFile { path, relative });
            }
        }
    }
    Ok(resolved.into_values().collect())
}

/// Expands `{a,b}` alternation, which the `glob` crate does not support.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|offset| open + offset) else {
        return vec![pattern.to_string()];
    };
    let head = &pattern[..open];
    let tail = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{head}{alt}{tail}")))
        .collect()
}

/// Directory prefix of a glob that contains no wildcard. For a literal file
/// path this is its parent directory.
pub fn literal_base(pattern: &str) -> PathBuf {
    let components: Vec<&str> = pattern.split('/').collect();
    let first_wild = components
        .iter()
        .position(|c| c.contains(['*', '?', '[', '{']));
    let end = first_wild.unwrap_or(components.len().saturating_sub(1));
    components[..end]
        .iter()
        .filter(|c| !c.is_empty() && **c != ".")
        .collect()
}

/// Compiles a glob (with brace alternation) into patterns matched against
/// paths relative to the source directory.
pub fn compile_patterns(pattern: &str) -> Result<Vec<Pattern>> {
    expand_braces(pattern)
        .iter()
        .map(|alt| Pattern::new(alt).with_context(|| format!("Invalid glob pattern: {pattern}")))
        .collect()
}

pub fn relative_match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn default_version() -> u32 {
    1
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("src")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_task_output() -> PathBuf {
    PathBuf::from(".")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    100
}

const MEDIA_GLOB: &str = "img/**/*.{jpg,png,svg,gif,ico,webp}";

pub fn default_tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec {
            name: "html".into(),
            inputs: vec!["*.html".into()],
            output: default_task_output(),
            depends_on: Vec::new(),
            watch: vec!["*.html".into()],
            stages: vec![
                StageSpec::with_params(
                    "minify_html",
                    json!({ "remove_comments": true, "collapse_whitespace": true }),
                ),
                StageSpec::named("write"),
            ],
        },
        TaskSpec {
            name: "style".into(),
            inputs: vec!["styles/main.scss".into()],
            output: default_task_output(),
            depends_on: Vec::new(),
            watch: vec!["styles/**/*.scss".into()],
            stages: vec![
                StageSpec::with_params("sass", json!({ "style": "expanded" })),
                StageSpec::named("group_media"),
                StageSpec::with_params(
                    "autoprefix",
                    json!({
                        "targets": [
                            "chrome 49", "firefox 52", "safari 8", "ios_saf 8",
                            "edge 15", "ie 10", "android 4.4"
                        ]
                    }),
                ),
                StageSpec::named("write"),
                StageSpec::with_params("minify_css", json!({ "source_map": true })),
                StageSpec::with_params("rename", json!({ "extension": "min.css" })),
                StageSpec::named("write"),
            ],
        },
        TaskSpec {
            name: "scripts".into(),
            inputs: vec!["scripts/index.js".into()],
            output: default_task_output(),
            depends_on: Vec::new(),
            watch: vec!["scripts/**/*.js".into()],
            stages: vec![
                StageSpec::named("bundle_js"),
                StageSpec::with_params("transpile_js", json!({ "target": "es5" })),
                StageSpec::with_params("rename", json!({ "extension": "min.js" })),
                StageSpec::named("minify_js"),
                StageSpec::named("write"),
            ],
        },
        TaskSpec {
            name: "media".into(),
            inputs: vec![MEDIA_GLOB.into()],
            output: PathBuf::from("img"),
            depends_on: Vec::new(),
            watch: vec![MEDIA_GLOB.into()],
            stages: vec![
                StageSpec::with_params(
                    "optimize_image",
                    json!({ "jpeg_quality": 75, "png_level": 5, "svg_remove_view_box": true }),
                ),
                StageSpec::named("write"),
            ],
        },
    ]
}
