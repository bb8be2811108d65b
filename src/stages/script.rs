//! Script bundling, transpilation and minification.
//!
//! `bundle_js` follows `require()` calls from an entry file and wraps every
//! reachable module in a small CommonJS runtime. Module ids are assigned in
//! breadth-first discovery order so identical inputs give identical bundles.
//! Each stage leaves a source map on the artifact; later stages compose their
//! own map onto it so the written map points at the original modules.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use oxc::allocator::Allocator;
use oxc::codegen::{Codegen, CodegenOptions};
use oxc::minifier::{Minifier, MinifierOptions};
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use oxc::transformer::{TransformOptions, Transformer};
use parcel_sourcemap::{OriginalLocation, SourceMap};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::{reject_unknown, take_string};
use crate::pipeline::{Artifact, PipelineContext, Stage, StageParameters};

static REQUIRE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[^.\w$])require\s*\(\s*(?:"([^"]+)"|'([^']+)')\s*\)"#)
        .expect("valid require regex")
});

const RUNTIME_PRELUDE: &str = r#"(function (modules, entry) {
  var cache = {};
  function load(id) {
    if (cache[id]) return cache[id].exports;
    var module = cache[id] = { exports: {} };
    var deps = modules[id][1];
    modules[id][0].call(module.exports, function (name) {
      if (!(name in deps)) throw new Error("Cannot find module '" + name + "'");
      return load(deps[name]);
    }, module, module.exports);
    return module.exports;
  }
  load(entry);
})({
"#;

pub struct BundleStage;

impl BundleStage {
    pub fn from_params(params: StageParameters) -> Result<Self> {
        reject_unknown("bundle_js", &params)?;
        Ok(Self)
    }
}

impl Stage for BundleStage {
    fn name(&self) -> &'static str {
        "bundle_js"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let bundle = bundle_commonjs(&artifact.input_path, artifact.text()?)?;
        artifact.metadata.insert(
            "js.module_count".to_string(),
            Value::from(bundle.module_count),
        );
        artifact.replace_data(bundle.code.into_bytes());
        artifact.source_map = Some(bundle.source_map);
        Ok(())
    }
}

#[derive(Debug)]
pub struct Bundle {
    pub code: String,
    /// Line-level map back to each bundled module, sources relative to the
    /// entry's directory.
    pub source_map: String,
    pub module_count: usize,
}

struct Module {
    path: PathBuf,
    source: String,
    deps: BTreeMap<String, usize>,
}

pub fn bundle_commonjs(entry_path: &Path, entry_source: &str) -> Result<Bundle> {
    let entry_key = fs::canonicalize(entry_path).unwrap_or_else(|_| entry_path.to_path_buf());
    let mut modules = vec![Module {
        path: entry_key.clone(),
        source: entry_source.to_string(),
        deps: BTreeMap::new(),
    }];
    let mut ids: HashMap<PathBuf, usize> = HashMap::from([(entry_key, 0)]);

    let mut cursor = 0;
    while cursor < modules.len() {
        let dir = modules[cursor]
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let specifiers = require_specifiers(&modules[cursor].source);
        for specifier in specifiers {
            let resolved = resolve_module(&dir, &specifier).with_context(|| {
                format!(
                    "Cannot resolve '{}' required from {}",
                    specifier,
                    modules[cursor].path.display()
                )
            })?;
            let id = match ids.get(&resolved) {
                Some(id) => *id,
                None => {
                    let source = fs::read_to_string(&resolved).with_context(|| {
                        format!("Failed to read module: {}", resolved.display())
                    })?;
                    let id = modules.len();
                    debug!(module = %resolved.display(), id, "Discovered module");
                    modules.push(Module {
                        path: resolved.clone(),
                        source,
                        deps: BTreeMap::new(),
                    });
                    ids.insert(resolved, id);
                    id
                }
            };
            modules[cursor].deps.insert(specifier, id);
        }
        cursor += 1;
    }

    let root = modules[0]
        .path
        .parent()
        .map(|dir| dir.to_string_lossy().to_string())
        .unwrap_or_default();
    let (code, source_map) = render_bundle(&modules, &root)?;
    Ok(Bundle {
        code,
        source_map,
        module_count: modules.len(),
    })
}

fn require_specifiers(source: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for captures in REQUIRE_CALL.captures_iter(source) {
        let specifier = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str().to_string());
        if let Some(specifier) = specifier
            && !seen.contains(&specifier)
        {
            seen.push(specifier);
        }
    }
    seen
}

fn resolve_module(dir: &Path, specifier: &str) -> Result<PathBuf> {
    let is_path = specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/');
    if is_path {
        let base = dir.join(specifier);
        return resolve_file(&base)
            .or_else(|| resolve_directory(&base))
            .ok_or_else(|| anyhow!("no file at {}", base.display()));
    }

    for ancestor in dir.ancestors() {
        let candidate = ancestor.join("node_modules").join(specifier);
        if let Some(found) = resolve_file(&candidate).or_else(|| resolve_directory(&candidate)) {
            return Ok(found);
        }
    }
    bail!("package '{specifier}' not found in any node_modules directory")
}

fn resolve_file(base: &Path) -> Option<PathBuf> {
    let mut candidates = vec![base.to_path_buf()];
    for ext in ["js", "json"] {
        let mut name = base.as_os_str().to_owned();
        name.push(format!(".{ext}"));
        candidates.push(PathBuf::from(name));
    }
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .and_then(|found| fs::canonicalize(found).ok())
}

fn resolve_directory(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    let manifest = dir.join("package.json");
    if let Ok(content) = fs::read_to_string(&manifest)
        && let Ok(package) = serde_json::from_str::<Value>(&content)
        && let Some(main) = package.get("main").and_then(Value::as_str)
        && let Some(found) = resolve_file(&dir.join(main))
    {
        return Some(found);
    }
    resolve_file(&dir.join("index.js"))
}

fn render_bundle(modules: &[Module], root: &str) -> Result<(String, String)> {
    let mut code = String::from(RUNTIME_PRELUDE);
    let mut map = SourceMap::new(root);
    let mut line = RUNTIME_PRELUDE.matches('\n').count() as u32;
    for (id, module) in modules.iter().enumerate() {
        let is_json = module.path.extension().and_then(|e| e.to_str()) == Some("json");
        let body = if is_json {
            format!("module.exports = {};", module.source.trim())
        } else {
            module.source.clone()
        };

        if !is_json {
            let source = map.add_source(&module.path.to_string_lossy());
            map.set_source_content(source as usize, &module.source)
                .map_err(|err| anyhow!("Failed to embed {}: {err}", module.path.display()))?;
            // body starts on the line after the wrapper header
            for offset in 0..module.source.lines().count() as u32 {
                map.add_mapping(
                    line + 1 + offset,
                    0,
                    Some(OriginalLocation::new(offset, 0, source, None)),
                );
            }
        }

        let deps = serde_json::to_string(&module.deps)?;
        let separator = if id + 1 == modules.len() { "" } else { "," };
        let start = code.len();
        writeln!(
            code,
            "{id}: [function (require, module, exports) {{\n{body}\n}}, {deps}]{separator}"
        )?;
        line += code[start..].matches('\n').count() as u32;
    }
    code.push_str("}, 0);\n");
    let source_map = map
        .to_json(None)
        .map_err(|err| anyhow!("Failed to serialise bundle source map: {err}"))?;
    Ok((code, source_map))
}

pub struct TranspileJsStage {
    target: String,
}

impl TranspileJsStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let target = take_string(&mut params, "target").unwrap_or_else(|| "es5".to_string());
        reject_unknown("transpile_js", &params)?;
        transform_options(&target)?;
        Ok(Self { target })
    }
}

impl Stage for TranspileJsStage {
    fn name(&self) -> &'static str {
        "transpile_js"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let options = transform_options(&self.target)?;
        rewrite_script(artifact, ScriptPass::Transpile(&options))
    }
}

fn transform_options(target: &str) -> Result<TransformOptions> {
    TransformOptions::from_target(target)
        .map_err(|err| anyhow!("Invalid JavaScript target '{target}': {err}"))
}

pub struct MinifyJsStage;

impl MinifyJsStage {
    pub fn from_params(params: StageParameters) -> Result<Self> {
        reject_unknown("minify_js", &params)?;
        Ok(Self)
    }
}

impl Stage for MinifyJsStage {
    fn name(&self) -> &'static str {
        "minify_js"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        rewrite_script(artifact, ScriptPass::Minify)
    }
}

enum ScriptPass<'o> {
    Transpile(&'o TransformOptions),
    Minify,
}

/// Parses the artifact as a classic script, applies `pass`, and prints it
/// back with a source map chained onto whatever map the artifact carried.
fn rewrite_script(artifact: &mut Artifact, pass: ScriptPass<'_>) -> Result<()> {
    let source = artifact.text()?.to_string();
    let display = artifact.input_path.display().to_string();
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, &source, SourceType::cjs()).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        bail!(
            "JavaScript syntax error in {display}: {}",
            join_diagnostics(&parsed.errors)
        );
    }
    let mut program = parsed.program;

    let minify = match pass {
        ScriptPass::Transpile(options) => {
            let (symbols, scopes) = SemanticBuilder::new()
                .build(&program)
                .semantic
                .into_symbol_table_and_scope_tree();
            let transformed = Transformer::new(&allocator, &artifact.input_path, options)
                .build_with_symbols_and_scopes(symbols, scopes, &mut program);
            if !transformed.errors.is_empty() {
                bail!(
                    "Failed to transpile {display}: {}",
                    join_diagnostics(&transformed.errors)
                );
            }
            false
        }
        ScriptPass::Minify => {
            Minifier::new(MinifierOptions::default()).build(&allocator, &mut program);
            true
        }
    };

    let map_name = artifact
        .input_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| artifact.relative.clone());
    let printed = Codegen::new()
        .with_options(CodegenOptions {
            minify,
            source_map_path: Some(map_name),
            ..CodegenOptions::default()
        })
        .build(&program);
    let generated = printed
        .map
        .map(|map| map.to_json_string())
        .ok_or_else(|| anyhow!("No source map generated for {display}"))?;

    artifact.source_map = Some(chain_source_maps(
        artifact.source_map.as_deref(),
        &generated,
    )?);
    artifact.replace_data(printed.code.into_bytes());
    Ok(())
}

/// Rewrites `next` so its mappings point through `previous` to the original
/// sources.
fn chain_source_maps(previous: Option<&str>, next: &str) -> Result<String> {
    let mut composed = SourceMap::from_json("/", next)
        .map_err(|err| anyhow!("Failed to read generated source map: {err}"))?;
    if let Some(previous) = previous {
        let mut previous = SourceMap::from_json("/", previous)
            .map_err(|err| anyhow!("Failed to read previous source map: {err}"))?;
        composed
            .extends(&mut previous)
            .map_err(|err| anyhow!("Failed to compose source maps: {err}"))?;
    }
    composed
        .to_json(None)
        .map_err(|err| anyhow!("Failed to serialise source map: {err}"))
}

fn join_diagnostics<E: ToString>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
