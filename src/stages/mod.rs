use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::pipeline::{Artifact, PipelineContext, Stage, StageParameters, StageRegistry};

pub mod markup;
pub mod media;
pub mod script;
pub mod style;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("minify_html", |params| {
        Ok(Box::new(markup::MinifyHtmlStage::from_params(params)?))
    });
    registry.register("sass", |params| {
        Ok(Box::new(style::SassStage::from_params(params)?))
    });
    registry.register("group_media", |params| {
        Ok(Box::new(style::GroupMediaStage::from_params(params)?))
    });
    registry.register("autoprefix", |params| {
        Ok(Box::new(style::AutoprefixStage::from_params(params)?))
    });
    registry.register("minify_css", |params| {
        Ok(Box::new(style::MinifyCssStage::from_params(params)?))
    });
    registry.register("bundle_js", |params| {
        Ok(Box::new(script::BundleStage::from_params(params)?))
    });
    registry.register("transpile_js", |params| {
        Ok(Box::new(script::TranspileJsStage::from_params(params)?))
    });
    registry.register("minify_js", |params| {
        Ok(Box::new(script::MinifyJsStage::from_params(params)?))
    });
    registry.register("optimize_image", |params| {
        Ok(Box::new(media::OptimizeImageStage::from_params(params)?))
    });
    registry.register("rename", |params| {
        Ok(Box::new(RenameStage::from_params(params)?))
    });
    registry.register("write", |params| {
        Ok(Box::new(WriteStage::from_params(params)?))
    });
}

pub fn default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    registry
}

struct RenameStage {
    extension: Option<String>,
    suffix: Option<String>,
}

impl RenameStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let extension = take_string(&mut params, "extension");
        let suffix = take_string(&mut params, "suffix");
        reject_unknown("rename", &params)?;
        if extension.is_none() && suffix.is_none() {
            bail!("rename stage requires an 'extension' or 'suffix' parameter");
        }
        Ok(Self { extension, suffix })
    }
}

impl Stage for RenameStage {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        if let Some(suffix) = &self.suffix {
            let stem = artifact
                .relative
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let renamed = match artifact.extension() {
                Some(ext) => format!("{stem}{suffix}.{ext}"),
                None => format!("{stem}{suffix}"),
            };
            artifact.relative.set_file_name(renamed);
        }
        if let Some(extension) = &self.extension {
            artifact.set_extension(extension);
        }
        Ok(())
    }
}

struct WriteStage {
    source_map: bool,
}

impl WriteStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let source_map = take_bool(&mut params, "source_map").unwrap_or(true);
        reject_unknown("write", &params)?;
        Ok(Self { source_map })
    }
}

impl Stage for WriteStage {
    fn name(&self) -> &'static str {
        "write"
    }

    fn run(&self, artifact: &mut Artifact, ctx: &PipelineContext) -> Result<()> {
        let target = resolve_output_path(&ctx.output_dir, &artifact.relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }

        let mut data = artifact.data.clone();
        let mut map_target = None;
        if self.source_map
            && let Some(map) = &artifact.source_map
        {
            let map_name = format!("{}.map", artifact.file_name());
            let comment = if artifact.extension().as_deref() == Some("css") {
                format!("\n/*# sourceMappingURL={map_name} */\n")
            } else {
                format!("\n//# sourceMappingURL={map_name}\n")
            };
            data.extend_from_slice(comment.as_bytes());
            let path = target.with_file_name(&map_name);
            fs::write(&path, map)
                .with_context(|| format!("Failed to write source map: {}", path.display()))?;
            map_target = Some(path);
        }

        fs::write(&target, &data)
            .with_context(|| format!("Failed to write output file: {}", target.display()))?;
        artifact.metadata.insert(
            "output_path".to_string(),
            Value::String(target.to_string_lossy().to_string()),
        );
        artifact.emitted.push(target);
        artifact.emitted.extend(map_target);
        Ok(())
    }
}

/// Joins `relative` onto the task output directory, refusing anything that
/// would land outside of it.
fn resolve_output_path(output_dir: &Path, relative: &Path) -> Result<PathBuf> {
    let mut resolved = output_dir.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => bail!(
                "Output path '{}' escapes the task output directory",
                relative.display()
            ),
        }
    }
    if resolved == output_dir {
        bail!("Output path is empty");
    }
    Ok(resolved)
}

pub(crate) fn reject_unknown(stage: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let keys: Vec<_> = params.keys().cloned().collect();
    Err(anyhow!(
        "{stage} stage does not accept parameter(s): {}",
        keys.join(", ")
    ))
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub(crate) fn take_bool(params: &mut StageParameters, key: &str) -> Option<bool> {
    params.remove(key).as_ref().and_then(value_as_bool)
}

pub(crate) fn take_u8(params: &mut StageParameters, key: &str) -> Result<Option<u8>> {
    let Some(value) = params.remove(key) else {
        return Ok(None);
    };
    let number = value_as_u64(&value)
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| anyhow!("'{key}' must be an integer in 0..=255, got {value}"))?;
    Ok(Some(number))
}

pub(crate) fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Vec<String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => bail!("'{key}' entries must be strings, got {other}"),
            })
            .collect(),
        Some(other) => bail!("'{key}' must be a list of strings, got {other}"),
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(num) => num.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn params(value: Value) -> StageParameters {
        match value {
            Value::Object(map) => map,
            _ => StageParameters::new(),
        }
    }

    #[test]
    fn output_paths_cannot_escape() {
        let out = Path::new("/tmp/dist");
        assert!(resolve_output_path(out, Path::new("../evil.css")).is_err());
        assert!(resolve_output_path(out, Path::new("/etc/passwd")).is_err());
        assert_eq!(
            resolve_output_path(out, Path::new("./img/a.png")).unwrap(),
            PathBuf::from("/tmp/dist/img/a.png")
        );
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let err = RenameStage::from_params(params(json!({ "extension": "min.js", "typo": 1 })))
            .err()
            .expect("typo must be rejected");
        assert!(err.to_string().contains("typo"));
    }

    #[test]
    fn rename_applies_suffix_then_extension() {
        let stage =
            RenameStage::from_params(params(json!({ "suffix": "-v2", "extension": "min.css" })))
                .unwrap();
        let mut artifact =
            Artifact::from_bytes(Path::new("main.css"), Path::new("main.css"), Vec::new());
        let ctx = PipelineContext {
            task: "style".into(),
            source_dir: PathBuf::from("src"),
            output_dir: PathBuf::from("dist"),
        };
        stage.run(&mut artifact, &ctx).unwrap();
        assert_eq!(artifact.relative, PathBuf::from("main-v2.min.css"));
    }

    #[test]
    fn write_emits_source_map_next_to_output() {
        let temp = tempdir().unwrap();
        let ctx = PipelineContext {
            task: "style".into(),
            source_dir: temp.path().join("src"),
            output_dir: temp.path().join("dist"),
        };
        let mut artifact = Artifact::from_bytes(
            Path::new("main.scss"),
            Path::new("main.min.css"),
            b"a{color:red}".to_vec(),
        );
        artifact.source_map = Some("{\"version\":3}".to_string());

        let stage = WriteStage::from_params(StageParameters::new()).unwrap();
        stage.run(&mut artifact, &ctx).unwrap();

        let css = fs::read_to_string(temp.path().join("dist/main.min.css")).unwrap();
        assert!(css.starts_with("a{color:red}"));
        assert!(css.contains("/*# sourceMappingURL=main.min.css.map */"));
        assert!(temp.path().join("dist/main.min.css.map").is_file());
        assert_eq!(artifact.emitted.len(), 2);
    }
}
