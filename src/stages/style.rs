use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use lightningcss::media_query::MediaList;
use lightningcss::rules::CssRule;
use lightningcss::rules::media::MediaRule;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use lightningcss::traits::ToCss;
use parcel_sourcemap::SourceMap;
use serde_json::Value;
use tracing::debug;

use super::{reject_unknown, take_bool, take_string, take_string_list};
use crate::pipeline::{Artifact, PipelineContext, Stage, StageParameters};

pub struct SassStage {
    style: grass::OutputStyle,
}

impl SassStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let style = match take_string(&mut params, "style").as_deref() {
            None | Some("expanded") => grass::OutputStyle::Expanded,
            Some("compressed") => grass::OutputStyle::Compressed,
            Some(other) => bail!("Unknown sass output style '{other}'"),
        };
        reject_unknown("sass", &params)?;
        Ok(Self { style })
    }
}

impl Stage for SassStage {
    fn name(&self) -> &'static str {
        "sass"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let load_path = artifact
            .input_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let options = grass::Options::default()
            .style(self.style)
            .load_path(&load_path);
        let css = grass::from_string(artifact.text()?.to_string(), &options).map_err(|err| {
            anyhow!(
                "Sass compilation failed for {}: {}",
                artifact.input_path.display(),
                err
            )
        })?;
        artifact.replace_data(css.into_bytes());
        artifact.set_extension("css");
        Ok(())
    }
}

pub struct GroupMediaStage;

impl GroupMediaStage {
    pub fn from_params(params: StageParameters) -> Result<Self> {
        reject_unknown("group_media", &params)?;
        Ok(Self)
    }
}

impl Stage for GroupMediaStage {
    fn name(&self) -> &'static str {
        "group_media"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let filename = artifact.file_name();
        let source = artifact.text()?.to_string();
        let mut stylesheet = parse(&source, &filename)?;
        let grouped = group_media_rules(&mut stylesheet)?;
        debug!(file = %filename, groups = grouped, "Grouped media queries");
        let printed = stylesheet
            .to_css(PrinterOptions::default())
            .map_err(|err| anyhow!("Failed to print {filename}: {err}"))?;
        artifact.replace_data(printed.code.into_bytes());
        Ok(())
    }
}

pub struct AutoprefixStage {
    targets: Targets,
}

impl AutoprefixStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let targets = parse_targets(&take_string_list(&mut params, "targets")?)?;
        reject_unknown("autoprefix", &params)?;
        Ok(Self { targets })
    }
}

impl Stage for AutoprefixStage {
    fn name(&self) -> &'static str {
        "autoprefix"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let filename = artifact.file_name();
        let source = artifact.text()?.to_string();
        let mut stylesheet = parse(&source, &filename)?;
        stylesheet
            .minify(MinifyOptions {
                targets: self.targets,
                ..MinifyOptions::default()
            })
            .map_err(|err| anyhow!("Failed to prefix {filename}: {err}"))?;
        let printed = stylesheet
            .to_css(PrinterOptions {
                minify: false,
                targets: self.targets,
                ..PrinterOptions::default()
            })
            .map_err(|err| anyhow!("Failed to print {filename}: {err}"))?;
        artifact.replace_data(printed.code.into_bytes());
        Ok(())
    }
}

pub struct MinifyCssStage {
    targets: Targets,
    source_map: bool,
}

impl MinifyCssStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let targets = parse_targets(&take_string_list(&mut params, "targets")?)?;
        let source_map = take_bool(&mut params, "source_map").unwrap_or(false);
        reject_unknown("minify_css", &params)?;
        Ok(Self {
            targets,
            source_map,
        })
    }
}

impl Stage for MinifyCssStage {
    fn name(&self) -> &'static str {
        "minify_css"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let filename = artifact.file_name();
        let source = artifact.text()?.to_string();
        let mut stylesheet = parse(&source, &filename)?;
        stylesheet
            .minify(MinifyOptions {
                targets: self.targets,
                ..MinifyOptions::default()
            })
            .map_err(|err| anyhow!("Failed to minify {filename}: {err}"))?;

        let mut source_map = if self.source_map {
            let mut map = SourceMap::new("/");
            map.add_source(&filename);
            map.set_source_content(0, &source)
                .map_err(|err| anyhow!("Failed to embed source for {filename}: {err:?}"))?;
            Some(map)
        } else {
            None
        };

        let printed = stylesheet
            .to_css(PrinterOptions {
                minify: true,
                source_map: source_map.as_mut(),
                targets: self.targets,
                ..PrinterOptions::default()
            })
            .map_err(|err| anyhow!("Failed to print {filename}: {err}"))?;

        artifact.source_map = match source_map.as_mut() {
            Some(map) => Some(
                map.to_json(None)
                    .map_err(|err| anyhow!("Failed to serialise source map: {err:?}"))?,
            ),
            None => None,
        };
        artifact.replace_data(printed.code.into_bytes());
        artifact.metadata.insert(
            "css.minified_bytes".to_string(),
            Value::from(artifact.data.len()),
        );
        Ok(())
    }
}

fn parse<'i>(source: &'i str, filename: &str) -> Result<StyleSheet<'i>> {
    StyleSheet::parse(
        source,
        ParserOptions {
            filename: filename.to_string(),
            ..ParserOptions::default()
        },
    )
    .map_err(|err| anyhow!("Failed to parse {filename}: {err}"))
}

/// Moves top-level `@media` blocks to the end of the sheet, merging blocks
/// with the same query in first-seen order. Returns the number of groups.
pub fn group_media_rules(stylesheet: &mut StyleSheet<'_>) -> Result<usize> {
    let rules = std::mem::take(&mut stylesheet.rules.0);
    let mut others = Vec::with_capacity(rules.len());
    let mut groups: Vec<(String, MediaRule)> = Vec::new();

    for rule in rules {
        match rule {
            CssRule::Media(media) => {
                let key = media_key(&media.query)?;
                match groups.iter_mut().find(|(query, _)| *query == key) {
                    Some((_, existing)) => existing.rules.0.extend(media.rules.0),
                    None => groups.push((key, media)),
                }
            }
            other => others.push(other),
        }
    }

    let count = groups.len();
    others.extend(groups.into_iter().map(|(_, media)| CssRule::Media(media)));
    stylesheet.rules.0 = others;
    Ok(count)
}

fn media_key(query: &MediaList<'_>) -> Result<String> {
    query
        .to_css_string(PrinterOptions::default())
        .map_err(|err| anyhow!("Failed to serialise media query: {err}"))
}

/// Parses entries such as `safari 8` or `android 4.4` into lightningcss
/// browser targets. An empty list means no prefixing.
pub fn parse_targets(entries: &[String]) -> Result<Targets> {
    if entries.is_empty() {
        return Ok(Targets::default());
    }
    let mut browsers = Browsers::default();
    for entry in entries {
        let mut parts = entry.split_whitespace();
        let (Some(name), Some(version), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!("Browser target '{entry}' must look like '<browser> <version>'");
        };
        let version = encode_version(version)
            .with_context(|| format!("Invalid version in browser target '{entry}'"))?;
        let slot = match name.to_lowercase().as_str() {
            "android" => &mut browsers.android,
            "chrome" => &mut browsers.chrome,
            "edge" => &mut browsers.edge,
            "firefox" | "ff" => &mut browsers.firefox,
            "ie" => &mut browsers.ie,
            "ios_saf" | "ios" => &mut browsers.ios_saf,
            "opera" => &mut browsers.opera,
            "safari" => &mut browsers.safari,
            "samsung" => &mut browsers.samsung,
            other => bail!("Unknown browser '{other}' in target '{entry}'"),
        };
        *slot = Some(slot.map_or(version, |existing| existing.min(version)));
    }
    Ok(Targets::from(browsers))
}

fn encode_version(version: &str) -> Result<u32> {
    let mut parts = version.split('.');
    let mut next = || -> Result<u32> {
        match parts.next() {
            Some(part) => part
                .parse::<u32>()
                .with_context(|| format!("'{part}' is not a number")),
            None => Ok(0),
        }
    };
    let major = next()?;
    let minor = next()?;
    let patch = next()?;
    if minor > 255 || patch > 255 {
        bail!("Version component out of range");
    }
    Ok((major << 16) | (minor << 8) | patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn ctx() -> PipelineContext {
        PipelineContext {
            task: "style".into(),
            source_dir: PathBuf::from("src"),
            output_dir: PathBuf::from("dist"),
        }
    }

    fn css_artifact(css: &str) -> Artifact {
        Artifact::from_bytes(
            Path::new("main.css"),
            Path::new("main.css"),
            css.as_bytes().to_vec(),
        )
    }

    #[test]
    fn versions_are_packed_like_lightningcss() {
        assert_eq!(encode_version("8").unwrap(), 8 << 16);
        assert_eq!(encode_version("4.4").unwrap(), (4 << 16) | (4 << 8));
        assert!(encode_version("x").is_err());
    }

    #[test]
    fn unknown_browsers_are_rejected() {
        assert!(parse_targets(&["netscape 4".to_string()]).is_err());
        assert!(parse_targets(&["safari".to_string()]).is_err());
    }

    #[test]
    fn identical_media_queries_are_merged_and_moved_last() {
        let css = "@media (max-width: 600px) { .a { color: red } }\n.b { color: blue }\n@media (max-width: 600px) { .c { color: green } }\n.d { color: black }\n";
        let mut artifact = css_artifact(css);
        GroupMediaStage.run(&mut artifact, &ctx()).unwrap();
        let output = artifact.text().unwrap();
        assert_eq!(output.matches("@media").count(), 1);
        let media_at = output.find("@media").unwrap();
        assert!(output.find(".d").unwrap() < media_at);
        assert!(output.find(".c").unwrap() > media_at);
    }

    #[test]
    fn sass_compiles_nested_rules() {
        let stage = SassStage::from_params(StageParameters::new()).unwrap();
        let mut artifact = Artifact::from_bytes(
            Path::new("main.scss"),
            Path::new("main.scss"),
            b"$c: red;\n.nav { a { color: $c; } }\n".to_vec(),
        );
        stage.run(&mut artifact, &ctx()).unwrap();
        assert!(artifact.text().unwrap().contains(".nav a"));
        assert_eq!(artifact.relative, PathBuf::from("main.css"));
    }

    #[test]
    fn sass_reports_syntax_errors() {
        let stage = SassStage::from_params(StageParameters::new()).unwrap();
        let mut artifact = Artifact::from_bytes(
            Path::new("main.scss"),
            Path::new("main.scss"),
            b".broken { color: red;\n".to_vec(),
        );
        let err = stage.run(&mut artifact, &ctx()).unwrap_err();
        assert!(err.to_string().contains("Sass compilation failed"));
    }

    #[test]
    fn flexbox_gets_prefixed_for_legacy_targets() {
        let mut params = StageParameters::new();
        params.insert("targets".into(), serde_json::json!(["safari 8", "ie 10"]));
        let stage = AutoprefixStage::from_params(params).unwrap();
        let mut artifact = css_artifact(".row { display: flex; }");
        stage.run(&mut artifact, &ctx()).unwrap();
        let output = artifact.text().unwrap();
        assert!(output.contains("-webkit-"));
        assert!(output.contains("display: flex"));
    }

    #[test]
    fn minified_css_carries_a_source_map() {
        let mut params = StageParameters::new();
        params.insert("source_map".into(), Value::Bool(true));
        let stage = MinifyCssStage::from_params(params).unwrap();
        let mut artifact = css_artifact(".a {\n  color: red;\n}\n");
        stage.run(&mut artifact, &ctx()).unwrap();
        assert_eq!(artifact.text().unwrap(), ".a{color:red}");
        let map = artifact.source_map.expect("source map");
        assert!(map.contains("\"mappings\""));
        assert!(map.contains("main.css"));
    }

    #[test]
    fn compiled_scss_maps_to_the_expanded_css() {
        let mut artifact = Artifact::from_bytes(
            Path::new("main.scss"),
            Path::new("main.scss"),
            b"$c: red;\n.a { color: $c; }\n".to_vec(),
        );
        SassStage::from_params(StageParameters::new())
            .unwrap()
            .run(&mut artifact, &ctx())
            .unwrap();
        let mut params = StageParameters::new();
        params.insert("source_map".into(), Value::Bool(true));
        MinifyCssStage::from_params(params)
            .unwrap()
            .run(&mut artifact, &ctx())
            .unwrap();

        let map: Value = serde_json::from_str(artifact.source_map.as_deref().unwrap()).unwrap();
        assert_eq!(map["sources"], serde_json::json!(["main.css"]));
    }
}
