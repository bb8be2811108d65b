//! HTML and SVG minification.
//!
//! A small tokenizer splits markup into tags, text, comments and raw-text
//! element bodies. Raw-text bodies (`pre`, `textarea`, `script`, `style`)
//! are copied untouched; everything else has whitespace collapsed.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{reject_unknown, take_bool};
use crate::pipeline::{Artifact, PipelineContext, Stage, StageParameters};

pub struct MinifyHtmlStage {
    options: MarkupOptions,
}

impl MinifyHtmlStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let options = MarkupOptions {
            remove_comments: take_bool(&mut params, "remove_comments").unwrap_or(true),
            collapse_whitespace: take_bool(&mut params, "collapse_whitespace").unwrap_or(true),
        };
        reject_unknown("minify_html", &params)?;
        Ok(Self { options })
    }
}

impl Stage for MinifyHtmlStage {
    fn name(&self) -> &'static str {
        "minify_html"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let minified = minify_markup(artifact.text()?, self.options);
        artifact.replace_data(minified.into_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MarkupOptions {
    pub remove_comments: bool,
    pub collapse_whitespace: bool,
}

const RAW_TEXT_ELEMENTS: &[&str] = &["pre", "textarea", "script", "style"];

const BLOCK_ELEMENTS: &[&str] = &[
    "!doctype", "html", "head", "body", "title", "meta", "link", "base", "div", "p", "ul",
    "ol", "li", "dl", "dt", "dd", "h1", "h2", "h3", "h4", "h5", "h6", "header", "footer",
    "nav", "main", "section", "article", "aside", "figure", "figcaption", "table", "thead",
    "tbody", "tfoot", "tr", "td", "th", "form", "fieldset", "hr", "br", "blockquote",
    "script", "style", "noscript", "template", "svg", "g", "defs", "path", "option",
    "select",
];

#[derive(Debug)]
enum Token<'a> {
    Tag { raw: &'a str, name: String },
    Text(&'a str),
    Raw(&'a str),
    Comment(&'a str),
}

impl Token<'_> {
    fn is_block_tag(&self) -> bool {
        matches!(self, Token::Tag { name, .. } if BLOCK_ELEMENTS.contains(&name.as_str()))
    }
}

pub fn minify_markup(input: &str, options: MarkupOptions) -> String {
    let tokens = tokenize(input);
    let mut output = String::with_capacity(input.len());
    let mut after_dropped_comment = false;
    for (idx, token) in tokens.iter().enumerate() {
        if let Token::Comment(raw) = token {
            if !options.remove_comments || is_conditional_comment(raw) {
                output.push_str(raw);
                after_dropped_comment = false;
            } else {
                after_dropped_comment = true;
            }
            continue;
        }
        let joins_previous_text = std::mem::take(&mut after_dropped_comment);
        match token {
            Token::Comment(_) => {}
            Token::Tag { raw, .. } => {
                if options.collapse_whitespace {
                    output.push_str(&collapse_tag_whitespace(raw));
                } else {
                    output.push_str(raw);
                }
            }
            Token::Raw(raw) => output.push_str(raw),
            Token::Text(text) => {
                if !options.collapse_whitespace {
                    output.push_str(text);
                    continue;
                }
                let mut collapsed = collapse_whitespace(text);
                let trim_start = idx == 0 || previous_significant(&tokens, idx).is_block_tag();
                let trim_end =
                    idx + 1 == tokens.len() || next_significant(&tokens, idx).is_block_tag();
                if trim_start {
                    collapsed = collapsed.trim_start().to_string();
                }
                if trim_end {
                    collapsed = collapsed.trim_end().to_string();
                }
                // text on both sides of a dropped comment collapses as one run
                if joins_previous_text && output.ends_with(' ') {
                    collapsed = collapsed.trim_start().to_string();
                }
                if collapsed.trim().is_empty() && (trim_start || trim_end) {
                    continue;
                }
                output.push_str(&collapsed);
            }
        }
    }
    output
}

fn previous_significant<'t, 'a>(tokens: &'t [Token<'a>], idx: usize) -> &'t Token<'a> {
    tokens[..idx]
        .iter()
        .rev()
        .find(|t| !matches!(t, Token::Comment(_)))
        .unwrap_or(&tokens[idx])
}

fn next_significant<'t, 'a>(tokens: &'t [Token<'a>], idx: usize) -> &'t Token<'a> {
    tokens[idx + 1..]
        .iter()
        .find(|t| !matches!(t, Token::Comment(_)))
        .unwrap_or(&tokens[idx])
}

fn tokenize(input: &str) -> Vec<Token<'_>> {
    let lower = input.to_ascii_lowercase();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];
        if rest.starts_with("<!--") {
            let end = rest
                .find("-->")
                .map(|offset| pos + offset + 3)
                .unwrap_or(input.len());
            tokens.push(Token::Comment(&input[pos..end]));
            pos = end;
        } else if rest.starts_with('<') && rest.len() > 1 && is_tag_start(&rest[1..]) {
            let end = find_tag_end(input, pos);
            let raw = &input[pos..end];
            let name = tag_name(raw);
            let closing = raw.starts_with("</");
            let self_closing = raw.ends_with("/>");
            tokens.push(Token::Tag {
                raw,
                name: name.clone(),
            });
            pos = end;
            if !closing && !self_closing && RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
                let needle = format!("</{name}");
                let body_end = lower[pos..]
                    .find(&needle)
                    .map(|offset| pos + offset)
                    .unwrap_or(input.len());
                if body_end > pos {
                    tokens.push(Token::Raw(&input[pos..body_end]));
                }
                pos = body_end;
            }
        } else {
            let skip = rest.chars().next().map(char::len_utf8).unwrap_or(1);
            let end = rest[skip..]
                .find('<')
                .map(|offset| pos + skip + offset)
                .unwrap_or(input.len());
            tokens.push(Token::Text(&input[pos..end]));
            pos = end;
        }
    }

    tokens
}

fn is_tag_start(after_lt: &str) -> bool {
    after_lt
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '/' || c == '!' || c == '?')
        .unwrap_or(false)
}

fn find_tag_end(input: &str, start: usize) -> usize {
    let mut quote: Option<char> = None;
    for (offset, c) in input[start..].char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '>' => return start + offset + 1,
            None => {}
        }
    }
    input.len()
}

fn tag_name(raw: &str) -> String {
    raw.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '!' || *c == ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn is_conditional_comment(raw: &str) -> bool {
    raw.starts_with("<!--[if") || raw.starts_with("<!--<![endif]") || raw.contains("<![endif]")
}

fn collapse_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                result.push(' ');
                in_space = true;
            }
        } else {
            result.push(c);
            in_space = false;
        }
    }
    result
}

/// Collapses whitespace between attributes while leaving quoted values alone.
fn collapse_tag_whitespace(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut quote: Option<char> = None;
    let mut in_space = false;
    for c in raw.chars() {
        match quote {
            Some(q) => {
                result.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => {
                if !in_space {
                    result.push(' ');
                    in_space = true;
                }
                continue;
            }
            None => {
                if in_space && (c == '>' || c == '/') && result.ends_with(' ') {
                    result.pop();
                }
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                result.push(c);
            }
        }
        in_space = false;
    }
    result
}

static XML_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\?xml.*?\?>").expect("valid regex"));
static METADATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<metadata\b.*?</metadata>").expect("valid regex"));
static SVG_ROOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<svg\b[^>]*>").expect("valid regex"));
static VIEW_BOX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\s+viewBox\s*=\s*["']([^"']*)["']"#).expect("valid regex"));

/// Strips the XML declaration, metadata, comments and insignificant
/// whitespace from an SVG document. With `remove_view_box`, a root `viewBox`
/// that merely restates `width`/`height` is dropped.
pub fn minify_svg(input: &str, remove_view_box: bool) -> String {
    let stripped = XML_DECLARATION.replace_all(input, "");
    let stripped = METADATA.replace_all(&stripped, "");
    let mut minified = minify_markup(
        stripped.trim(),
        MarkupOptions {
            remove_comments: true,
            collapse_whitespace: true,
        },
    );
    if remove_view_box && let Some(root) = SVG_ROOT.find(&minified) {
        let range = root.range();
        if let Some(cleaned) = drop_redundant_view_box(root.as_str()) {
            minified.replace_range(range, &cleaned);
        }
    }
    minified
}

fn drop_redundant_view_box(tag: &str) -> Option<String> {
    let captures = VIEW_BOX.captures(tag)?;
    let values: Vec<f64> = captures[1]
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    let [min_x, min_y, width, height] = values.as_slice() else {
        return None;
    };
    let declared_width = attribute_number(tag, "width")?;
    let declared_height = attribute_number(tag, "height")?;
    if *min_x == 0.0 && *min_y == 0.0 && *width == declared_width && *height == declared_height {
        let whole = captures.get(0)?;
        let mut cleaned = tag.to_string();
        cleaned.replace_range(whole.range(), "");
        Some(cleaned)
    } else {
        None
    }
}

fn attribute_number(tag: &str, name: &str) -> Option<f64> {
    let pattern = Regex::new(&format!(r#"\s{name}\s*=\s*["']([0-9.]+)(?:px)?["']"#)).ok()?;
    pattern.captures(tag)?[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: MarkupOptions = MarkupOptions {
        remove_comments: true,
        collapse_whitespace: true,
    };

    #[test]
    fn removes_comments_and_collapses_block_whitespace() {
        let html = "<!DOCTYPE html>\n<html>\n  <head>\n    <title> Demo </title>\n  </head>\n  <body>\n    <!-- note -->\n    <p>\n      Hello   <b>big</b>   world\n    </p>\n  </body>\n</html>\n";
        let minified = minify_markup(html, OPTIONS);
        assert_eq!(
            minified,
            "<!DOCTYPE html><html><head><title>Demo</title></head><body><p>Hello <b>big</b> world</p></body></html>"
        );
    }

    #[test]
    fn dropped_comments_do_not_double_spaces() {
        assert_eq!(minify_markup("<p>a <!-- c --> b</p>", OPTIONS), "<p>a b</p>");
        assert_eq!(
            minify_markup("<p>a <!-- c --> <!-- d --> b</p>", OPTIONS),
            "<p>a b</p>"
        );
        assert_eq!(minify_markup("<p>a<!-- c -->b</p>", OPTIONS), "<p>ab</p>");
    }

    #[test]
    fn raw_text_elements_are_preserved() {
        let html = "<div>\n<pre>  keep\n   this  </pre>\n<script>\n if (a < b) { run(); }\n</script>\n</div>";
        let minified = minify_markup(html, OPTIONS);
        assert!(minified.contains("<pre>  keep\n   this  </pre>"));
        assert!(minified.contains("<script>\n if (a < b) { run(); }\n</script>"));
    }

    #[test]
    fn conditional_comments_survive() {
        let html = "<head><!--[if IE]><link rel=\"stylesheet\" href=\"ie.css\"><![endif]--></head>";
        assert_eq!(minify_markup(html, OPTIONS), html);
    }

    #[test]
    fn attribute_values_keep_their_spaces() {
        let html = "<a   href=\"#\"   title=\"two  words\"  >x</a>";
        assert_eq!(
            minify_markup(html, OPTIONS),
            "<a href=\"#\" title=\"two  words\">x</a>"
        );
    }

    #[test]
    fn disabled_options_leave_markup_alone() {
        let html = "<p>  a  </p><!-- c -->";
        let untouched = minify_markup(
            html,
            MarkupOptions {
                remove_comments: false,
                collapse_whitespace: false,
            },
        );
        assert_eq!(untouched, html);
    }

    #[test]
    fn svg_drops_declaration_and_redundant_view_box() {
        let svg = "<?xml version=\"1.0\"?>\n<!-- icon -->\n<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"24\" height=\"24\" viewBox=\"0 0 24 24\">\n  <metadata>generator</metadata>\n  <path d=\"M0 0h24v24H0z\"/>\n</svg>\n";
        let minified = minify_svg(svg, true);
        assert_eq!(
            minified,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"24\" height=\"24\"><path d=\"M0 0h24v24H0z\"/></svg>"
        );
    }

    #[test]
    fn svg_keeps_meaningful_view_box() {
        let svg = "<svg width=\"48\" height=\"48\" viewBox=\"0 0 24 24\"><g/></svg>";
        assert!(minify_svg(svg, true).contains("viewBox=\"0 0 24 24\""));
    }
}
