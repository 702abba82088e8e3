//! A Markdown document as a page of cells.
//!
//! Fenced code blocks carry their attributes in the info string:
//!
//! ````text
//! ```python data-executable id=intro readonly
//! print("hi")
//! ```
//! ````
//!
//! The first bare token is the language. A fence whose language is
//! `thebe-config` (or `text/x-thebe-config`) holds page configuration, and a
//! fence matching the output selector right after a cell is its predefined
//! output.

use std::collections::HashMap;

use livecell::page::DEFAULT_LANGUAGE;
use livecell::{CellMarkup, EditorSurface, MemoryEditor, MemoryOutput, OutputSink, PageSurface};

const CONFIG_LANGUAGES: &[&str] = &["thebe-config", "text/x-thebe-config"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct FenceInfo {
    language: Option<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl FenceInfo {
    fn parse(info: &str) -> Self {
        let mut parsed = FenceInfo::default();
        for (index, token) in info.split_whitespace().enumerate() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value.trim_matches('"').to_string())),
                None => (token, None),
            };
            if index == 0 && value.is_none() && !key.starts_with("data-") {
                parsed.language = Some(key.to_string());
            } else {
                parsed.attrs.push((key.to_string(), value));
            }
        }
        parsed
    }

    fn has(&self, key: &str) -> bool {
        self.attrs.iter().any(|(k, _)| k == key)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    fn render(&self) -> String {
        let mut tokens: Vec<String> = self.language.iter().cloned().collect();
        for (key, value) in &self.attrs {
            match value {
                Some(value) => tokens.push(format!("{key}={value}")),
                None => tokens.push(key.clone()),
            }
        }
        tokens.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Fence {
        marker: String,
        info: FenceInfo,
        body: String,
    },
}

/// The attribute a CSS-like selector looks for: `[data-executable]` and
/// `pre.live` become `data-executable` and `live`.
pub fn selector_token(selector: &str) -> &str {
    let selector = selector.trim();
    let token = match (selector.find('['), selector.rfind('.')) {
        (Some(start), _) => &selector[start + 1..],
        (None, Some(dot)) => &selector[dot + 1..],
        (None, None) => selector,
    };
    token.split(['=', ']']).next().unwrap_or(token).trim()
}

fn fence_marker(line: &str) -> Option<(String, &str)> {
    let trimmed = line.trim_start();
    let ch = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == ch).count();
    if len < 3 {
        return None;
    }
    Some((ch.to_string().repeat(len), trimmed[len..].trim()))
}

fn closes(line: &str, marker: &str) -> bool {
    let trimmed = line.trim();
    let ch = marker.chars().next();
    trimmed.len() >= marker.len() && trimmed.chars().all(|c| Some(c) == ch)
}

/// A parsed Markdown document plus the surfaces mounted on it.
#[derive(Default)]
pub struct MarkdownPage {
    segments: Vec<Segment>,
    editors: HashMap<String, MemoryEditor>,
    outputs: HashMap<String, MemoryOutput>,
}

impl MarkdownPage {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut prose = String::new();
        let mut lines = text.split_inclusive('\n');

        while let Some(line) = lines.next() {
            let Some((marker, info)) = fence_marker(line) else {
                prose.push_str(line);
                continue;
            };
            if !prose.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut prose)));
            }
            let info = FenceInfo::parse(info);
            let mut body = String::new();
            for line in lines.by_ref() {
                if closes(line, &marker) {
                    break;
                }
                body.push_str(line);
            }
            segments.push(Segment::Fence { marker, info, body });
        }
        if !prose.is_empty() {
            segments.push(Segment::Text(prose));
        }

        Self {
            segments,
            ..Default::default()
        }
    }

    /// The document, with any prompt splitting applied.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Fence { marker, info, body } => {
                    out.push_str(marker);
                    out.push_str(&info.render());
                    out.push('\n');
                    out.push_str(body);
                    if !body.is_empty() && !body.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push_str(marker);
                    out.push('\n');
                }
            }
        }
        out
    }

    pub fn editor(&self, id: &str) -> Option<&MemoryEditor> {
        self.editors.get(id)
    }

    pub fn output(&self, id: &str) -> Option<&MemoryOutput> {
        self.outputs.get(id)
    }

    /// Indices into `segments` of every fence carrying `token`.
    fn matching(&self, token: &str) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| matches!(segment, Segment::Fence { info, .. } if info.has(token)))
            .map(|(index, _)| index)
            .collect()
    }

    /// The output fence following segment `index`, skipping blank prose.
    fn output_after(&self, index: usize, token: &str) -> Option<String> {
        for segment in &self.segments[index + 1..] {
            match segment {
                Segment::Text(text) if text.trim().is_empty() => continue,
                Segment::Fence { info, body, .. } if info.has(token) => return Some(body.clone()),
                _ => return None,
            }
        }
        None
    }
}

fn source_of(body: &str) -> String {
    body.strip_suffix('\n').unwrap_or(body).to_string()
}

impl PageSurface for MarkdownPage {
    fn config_blocks(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Fence { info, body, .. }
                    if info
                        .language
                        .as_deref()
                        .is_some_and(|lang| CONFIG_LANGUAGES.contains(&lang)) =>
                {
                    Some(body.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn block_sources(&self, selector: &str) -> Vec<String> {
        self.matching(selector_token(selector))
            .into_iter()
            .filter_map(|index| match &self.segments[index] {
                Segment::Fence { body, .. } => Some(source_of(body)),
                Segment::Text(_) => None,
            })
            .collect()
    }

    fn replace_block(&mut self, selector: &str, index: usize, sources: Vec<String>) {
        let Some(&position) = self.matching(selector_token(selector)).get(index) else {
            return;
        };
        let Segment::Fence { marker, info, .. } = self.segments[position].clone() else {
            return;
        };
        let mut info = info;
        info.attrs.retain(|(key, _)| key != "id");

        let mut replacement = Vec::new();
        for (n, source) in sources.into_iter().enumerate() {
            if n > 0 {
                replacement.push(Segment::Text("\n".to_string()));
            }
            let mut body = source;
            if !body.ends_with('\n') {
                body.push('\n');
            }
            replacement.push(Segment::Fence {
                marker: marker.clone(),
                info: info.clone(),
                body,
            });
        }
        self.segments.splice(position..=position, replacement);
    }

    fn cells(&self, selector: &str, output_selector: &str) -> Vec<CellMarkup> {
        let output_token = selector_token(output_selector);
        self.matching(selector_token(selector))
            .into_iter()
            .enumerate()
            .filter_map(|(n, index)| {
                let Segment::Fence { info, body, .. } = &self.segments[index] else {
                    return None;
                };
                Some(CellMarkup {
                    id: info
                        .get("id")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("cell-{n}")),
                    source: source_of(body),
                    language: info
                        .get("data-language")
                        .or(info.language.as_deref())
                        .unwrap_or(DEFAULT_LANGUAGE)
                        .to_string(),
                    read_only: info.has("readonly") || info.has("data-readonly"),
                    predefined_output: self.output_after(index, output_token),
                })
            })
            .collect()
    }

    fn mount(&mut self, cell: &CellMarkup) -> (Box<dyn EditorSurface>, Box<dyn OutputSink>) {
        let mut editor = MemoryEditor::new(&cell.source);
        if cell.read_only {
            editor = editor.read_only();
        }
        let output = MemoryOutput::new();
        self.editors.insert(cell.id.clone(), editor.clone());
        self.outputs.insert(cell.id.clone(), output.clone());
        (Box::new(editor), Box::new(output))
    }
}
