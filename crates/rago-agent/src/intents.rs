//! Intent definitions and the markdown files they are loaded from.
//!
//! ```text
//! ---
//! name: memory_recall
//! description: The user asks what the assistant remembers.
//! utterances:
//!   - what do you remember
//!   - recall
//! tool_mapping: memory_search
//! metadata:
//!   category: memory
//! ---
//!
//! Free-form notes.
//! ```
//!
//! Front matter is read with a small YAML subset parser (scalars, nested
//! maps, block and flow lists).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub utterances: Vec<String>,
    /// Tool or tool table this intent maps to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_mapping: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Intent {
    pub fn new<I, S>(name: impl Into<String>, utterances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            description: String::new(),
            utterances: utterances.into_iter().map(Into::into).collect(),
            tool_mapping: None,
            metadata: Map::new(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_mapping = Some(Value::String(tool.into()));
        self
    }

    /// The mapped tool when the mapping is a single name.
    pub fn tool(&self) -> Option<&str> {
        self.tool_mapping.as_ref().and_then(Value::as_str)
    }
}

/// Parse one intent file. `Ok(None)` when the front matter fences are
/// missing.
pub fn parse_intent_md(content: &str) -> Result<Option<Intent>> {
    let Some((yaml, _body)) = split_frontmatter(content) else {
        return Ok(None);
    };
    let json = yaml_to_json(yaml);
    let intent: Intent = serde_json::from_value(json)
        .map_err(|e| AgentError::input(format!("invalid intent front matter: {e}")))?;
    if intent.name.trim().is_empty() {
        return Err(AgentError::input("intent name must not be empty"));
    }
    if intent.utterances.is_empty() {
        return Err(AgentError::input(format!("intent `{}` has no utterances", intent.name)));
    }
    Ok(Some(intent))
}

/// Every `*.md` intent in `dir`, sorted by file name. Files without front
/// matter or with invalid front matter are skipped with a warning.
pub async fn load_intents_dir(dir: &Path) -> Result<Vec<Intent>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "intent directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "md") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut intents = Vec::with_capacity(paths.len());
    for path in paths {
        let text = tokio::fs::read_to_string(&path).await?;
        match parse_intent_md(&text) {
            Ok(Some(intent)) => intents.push(intent),
            Ok(None) => warn!(path = %path.display(), "intent file has no front matter, skipping"),
            Err(e) => warn!(path = %path.display(), error = %e, "invalid intent file, skipping"),
        }
    }
    Ok(intents)
}

// ---------------------------------------------------------------------------
// Front matter
// ---------------------------------------------------------------------------

/// `(yaml, body)` when the text opens and closes a `---` block.
pub(crate) fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let content = content.trim_start();
    let after_first = content.strip_prefix("---")?;
    let end = after_first.find("\n---")?;
    let yaml = after_first[..end].trim_matches(['\n', '\r']);
    let body = after_first[end + 4..].trim_start_matches(['-', '\n', '\r']);
    Some((yaml, body))
}

pub(crate) fn yaml_to_json(yaml: &str) -> Value {
    let lines: Vec<&str> = yaml.lines().collect();
    let mut root = Map::new();
    parse_block(&lines, &mut root, 0);
    Value::Object(root)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn parse_block(lines: &[&str], map: &mut Map<String, Value>, base_indent: usize) {
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }
        let indent = indent_of(line);
        if indent < base_indent {
            break;
        }
        let Some(colon) = trimmed.find(':') else {
            i += 1;
            continue;
        };
        let key = trimmed[..colon].trim().trim_matches(['"', '\'']).to_owned();
        let value = trimmed[colon + 1..].trim();
        i += 1;

        if !value.is_empty() {
            map.insert(key, parse_scalar(value));
            continue;
        }

        let end = block_end(lines, i, indent + 1);
        let child = &lines[i..end];
        let first = child.iter().find(|l| !l.trim().is_empty());
        let parsed = match first {
            None => Value::Null,
            Some(l) if l.trim_start().starts_with('-') => Value::Array(
                child
                    .iter()
                    .filter_map(|l| l.trim().strip_prefix('-'))
                    .map(|item| parse_scalar(item.trim()))
                    .collect(),
            ),
            Some(l) => {
                let mut nested = Map::new();
                parse_block(child, &mut nested, indent_of(l));
                Value::Object(nested)
            }
        };
        map.insert(key, parsed);
        i = end;
    }
}

/// First line at or after `start` indented less than `min_indent`.
fn block_end(lines: &[&str], start: usize, min_indent: usize) -> usize {
    let mut end = start;
    while end < lines.len() {
        let line = lines[end];
        if !line.trim().is_empty() && indent_of(line) < min_indent {
            break;
        }
        end += 1;
    }
    end
}

fn parse_scalar(s: &str) -> Value {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return Value::String(s[1..s.len() - 1].to_owned());
    }
    if s.starts_with('[') && s.ends_with(']') {
        if let Ok(v) = serde_json::from_str::<Value>(s) {
            return v;
        }
        let inner = s[1..s.len() - 1].trim();
        if inner.is_empty() {
            return Value::Array(Vec::new());
        }
        return Value::Array(inner.split(',').map(parse_scalar).collect());
    }
    if s.starts_with('{')
        && s.ends_with('}')
        && let Ok(v) = serde_json::from_str::<Value>(s)
    {
        return v;
    }
    match s {
        "true" | "yes" | "on" => return Value::Bool(true),
        "false" | "no" | "off" => return Value::Bool(false),
        "null" | "~" | "" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(n) = s.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(n)
    {
        return Value::Number(n);
    }
    Value::String(s.to_owned())
}
