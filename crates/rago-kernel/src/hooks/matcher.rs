//! Composable predicates deciding whether a hook sees a piece of data.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use super::HookData;
use crate::error::{KernelError, Result};

/// A predicate over [`HookData`].
#[derive(Debug, Clone)]
pub enum HookMatcher {
    ToolNames(HashSet<String>),
    AgentNames(HashSet<String>),
    SessionIds(HashSet<String>),
    /// Regex applied to a named field (see [`HookData::field`]).
    FieldRegex { field: String, pattern: Regex },
    OnError,
    OnSuccess,
    MetadataEquals { key: String, value: Value },
    Not(Box<HookMatcher>),
    All(Vec<HookMatcher>),
    Any(Vec<HookMatcher>),
}

impl HookMatcher {
    pub fn tools<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ToolNames(names.into_iter().map(Into::into).collect())
    }

    pub fn agents<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AgentNames(names.into_iter().map(Into::into).collect())
    }

    pub fn sessions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::SessionIds(ids.into_iter().map(Into::into).collect())
    }

    /// Compile a field regex matcher.
    pub fn field_regex(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| KernelError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::FieldRegex {
            field: field.into(),
            pattern: regex,
        })
    }

    pub fn metadata_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::MetadataEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(matcher: HookMatcher) -> Self {
        Self::Not(Box::new(matcher))
    }

    pub fn matches(&self, data: &HookData) -> bool {
        match self {
            Self::ToolNames(set) => data.tool_name.as_ref().is_some_and(|t| set.contains(t)),
            Self::AgentNames(set) => data.agent_name.as_ref().is_some_and(|a| set.contains(a)),
            Self::SessionIds(set) => data.session_id.as_ref().is_some_and(|s| set.contains(s)),
            Self::FieldRegex { field, pattern } => data
                .field(field)
                .is_some_and(|value| pattern.is_match(&value)),
            Self::OnError => data.error.is_some(),
            Self::OnSuccess => data.error.is_none(),
            Self::MetadataEquals { key, value } => data.metadata.get(key) == Some(value),
            Self::Not(inner) => !inner.matches(data),
            Self::All(all) => all.iter().all(|m| m.matches(data)),
            Self::Any(any) => any.iter().any(|m| m.matches(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> HookData {
        HookData::tool("rag_query", json!({"query": "rust"})).with_agent("researcher")
    }

    #[test]
    fn set_matchers() {
        assert!(HookMatcher::tools(["rag_query", "ingest"]).matches(&data()));
        assert!(!HookMatcher::tools(["ingest"]).matches(&data()));
        assert!(HookMatcher::agents(["researcher"]).matches(&data()));
        assert!(!HookMatcher::sessions(["s1"]).matches(&data()));
    }

    #[test]
    fn error_matchers() {
        let ok = data();
        let failed = data().with_error("boom");
        assert!(HookMatcher::OnSuccess.matches(&ok));
        assert!(!HookMatcher::OnError.matches(&ok));
        assert!(HookMatcher::OnError.matches(&failed));
    }

    #[test]
    fn regex_on_named_field() {
        let m = HookMatcher::field_regex("tool_name", "^rag_").unwrap();
        assert!(m.matches(&data()));
        assert!(HookMatcher::field_regex("x", "(").is_err());
    }

    #[test]
    fn combinators() {
        let mut d = data();
        d.metadata.insert("env".into(), json!("prod"));
        let m = HookMatcher::All(vec![
            HookMatcher::tools(["rag_query"]),
            HookMatcher::metadata_equals("env", "prod"),
            HookMatcher::not(HookMatcher::OnError),
        ]);
        assert!(m.matches(&d));

        let any = HookMatcher::Any(vec![HookMatcher::OnError, HookMatcher::agents(["x"])]);
        assert!(!any.matches(&d));
    }
}
