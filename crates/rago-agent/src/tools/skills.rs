//! Packaged skills.
//!
//! The dispatcher exposes each listed skill to the LLM as a `skill_<id>`
//! tool. [`PromptSkills`] is the bundled service: prompt templates loaded
//! from a skills directory, either `<dir>/<skill>/SKILL.md` or `<dir>/*.md`:
//!
//! ```text
//! ---
//! name: Weekly report
//! id: weekly-report
//! description: Summarize a team's week.
//! variables: [team]
//! tags: [reporting]
//! ---
//!
//! Write a short weekly report for {{team}}.
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rago_kernel::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::intents::{split_frontmatter, yaml_to_json};
use crate::llm::{GenerateOptions, LlmProvider};

pub const SKILL_TOOL_PREFIX: &str = "skill_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Variable names the skill accepts.
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SkillInfo {
    pub fn tool_name(&self) -> String {
        format!("{SKILL_TOOL_PREFIX}{}", self.id)
    }

    pub fn tool_definition(&self) -> ToolDefinition {
        let properties: serde_json::Map<String, Value> = self
            .variables
            .iter()
            .map(|v| (v.clone(), json!({"type": "string"})))
            .collect();
        ToolDefinition::new(
            self.tool_name(),
            if self.description.is_empty() {
                format!("Run the {} skill.", self.name)
            } else {
                self.description.clone()
            },
            json!({"type": "object", "properties": properties}),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillRequest {
    pub id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub interactive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait SkillsService: Send + Sync {
    /// Skills whose id, name or tags contain `filter` (all when `None`).
    async fn list_skills(&self, filter: Option<&str>) -> Result<Vec<SkillInfo>>;

    async fn execute(&self, request: SkillRequest) -> Result<SkillResult>;
}

/// Whether `skill` is permitted by an allowlist where `"*"` means all.
pub fn skill_allowed(skill: &SkillInfo, allow: &[String]) -> bool {
    allow.iter().any(|a| a == "*" || a == &skill.id || a == &skill.name)
}

/// Case-insensitive match used by [`SkillsService::list_skills`] impls.
pub fn matches_filter(skill: &SkillInfo, filter: Option<&str>) -> bool {
    let Some(filter) = filter.map(str::to_lowercase) else {
        return true;
    };
    skill.id.to_lowercase().contains(&filter)
        || skill.name.to_lowercase().contains(&filter)
        || skill.tags.iter().any(|t| t.to_lowercase().contains(&filter))
}

// ---------------------------------------------------------------------------
// Prompt-template skills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSkill {
    pub info: SkillInfo,
    pub template: String,
}

#[derive(Deserialize)]
struct SkillFrontMatter {
    name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    variables: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Lowercase, with runs of anything but letters and digits collapsed to `-`.
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_owned()
}

/// Parse one skill file. `Ok(None)` when the front matter fences are missing.
pub fn parse_skill_md(content: &str) -> Result<Option<PromptSkill>> {
    let Some((yaml, body)) = split_frontmatter(content) else {
        return Ok(None);
    };
    let front: SkillFrontMatter = serde_json::from_value(yaml_to_json(yaml))
        .map_err(|e| AgentError::input(format!("invalid skill front matter: {e}")))?;
    let id = front.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(|| slug(&front.name));
    if id.is_empty() {
        return Err(AgentError::input("skill name must not be empty"));
    }
    let template = body.trim().to_owned();
    if template.is_empty() {
        return Err(AgentError::input(format!("skill `{id}` has an empty prompt")));
    }
    Ok(Some(PromptSkill {
        info: SkillInfo {
            id,
            name: front.name,
            description: front.description,
            variables: front.variables,
            tags: front.tags,
        },
        template,
    }))
}

/// Fill `{{name}}` placeholders. Returns the declared variables that were
/// not supplied.
fn render(template: &str, declared: &[String], vars: &BTreeMap<String, String>) -> (String, Vec<String>) {
    let mut out = template.to_owned();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    let missing = declared.iter().filter(|v| !vars.contains_key(*v)).cloned().collect();
    (out, missing)
}

/// Skills rendered into a prompt and answered by the LLM.
pub struct PromptSkills {
    skills: Vec<PromptSkill>,
    llm: Arc<dyn LlmProvider>,
}

impl PromptSkills {
    pub fn new(skills: Vec<PromptSkill>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { skills, llm }
    }

    /// Load every skill under `dir`, sorted by path. Invalid files are
    /// skipped with a warning; a missing directory yields no skills.
    pub async fn load_dir(dir: &Path, llm: Arc<dyn LlmProvider>) -> Result<Self> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "skills directory does not exist");
                return Ok(Self::new(Vec::new(), llm));
            }
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                let nested = path.join("SKILL.md");
                if tokio::fs::try_exists(&nested).await? {
                    paths.push(nested);
                }
            } else if path.extension().is_some_and(|ext| ext == "md") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut skills: Vec<PromptSkill> = Vec::with_capacity(paths.len());
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await?;
            match parse_skill_md(&text) {
                Ok(Some(skill)) if skills.iter().any(|s| s.info.id == skill.info.id) => {
                    warn!(path = %path.display(), id = %skill.info.id, "duplicate skill id, skipping");
                }
                Ok(Some(skill)) => skills.push(skill),
                Ok(None) => warn!(path = %path.display(), "skill file has no front matter, skipping"),
                Err(e) => warn!(path = %path.display(), error = %e, "invalid skill file, skipping"),
            }
        }
        info!(count = skills.len(), dir = %dir.display(), "skills loaded");
        Ok(Self::new(skills, llm))
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

#[async_trait]
impl SkillsService for PromptSkills {
    async fn list_skills(&self, filter: Option<&str>) -> Result<Vec<SkillInfo>> {
        Ok(self
            .skills
            .iter()
            .filter(|s| matches_filter(&s.info, filter))
            .map(|s| s.info.clone())
            .collect())
    }

    async fn execute(&self, request: SkillRequest) -> Result<SkillResult> {
        let Some(skill) = self.skills.iter().find(|s| s.info.id == request.id) else {
            return Ok(SkillResult {
                success: false,
                output: String::new(),
                error: Some(format!("unknown skill `{}`", request.id)),
            });
        };
        let (prompt, missing) = render(&skill.template, &skill.info.variables, &request.variables);
        if !missing.is_empty() {
            return Ok(SkillResult {
                success: false,
                output: String::new(),
                error: Some(format!("missing variables: {}", missing.join(", "))),
            });
        }
        debug!(skill = %skill.info.id, "running skill");
        let output = self.llm.generate(&prompt, &GenerateOptions::default()).await?;
        Ok(SkillResult {
            success: true,
            output,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill() -> SkillInfo {
        SkillInfo {
            id: "weekly-report".into(),
            name: "Weekly report".into(),
            description: String::new(),
            variables: vec!["team".into()],
            tags: vec!["reporting".into()],
        }
    }

    #[test]
    fn tool_definition_exposes_variables() {
        let def = skill().tool_definition();
        assert_eq!(def.name, "skill_weekly-report");
        assert_eq!(def.parameters["properties"]["team"]["type"], "string");
        assert!(def.description.contains("Weekly report"));
    }

    #[test]
    fn allowlist_and_filter() {
        let s = skill();
        assert!(skill_allowed(&s, &["*".into()]));
        assert!(skill_allowed(&s, &["weekly-report".into()]));
        assert!(!skill_allowed(&s, &["other".into()]));
        assert!(matches_filter(&s, Some("REPORT")));
        assert!(matches_filter(&s, None));
        assert!(!matches_filter(&s, Some("deploy")));
    }

    struct Echo;

    #[async_trait]
    impl LlmProvider for Echo {
        async fn generate(&self, prompt: &str, _opts: &GenerateOptions) -> Result<String> {
            Ok(format!("echo: {prompt}"))
        }

        async fn generate_with_tools(
            &self,
            _messages: &[rago_kernel::Message],
            _tools: &[ToolDefinition],
            _opts: &GenerateOptions,
        ) -> Result<crate::llm::ToolResponse> {
            Ok(crate::llm::ToolResponse::text(""))
        }
    }

    const REPORT_MD: &str = "---\nname: Weekly report\ndescription: Summarize a week.\nvariables: [team]\ntags: [reporting]\n---\n\nReport for {{team}}.\n";

    #[test]
    fn parses_skill_files() {
        let skill = parse_skill_md(REPORT_MD).unwrap().unwrap();
        assert_eq!(skill.info.id, "weekly-report");
        assert_eq!(skill.info.variables, ["team"]);
        assert_eq!(skill.info.tags, ["reporting"]);
        assert_eq!(skill.template, "Report for {{team}}.");

        assert!(parse_skill_md("no front matter").unwrap().is_none());
        assert!(parse_skill_md("---\nname: Empty\n---\n").is_err());
        let explicit = parse_skill_md("---\nname: X\nid: custom\n---\nbody").unwrap().unwrap();
        assert_eq!(explicit.info.id, "custom");
    }

    #[tokio::test]
    async fn loads_directory_and_renders_prompts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), REPORT_MD).unwrap();
        std::fs::create_dir(dir.path().join("greet")).unwrap();
        std::fs::write(
            dir.path().join("greet/SKILL.md"),
            "---\nname: Greet\nvariables: [who]\n---\nSay hello to {{who}}.",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.md"), "just notes").unwrap();

        let skills = PromptSkills::load_dir(dir.path(), Arc::new(Echo)).await.unwrap();
        assert_eq!(skills.len(), 2);
        let ids: Vec<String> = skills.list_skills(None).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["greet", "weekly-report"]);
        assert_eq!(skills.list_skills(Some("report")).await.unwrap().len(), 1);

        let ok = skills
            .execute(SkillRequest {
                id: "greet".into(),
                variables: BTreeMap::from([("who".to_owned(), "Ada".to_owned())]),
                interactive: false,
            })
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.output, "echo: Say hello to Ada.");

        let missing = skills
            .execute(SkillRequest {
                id: "greet".into(),
                ..SkillRequest::default()
            })
            .await
            .unwrap();
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("who"));

        let unknown = skills
            .execute(SkillRequest {
                id: "nope".into(),
                ..SkillRequest::default()
            })
            .await
            .unwrap();
        assert!(!unknown.success);
    }

    #[tokio::test]
    async fn missing_directory_has_no_skills() {
        let dir = tempfile::tempdir().unwrap();
        let skills = PromptSkills::load_dir(&dir.path().join("absent"), Arc::new(Echo)).await.unwrap();
        assert!(skills.is_empty());
    }
}
