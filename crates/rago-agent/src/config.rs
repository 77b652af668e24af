//! On-disk configuration.
//!
//! Resolution order: an explicit path, `./rago.toml`, `~/.rago/rago.toml`,
//! then built-in defaults. Environment variables override file values:
//! `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `RAGO_DATA_DIR`.

use std::path::{Path, PathBuf};

use rago_provider::{Budget, BudgetPeriod};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::llm::OpenAiConfig;
use crate::tools::mcp::McpServerConfig;

pub const CONFIG_FILE_NAME: &str = "rago.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagoConfig {
    pub data_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub intents_dir: PathBuf,
    pub providers: ProvidersConfig,
    pub sqvect: SqvectConfig,
    pub mcp: McpConfig,
    pub agent: AgentConfig,
    pub router: SemanticRouterConfig,
    pub budgets: Vec<BudgetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub default_llm: String,
    pub default_embedder: String,
    pub openai: OpenAiConfig,
}

/// Vector store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqvectConfig {
    pub db_path: PathBuf,
    pub top_k: usize,
    /// Max characters per chunk.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub instructions: String,
    pub max_rounds: u32,
    /// Ask the LLM whether the final answer met the goal.
    pub verify: bool,
    pub stream: bool,
    /// Compact history into a summary past this many messages.
    pub compact_after: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticRouterConfig {
    pub threshold: f32,
    /// Minimum router score the planner trusts without asking the LLM.
    pub planner_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    pub limit: f64,
    #[serde(default = "default_alert_percent")]
    pub alert_percent: f64,
    #[serde(default = "default_period")]
    pub period: BudgetPeriod,
}

fn default_alert_percent() -> f64 {
    80.0
}

fn default_period() -> BudgetPeriod {
    BudgetPeriod::Daily
}

impl BudgetConfig {
    pub fn to_budget(&self) -> Budget {
        let budget = Budget::new(&self.name, self.period, self.limit).alert_percent(self.alert_percent);
        match &self.provider {
            Some(p) => budget.for_provider(p),
            None => budget,
        }
    }
}

fn rago_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".rago")
}

impl Default for RagoConfig {
    fn default() -> Self {
        let home = rago_home();
        Self {
            data_dir: home.join("data"),
            skills_dir: home.join("skills"),
            intents_dir: home.join("intents"),
            providers: ProvidersConfig::default(),
            sqvect: SqvectConfig::default(),
            mcp: McpConfig::default(),
            agent: AgentConfig::default(),
            router: SemanticRouterConfig::default(),
            budgets: Vec::new(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_llm: "openai".into(),
            default_embedder: "openai".into(),
            openai: OpenAiConfig::default(),
        }
    }
}

impl Default for SqvectConfig {
    fn default() -> Self {
        Self {
            db_path: rago_home().join("data").join("rag.db"),
            top_k: 5,
            chunk_size: 1000,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "assistant".into(),
            instructions: "You are a helpful assistant. Use the available tools when they help \
                           answer the user's request, then reply concisely."
                .into(),
            max_rounds: 15,
            verify: false,
            stream: true,
            compact_after: 50,
        }
    }
}

impl Default for SemanticRouterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.82,
            planner_threshold: 0.75,
        }
    }
}

impl RagoConfig {
    /// Load, apply environment overrides, expand `~` and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::locate(explicit)? {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    AgentError::config(format!("failed to read {}: {e}", path.display()))
                })?;
                let config = Self::from_toml_str(&text)?;
                info!(path = %path.display(), "configuration loaded");
                config
            }
            None => {
                debug!("no configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AgentError::config(format!("invalid TOML: {e}")))
    }

    fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            let path = expand_tilde(path);
            if !path.is_file() {
                return Err(AgentError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }
        let candidates = [PathBuf::from(CONFIG_FILE_NAME), rago_home().join(CONFIG_FILE_NAME)];
        Ok(candidates.into_iter().find(|p| p.is_file()))
    }

    /// Override file values from `lookup` (the process environment in
    /// [`load`](Self::load)).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = set("OPENAI_API_KEY") {
            self.providers.openai.api_key = key;
        }
        if let Some(url) = set("OPENAI_BASE_URL") {
            self.providers.openai.base_url = url;
        }
        if let Some(dir) = set("RAGO_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn expand_paths(&mut self) {
        for path in [
            &mut self.data_dir,
            &mut self.skills_dir,
            &mut self.intents_dir,
            &mut self.sqvect.db_path,
        ] {
            *path = expand_tilde(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.name.trim().is_empty() {
            return Err(AgentError::config("agent.name must not be empty"));
        }
        if self.agent.max_rounds == 0 {
            return Err(AgentError::config("agent.max_rounds must be at least 1"));
        }
        for (key, value) in [
            ("router.threshold", self.router.threshold),
            ("router.planner_threshold", self.router.planner_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentError::config(format!("{key} must be within 0..=1, got {value}")));
            }
        }
        if self.sqvect.top_k == 0 || self.sqvect.chunk_size == 0 {
            return Err(AgentError::config("sqvect.top_k and sqvect.chunk_size must be positive"));
        }
        url::Url::parse(&self.providers.openai.base_url).map_err(|e| {
            AgentError::config(format!(
                "providers.openai.base_url `{}` is not a URL: {e}",
                self.providers.openai.base_url
            ))
        })?;
        for server in &self.mcp.servers {
            if server.name.is_empty() || server.command.is_empty() {
                return Err(AgentError::config("mcp servers need both `name` and `command`"));
            }
        }
        for budget in &self.budgets {
            if budget.limit <= 0.0 {
                return Err(AgentError::config(format!(
                    "budget `{}` must have a positive limit",
                    budget.name
                )));
            }
        }
        Ok(())
    }

    pub fn memory_db_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}
