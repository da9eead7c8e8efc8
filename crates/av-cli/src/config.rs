use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use av_core::{ProviderModel, ProviderSettingsEntry, ProviderType};
use av_session::AutosaveConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite file holding agents and sessions (supports ~, $VAR)
    pub database_path: String,

    /// Agent selected when the chat starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent_id: Option<String>,

    /// Model selected when the chat starts, as `<provider>:<model>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model_key: Option<String>,

    pub providers: Vec<ProviderSettingsEntry>,

    pub session: AutosaveConfig,

    pub tools: ToolsSettings,
}

/// Built-in tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSettings {
    /// Root directory for the note tools (supports $PWD, $HOME, ~)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes_root: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "~/.config/agent-vault/vault.db".to_string(),
            default_agent_id: None,
            default_model_key: None,
            providers: vec![default_openai_provider()],
            session: AutosaveConfig::default(),
            tools: ToolsSettings::default(),
        }
    }
}

fn default_openai_provider() -> ProviderSettingsEntry {
    ProviderSettingsEntry {
        id: "openai-default".to_string(),
        name: "OpenAI".to_string(),
        provider_type: ProviderType::OpenAI,
        api_key: None,
        api_key_env: Some("OPENAI_API_KEY".to_string()),
        base_url: None,
        enabled: false,
        models: vec![
            ProviderModel::new("GPT-5", "gpt-5"),
            ProviderModel::new("GPT-5 mini", "gpt-5-mini"),
        ],
    }
}

/// Expand environment variables in a path string
/// Supports: $VAR, ${VAR}, ~
pub fn expand_path(path: &str) -> PathBuf {
    let mut result = path.to_string();

    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    } else if result == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    let re = match regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") {
        Ok(re) => re,
        Err(_) => return PathBuf::from(result),
    };
    let expanded = re.replace_all(&result, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    });

    PathBuf::from(expanded.to_string())
}

impl Settings {
    /// Defaults, then the config file, then `AV_*` environment variables
    /// (`AV_SESSION__AUTOSAVE_INTERVAL_MS=1000`).
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Self::figment(path)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AV_").split("__"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("agent-vault"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database_path)
    }

    /// Root for the note tools: the configured root, else the working directory.
    pub fn notes_root(&self) -> PathBuf {
        self.tools
            .notes_root
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
