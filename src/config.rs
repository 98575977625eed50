use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::is_known_provider;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            timeout_secs: default_model_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "nebius".into()
}

fn default_model() -> String {
    "Qwen/Qwen2.5-72B-Instruct".into()
}

fn default_model_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    10
}

/// How a remote tool server is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    /// One endpoint answering each POST with JSON or an event stream.
    #[default]
    Http,
    /// A GET event stream plus POSTs to the endpoint it announces.
    Sse,
}

/// One remote tool server reachable over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub transport: ServerTransport,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

fn default_server_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: RunConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)
            .map_err(|err| AgentError::Config(format!("Failed to parse configuration: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load `path`, then apply `TOOLLOOP_*` overrides. Credentials are only
    /// ever taken from the file.
    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        if let Ok(provider) = env::var("TOOLLOOP_PROVIDER") {
            cfg.model.provider = provider;
        }
        if let Ok(model) = env::var("TOOLLOOP_MODEL") {
            cfg.model.model = model;
        }
        if let Ok(base_url) = env::var("TOOLLOOP_BASE_URL") {
            cfg.model.base_url = Some(base_url);
        }
        if let Ok(turns) = env::var("TOOLLOOP_MAX_TURNS") {
            if let Ok(parsed) = turns.parse::<usize>() {
                cfg.agent.max_turns = parsed;
            }
        }
        if let Ok(filter) = env::var("TOOLLOOP_LOG") {
            cfg.logging.filter = filter;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_turns == 0 {
            return Err(AgentError::Config("agent.max_turns must be at least 1".into()));
        }
        if self.model.base_url.is_none() && !is_known_provider(&self.model.provider) {
            return Err(AgentError::Config(format!(
                "unknown provider `{}`; set model.base_url to use a custom endpoint",
                self.model.provider
            )));
        }
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(AgentError::Config("server name must not be empty".into()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(AgentError::Config(format!(
                    "duplicate server name `{}`",
                    server.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.model.provider, "nebius");
        assert_eq!(cfg.model.model, "Qwen/Qwen2.5-72B-Instruct");
        assert_eq!(cfg.agent.max_turns, 10);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn loads_servers_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[model]\nprovider='together'\napi_key='secret'\n\n[agent]\nmax_turns=4\n\n[[servers]]\nname='sentiment'\nurl='http://localhost:7860/mcp'\nprefix='sa'\n[servers.headers]\nAuthorization='Bearer x'"
        )
        .unwrap();

        env::set_var("TOOLLOOP_MAX_TURNS", "7");
        let cfg = AgentConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("TOOLLOOP_MAX_TURNS");

        assert_eq!(cfg.model.provider, "together");
        assert_eq!(cfg.model.api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.agent.max_turns, 7);
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].prefix.as_deref(), Some("sa"));
        assert_eq!(cfg.servers[0].timeout_secs, 60);
        assert_eq!(cfg.servers[0].transport, ServerTransport::Http);
        assert_eq!(
            cfg.servers[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer x")
        );
    }

    #[test]
    fn rejects_unknown_provider_without_base_url() {
        let err = AgentConfig::from_toml_str("[model]\nprovider='acme'").unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));

        let cfg =
            AgentConfig::from_toml_str("[model]\nprovider='acme'\nbase_url='http://127.0.0.1:9/v1'")
                .unwrap();
        assert_eq!(cfg.model.provider, "acme");
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let raw = "[[servers]]\nname='a'\nurl='http://x'\n[[servers]]\nname='a'\nurl='http://y'";
        assert!(AgentConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn rejects_zero_turns() {
        assert!(AgentConfig::from_toml_str("[agent]\nmax_turns=0").is_err());
    }
}
