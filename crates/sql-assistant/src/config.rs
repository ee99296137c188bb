//! Environment configuration
//!
//! | Variable               | Default                                   |
//! |------------------------|-------------------------------------------|
//! | `POSTGRESQL_ADDON_URI` | required                                  |
//! | `LLM_API_KEY`          | required                                  |
//! | `LLM_API_MODEL`        | `gpt-4o-mini`                             |
//! | `LLM_API_URL`          | `https://api.openai.com/v1`               |
//! | `LLM_TEMPERATURE`      | `0.2`                                     |
//! | `LLM_TIMEOUT_SECS`     | `120`                                     |
//! | `LLM_TOOL_STYLE`       | `native` (`fenced` for models without function calling) |
//! | `MCP_SERVER_COMMAND`   | `npx`                                     |
//! | `MCP_SERVER_ARGS`      | `-y @modelcontextprotocol/server-postgres` |
//! | `MCP_CLIENT_NAME`      | `postgres-client`                         |
//! | `TOOL_TIMEOUT_SECS`    | `60`                                      |
//! | `AGENT_MAX_ITERATIONS` | `10`                                      |
//! | `SQL_DIALECT`          | `PostgreSQL`                              |
//! | `PORT`                 | `8080`                                    |
//! | `BIND_ADDR`            | `0.0.0.0:$PORT`                           |

use std::str::FromStr;
use std::time::Duration;

use agent_core::{AgentConfig, GenerationOptions, ToolCallStyle};
use agent_runtime::{McpClientConfig, OpenAiConfig, ProviderCommand};

use crate::error::ConfigError;
use crate::prompt::SystemPrompt;

const DEFAULT_MODEL: &str = agent_core::provider::DEFAULT_MODEL;
const DEFAULT_PORT: u16 = 8080;

/// Everything the assistant reads from the environment.
///
/// Required values are optional here so a half-configured process can still
/// start and report what is missing; [`AppConfig::validate`] enforces them.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_base_url: String,
    pub llm_temperature: f32,
    pub llm_timeout: Duration,
    pub tool_call_style: ToolCallStyle,
    pub provider_program: String,
    pub provider_args: Vec<String>,
    pub client_name: String,
    pub tool_timeout: Duration,
    pub max_iterations: usize,
    pub dialect: String,

    /// Only tools with these names are loaded from the provider
    pub tool_filter: Vec<String>,

    pub bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            llm_api_key: None,
            llm_model: DEFAULT_MODEL.into(),
            llm_base_url: agent_runtime::openai::DEFAULT_BASE_URL.into(),
            llm_temperature: 0.2,
            llm_timeout: Duration::from_secs(120),
            tool_call_style: ToolCallStyle::Native,
            provider_program: "npx".into(),
            provider_args: vec!["-y".into(), "@modelcontextprotocol/server-postgres".into()],
            client_name: "postgres-client".into(),
            tool_timeout: Duration::from_secs(60),
            max_iterations: 10,
            dialect: "PostgreSQL".into(),
            tool_filter: vec!["query".into()],
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
        }
    }
}

impl AppConfig {
    /// Read from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let port: u16 = parse_or(get("PORT"), "PORT", DEFAULT_PORT)?;

        let temperature: f32 = parse_or(get("LLM_TEMPERATURE"), "LLM_TEMPERATURE", defaults.llm_temperature)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid {
                key: "LLM_TEMPERATURE",
                reason: format!("{} is outside 0.0..=2.0", temperature),
            });
        }

        let max_iterations: usize = parse_or(get("AGENT_MAX_ITERATIONS"), "AGENT_MAX_ITERATIONS", defaults.max_iterations)?;
        if max_iterations == 0 {
            return Err(ConfigError::Invalid {
                key: "AGENT_MAX_ITERATIONS",
                reason: "must be at least 1".into(),
            });
        }

        let llm_timeout = parse_or(get("LLM_TIMEOUT_SECS"), "LLM_TIMEOUT_SECS", defaults.llm_timeout.as_secs())?;
        let tool_timeout = parse_or(get("TOOL_TIMEOUT_SECS"), "TOOL_TIMEOUT_SECS", defaults.tool_timeout.as_secs())?;
        let tool_call_style = parse_or(get("LLM_TOOL_STYLE"), "LLM_TOOL_STYLE", defaults.tool_call_style)?;

        Ok(Self {
            database_url: get("POSTGRESQL_ADDON_URI"),
            llm_api_key: get("LLM_API_KEY"),
            llm_model: get("LLM_API_MODEL").unwrap_or(defaults.llm_model),
            llm_base_url: get("LLM_API_URL").unwrap_or(defaults.llm_base_url),
            llm_temperature: temperature,
            llm_timeout: Duration::from_secs(llm_timeout),
            tool_call_style,
            provider_program: get("MCP_SERVER_COMMAND").unwrap_or(defaults.provider_program),
            provider_args: get("MCP_SERVER_ARGS")
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or(defaults.provider_args),
            client_name: get("MCP_CLIENT_NAME").unwrap_or(defaults.client_name),
            tool_timeout: Duration::from_secs(tool_timeout),
            max_iterations,
            dialect: get("SQL_DIALECT").unwrap_or(defaults.dialect),
            tool_filter: defaults.tool_filter,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| format!("0.0.0.0:{}", port)),
        })
    }

    /// Fail on the first missing required value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_none() {
            return Err(ConfigError::Missing("POSTGRESQL_ADDON_URI"));
        }
        if self.llm_api_key.is_none() {
            return Err(ConfigError::Missing("LLM_API_KEY"));
        }
        Ok(())
    }

    /// Database location safe to print
    pub fn redacted_database_url(&self) -> String {
        self.database_url
            .as_deref()
            .map_or_else(|| "<unset>".into(), redact_connection_string)
    }

    pub fn system_prompt(&self) -> SystemPrompt {
        SystemPrompt::new(&self.dialect)
    }

    pub fn provider_command(&self) -> ProviderCommand {
        ProviderCommand {
            program: self.provider_program.clone(),
            args: self.provider_args.clone(),
            connection_string: self.database_url.clone(),
        }
    }

    pub fn mcp_client_config(&self) -> McpClientConfig {
        McpClientConfig {
            client_name: self.client_name.clone(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            request_timeout: self.tool_timeout,
            ..Default::default()
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.llm_base_url.clone(),
            api_key: self.llm_api_key.clone().unwrap_or_default(),
            timeout_secs: self.llm_timeout.as_secs(),
        }
    }

    pub fn agent_config(&self, prompt: &SystemPrompt) -> AgentConfig {
        AgentConfig {
            system_prompt: prompt.render(),
            max_iterations: self.max_iterations,
            model_timeout: self.llm_timeout,
            tool_timeout: self.tool_timeout,
            generation: GenerationOptions {
                model: self.llm_model.clone(),
                temperature: self.llm_temperature,
                ..Default::default()
            },
            tool_call_style: self.tool_call_style,
            ..Default::default()
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

/// Drop credentials from a connection string, keeping host and database.
///
/// `postgresql://user:secret@db:5432/app` becomes `db:5432/app`.
pub fn redact_connection_string(url: &str) -> String {
    match url.rsplit_once('@') {
        Some((_, location)) => location.to_string(),
        None => url.to_string(),
    }
}
