use crate::agent::{AgentConfig, DEFAULT_GEMINI_MODEL, DEFAULT_INSTRUCTION};
use crate::bridge::BridgeOptions;
use crate::error::Result;
use crate::transport::ServerParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// The tool server to launch
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Fixed environment overrides for the child
    pub env: HashMap<String, String>,
    /// Variables copied from our own environment; each one must be set
    pub passthrough_env: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "mcp-flight-search".to_string(),
            args: vec!["--connection_type".to_string(), "stdio".to_string()],
            env: HashMap::new(),
            passthrough_env: vec!["SERP_API_KEY".to_string()],
        }
    }
}

impl ServerConfig {
    /// Launch parameters; fails with `MissingEnvironment` if a passthrough variable is unset
    pub fn to_params(&self) -> Result<ServerParams> {
        let mut params = ServerParams::new(&self.command).args(self.args.iter().cloned());
        for (key, value) in &self.env {
            params = params.env(key, value);
        }
        for key in &self.passthrough_env {
            params = params.passthrough(key)?;
        }
        Ok(params)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_secs: u64,
    pub call_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: 30,
            call_secs: 60,
            shutdown_grace_ms: 2000,
        }
    }
}

impl TimeoutConfig {
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            handshake_timeout: Duration::from_secs(self.handshake_secs),
            call_timeout: Duration::from_secs(self.call_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSettings {
    pub name: String,
    pub model: String,
    pub instruction: String,
    pub max_steps: usize,
    pub max_concurrent_calls: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            name: defaults.name,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            instruction: defaults.instruction,
            max_steps: defaults.max_steps,
            max_concurrent_calls: defaults.max_concurrent_calls,
        }
    }
}

impl AgentSettings {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            name: self.name.clone(),
            instruction: if self.instruction.trim().is_empty() {
                DEFAULT_INSTRUCTION.to_string()
            } else {
                self.instruction.clone()
            },
            max_steps: self.max_steps,
            max_concurrent_calls: self.max_concurrent_calls,
            call_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn test_defaults_describe_flight_search() {
        let config = AppConfig::default();
        assert_eq!(config.server.command, "mcp-flight-search");
        assert_eq!(config.server.args, vec!["--connection_type", "stdio"]);
        assert_eq!(config.server.passthrough_env, vec!["SERP_API_KEY"]);
        assert_eq!(config.agent.name, "flight_search_assistant");
        assert_eq!(config.agent.model, DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn test_bridge_options_from_timeouts() {
        let timeouts = TimeoutConfig {
            handshake_secs: 5,
            call_secs: 10,
            shutdown_grace_ms: 250,
        };
        let options = timeouts.bridge_options();
        assert_eq!(options.handshake_timeout, Duration::from_secs(5));
        assert_eq!(options.call_timeout, Duration::from_secs(10));
        assert_eq!(options.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_to_params_keeps_fixed_env() {
        let server = ServerConfig {
            command: "tool-server".to_string(),
            args: vec!["--stdio".to_string()],
            env: HashMap::from([("REGION".to_string(), "eu".to_string())]),
            passthrough_env: Vec::new(),
        };
        let params = server.to_params().unwrap();
        assert_eq!(params.command, "tool-server");
        assert_eq!(params.args, vec!["--stdio"]);
        assert_eq!(params.env.get("REGION").map(String::as_str), Some("eu"));
        assert!(params.required_env.is_empty());
    }

    #[test]
    fn test_to_params_missing_passthrough() {
        let server = ServerConfig {
            passthrough_env: vec!["TOOLBRIDGE_TEST_NEVER_SET_KEY".to_string()],
            ..Default::default()
        };
        let err = server.to_params().unwrap_err();
        assert!(matches!(err, BridgeError::MissingEnvironment(key) if key == "TOOLBRIDGE_TEST_NEVER_SET_KEY"));
    }

    #[test]
    fn test_blank_instruction_falls_back() {
        let settings = AgentSettings {
            instruction: "  ".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.agent_config().instruction, DEFAULT_INSTRUCTION);
    }
}
