use crate::error::{BridgeError, Result};
use std::collections::HashMap;

/// How to launch a tool server: executable, arguments and environment overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerParams {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Keys that must be present and non-empty in `env` before spawning
    pub required_env: Vec<String>,
}

impl ServerParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn require_env(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.required_env.contains(&key) {
            self.required_env.push(key);
        }
        self
    }

    /// Copy `key` from this process's environment and mark it required.
    ///
    /// Fails immediately when the variable is unset or empty.
    pub fn passthrough(self, key: &str) -> Result<Self> {
        match std::env::var(key) {
            Ok(value) if !value.is_empty() => Ok(self.env(key, value).require_env(key)),
            _ => Err(BridgeError::MissingEnvironment(key.to_string())),
        }
    }

    /// Verify every required key is set; called before any process is spawned
    pub fn check_required(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::Config("tool server command is empty".to_string()));
        }

        for key in &self.required_env {
            match self.env.get(key) {
                Some(value) if !value.is_empty() => {}
                _ => return Err(BridgeError::MissingEnvironment(key.clone())),
            }
        }

        Ok(())
    }

    /// Command line for log messages; environment values are never included
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}
