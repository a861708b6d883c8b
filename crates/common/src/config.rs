// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Platform target configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const GATEWAY_PORT: u16 = 2222;

/// Where the CLI points and how it authenticates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the platform API, e.g. https://api.cloud.example.com
    pub api_url: String,
    /// OAuth bearer token used for platform API calls
    pub token: String,
    /// Remote-shell gateway address (host:port). Derived from the API host
    /// when not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("service-tunnel").join("config.toml"))
    }

    /// Load and validate the configuration file
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let contents = std::fs::read_to_string(&path).map_err(|_| {
            Error::Config(format!(
                "No configuration found at {} (expected api_url and token)",
                path.display()
            ))
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(Error::Config("api_url cannot be empty".to_string()));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(Error::Config("api_url must be an http(s) URL".to_string()));
        }
        if self.token.is_empty() {
            return Err(Error::Config("token cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Address of the remote-shell gateway. The gateway lives next to the
    /// API endpoint: api.<domain> maps to ssh.<domain>.
    pub fn gateway_addr(&self) -> Result<String> {
        if let Some(gateway) = &self.gateway {
            return Ok(gateway.clone());
        }

        let host = self
            .api_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default();
        let domain = host.strip_prefix("api.").ok_or_else(|| {
            Error::Config(format!(
                "Cannot derive the gateway address from '{}'; set 'gateway' explicitly",
                host
            ))
        })?;
        Ok(format!("ssh.{}:{}", domain, GATEWAY_PORT))
    }
}
