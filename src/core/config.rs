//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Provider connection settings shared by every batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_endpoint: String,
    pub timeout_ms: u64,
    /// Cost per 1k tokens used to price completed tasks
    pub price_per_1k_tokens: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ARK_API_KEY").unwrap_or_default(),
            api_endpoint: std::env::var("API_ENDPOINT").unwrap_or_else(|_| {
                "https://ark.cn-beijing.volces.com/api/v3/chat/completions".to_string()
            }),
            timeout_ms: 30000,
            price_per_1k_tokens: 0.0028,
        }
    }
}

impl ProviderConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("ARK_API_KEY")
            .map_err(|_| anyhow::anyhow!("ARK_API_KEY environment variable is required"))?;

        let api_endpoint = std::env::var("API_ENDPOINT").unwrap_or_else(|_| {
            "https://ark.cn-beijing.volces.com/api/v3/chat/completions".to_string()
        });

        let timeout_ms = std::env::var("REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse::<u64>()?;

        let price_per_1k_tokens = std::env::var("PRICE_PER_1K_TOKENS")
            .unwrap_or_else(|_| "0.0028".to_string())
            .parse::<f64>()?;

        Ok(Self {
            api_key,
            api_endpoint,
            timeout_ms,
            price_per_1k_tokens,
        })
    }

    /// Load from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            return Err(anyhow::anyhow!("API key is required"));
        }

        if self.api_endpoint.is_empty() {
            return Err(anyhow::anyhow!("API endpoint is required"));
        }

        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("timeout_ms must be greater than 0"));
        }

        if self.price_per_1k_tokens < 0.0 {
            warn!("Negative token price, cost accounting will be meaningless");
        }

        Ok(())
    }
}
