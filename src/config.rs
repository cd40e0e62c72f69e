//! Environment configuration.
//!
//! The relay is configured entirely through environment variables (a `.env`
//! file is honored in development). All variables are mandatory and the
//! process fails fast on a missing or malformed value.

use alloy::primitives::Address;
use thiserror::Error;

/// WebSocket JSON-RPC endpoint of the chain node.
pub const BLOCKCHAIN_URL_VAR: &str = "BLOCKCHAIN_URL_FOR_LISTENERS";
/// Address of the deployed OrbitSphere contract.
pub const CONTRACT_ADDRESS_VAR: &str = "ORBIT_SPHERE_ADDRESS";
/// AMQP connection URL of the broker.
pub const BROKER_URL_VAR: &str = "RABBITMQ_CONNECTION_URL";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{var}`: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Validated relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the chain node.
    pub rpc_url: String,
    /// OrbitSphere contract address.
    pub contract_address: Address,
    /// AMQP broker connection URL.
    pub broker_url: String,
}

impl Config {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any variable is absent or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let rpc_url = required(&lookup, BLOCKCHAIN_URL_VAR)?;
        if !rpc_url.starts_with("ws://") && !rpc_url.starts_with("wss://") {
            return Err(ConfigError::Invalid {
                var: BLOCKCHAIN_URL_VAR,
                reason: "live subscriptions require a ws:// or wss:// endpoint".into(),
            });
        }

        let contract_address = required(&lookup, CONTRACT_ADDRESS_VAR)?
            .parse::<Address>()
            .map_err(|e| ConfigError::Invalid { var: CONTRACT_ADDRESS_VAR, reason: e.to_string() })?;

        let broker_url = required(&lookup, BROKER_URL_VAR)?;

        Ok(Self { rpc_url, contract_address, broker_url })
    }
}

fn required(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(var)),
    }
}
