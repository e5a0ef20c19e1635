//! Node configuration loading
//!
//! Layers built-in defaults, an optional configuration file and
//! `CONTRACT_ENGINE__*` environment variables into one [`NodeConfig`].

use crate::{
    chain::ChainConfig, dispute_engine::DisputeEngineConfig, escort::EscortConfig,
    escrow_engine::EscrowEngineConfig, merkle_verifier::VerifierConfig, monitor::MonitorConfig,
    script_validator::ScriptValidatorConfig, EngineResult,
};
use serde::{Deserialize, Serialize};
use tracing::{info, Level};

/// Environment variable prefix, e.g. `CONTRACT_ENGINE__MONITOR__CHECK_INTERVAL_SECS=30`
pub const ENV_PREFIX: &str = "CONTRACT_ENGINE";

/// Configuration for every component of a contract node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Log level for the `contract-node` binary
    pub log_level: String,
    pub chain: ChainConfig,
    pub script: ScriptValidatorConfig,
    pub verifier: VerifierConfig,
    pub escrow: EscrowEngineConfig,
    pub dispute: DisputeEngineConfig,
    pub monitor: MonitorConfig,
    pub escort: EscortConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            chain: ChainConfig::default(),
            script: ScriptValidatorConfig::default(),
            verifier: VerifierConfig::default(),
            escrow: EscrowEngineConfig::default(),
            dispute: DisputeEngineConfig::default(),
            monitor: MonitorConfig::default(),
            escort: EscortConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&str>) -> EngineResult<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!("Loading configuration from {}", path);
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Install the global fmt subscriber. Later calls are no-ops.
pub fn init_logging(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
