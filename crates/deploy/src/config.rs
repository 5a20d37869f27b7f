//! Orchestration configuration.

use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    compiler::{CompilerConfig, ContractSource},
    deployment::DeploymentConfig,
    error::CompilationError,
    readiness::ReadinessConfig,
    registry::RegistryConfig,
    services::node::NodeConfig,
};

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "Chainup.toml";

/// Prefix of the environment variables overriding the configuration. Nested keys are
/// separated by `__`, e.g. `CHAINUP_NODE__PORT=9545`.
pub const ENV_PREFIX: &str = "CHAINUP_";

/// Everything a run needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Redeploy even when the registry already lists every contract, replacing it.
    pub force: bool,
    pub node: NodeConfig,
    pub readiness: ReadinessConfig,
    pub compiler: CompilerConfig,
    pub deployment: DeploymentConfig,
    pub registry: RegistryConfig,
}

impl OrchestratorConfig {
    /// Defaults, then `path` (a TOML file, or a directory holding [`CONFIG_FILENAME`]) if
    /// given, then `CHAINUP_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            let file = if path.is_dir() {
                path.join(CONFIG_FILENAME)
            } else {
                path.to_path_buf()
            };
            figment = figment.merge(Toml::file(file));
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the layered configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path.filter(|path| !path.exists()) {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let config: Self = Self::figment(path)
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;

        tracing::debug!(?config, "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.deployment
            .validate()
            .context("Invalid deployment configuration")?;

        if self.compiler.contracts.is_empty() {
            anyhow::bail!("No contracts configured");
        }

        self.node
            .endpoint()
            .context("Invalid node configuration")?;

        Ok(())
    }

    /// Network identifier written to the registry.
    pub fn network(&self) -> String {
        self.registry
            .network
            .clone()
            .unwrap_or_else(|| self.node.backend.to_string())
    }

    /// Source files of the configured contracts, in deployment order.
    pub fn contract_sources(&self) -> Result<Vec<ContractSource>, CompilationError> {
        ContractSource::discover(&self.compiler.contracts_dir, &self.compiler.contracts)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, without environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::services::node::BackendKind;

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new("chainup-config").unwrap();
        let path = temp_dir.path().join(CONFIG_FILENAME);

        let mut config = OrchestratorConfig::default();
        config.node.backend = BackendKind::Ganache;
        config.node.port = 7545;
        config.deployment.gas_limit_fraction = 0.5;
        config.compiler.contracts = vec!["A".to_string(), "B".to_string()];

        config.save_to_file(&path).unwrap();
        let loaded = OrchestratorConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new("chainup-config").unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILENAME),
            r#"force = true

[node]
backend = "hardhat"
port = 9545

[readiness]
max_attempts = 3
"#,
        )
        .unwrap();

        let config: OrchestratorConfig = OrchestratorConfig::figment(Some(temp_dir.path()))
            .extract()
            .unwrap();

        assert!(config.force);
        assert_eq!(config.node.backend, BackendKind::Hardhat);
        assert_eq!(config.node.port, 9545);
        assert_eq!(config.node.accounts, 10);
        assert_eq!(config.readiness.max_attempts, 3);
        assert_eq!(config.readiness.delay_ms, 1_000);
        assert_eq!(config.deployment.gas_limit_fraction, 0.8);
        assert_eq!(config.compiler.contracts.len(), 9);
        assert_eq!(config.network(), "hardhat");
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());

        config.deployment.gas_limit_fraction = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(OrchestratorConfig::load(Some(Path::new("/nonexistent/Chainup.toml"))).is_err());
    }
}
