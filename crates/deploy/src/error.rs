//! Error taxonomy of an orchestration run.

use std::{io, path::PathBuf, process::ExitStatus};

use crate::readiness::ReadinessLevel;

/// The chain backend process could not be spawned or died right after launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("executable `{program}` not found")]
    NotFound {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited right after launch ({status}); output:\n{output}")]
    ExitedEarly {
        program: String,
        status: String,
        output: String,
    },
    #[error("empty command line for the chain backend")]
    EmptyCommand,
    #[error("dependency install `{program}` failed ({status}); output:\n{output}")]
    DependencyInstall {
        program: String,
        status: String,
        output: String,
    },
}

impl LaunchError {
    pub(crate) fn exited_early(program: &str, status: Option<ExitStatus>, output: String) -> Self {
        Self::ExitedEarly {
            program: program.to_string(),
            status: status.map_or_else(|| "unknown status".to_string(), |s| s.to_string()),
            output,
        }
    }
}

/// A single contract failed to compile. Aborts the whole batch.
#[derive(Debug, thiserror::Error)]
#[error("failed to compile contract `{contract}`")]
pub struct CompilationError {
    pub contract: String,
    #[source]
    pub source: anyhow::Error,
}

impl CompilationError {
    pub fn new(contract: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            contract: contract.into(),
            source,
        }
    }
}

/// Both gas-limit attempts failed for one contract. Never aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "deployment of `{contract}` failed with gas limit {primary_gas_limit} ({primary_error}) \
     and with fallback gas limit {fallback_gas_limit} ({fallback_error})"
)]
pub struct DeploymentFailure {
    pub contract: String,
    pub primary_gas_limit: u64,
    pub primary_error: String,
    pub fallback_gas_limit: u64,
    pub fallback_error: String,
}

/// The deployment batch could not start: nothing was submitted.
#[derive(Debug, thiserror::Error)]
pub enum DeploymentSetupError {
    #[error("failed to read the latest block gas limit from {endpoint}")]
    GasLimit {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to list accounts on {endpoint}")]
    Accounts {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{endpoint} exposes no node-managed account to deploy from")]
    NoSender { endpoint: String },
}

/// The registry file exists but cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum RegistryLoadError {
    #[error("failed to read registry {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse registry {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The new registry could not be written. The previous file is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum RegistryPersistError {
    #[error("registry {} is locked by another process", path.display())]
    Locked {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize registry")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write registry {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The chain backend never reached the level required to be ready.
#[derive(Debug, thiserror::Error)]
#[error("last readiness probe stopped at {level}")]
pub struct ReadinessError {
    pub level: ReadinessLevel,
    #[source]
    pub source: anyhow::Error,
}

/// Fatal errors of [`crate::Orchestrator::run`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("chain backend at {endpoint} not ready after {attempts} attempts")]
    NodeNotReady {
        endpoint: String,
        attempts: u32,
        #[source]
        source: ReadinessError,
    },
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    #[error(transparent)]
    DeploymentSetup(#[from] DeploymentSetupError),
    #[error(transparent)]
    RegistryPersist(#[from] RegistryPersistError),
}
