//! chainup-deploy - Local chain bootstrap library.
//!
//! Starts (or reuses) a local Ethereum JSON-RPC backend, compiles a fixed set of Solidity
//! contracts, deploys them in order and records where they landed in a JSON registry.

mod client;
mod compiler;
mod config;
mod deployment;
mod error;
mod fs;
mod orchestrator;
mod process;
mod readiness;
mod registry;
pub mod rpc;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use client::ContractClient;
pub use compiler::{
    CompiledContract, Compiler, CompilerConfig, ContractSource, DEFAULT_CONTRACTS, SolcCompiler,
};
pub use config::{CONFIG_FILENAME, ENV_PREFIX, OrchestratorConfig};
pub use deployment::{DeployedContract, DeploymentConfig, DeploymentEngine, DeploymentReport};
pub use error::{
    CompilationError, DeploymentFailure, DeploymentSetupError, LaunchError, OrchestrationError,
    ReadinessError, RegistryLoadError, RegistryPersistError,
};
pub use fs::FsHandler;
pub use orchestrator::{
    OrchestrationResult, OrchestrationStatus, Orchestrator, StatusCallback, contract_address,
};
pub use process::{CommandLine, ProcessControl, ProcessHandle};
pub use readiness::{ReadinessConfig, ReadinessLevel, ReadinessProber};
pub use registry::{
    BackupRecord, PersistOutcome, RegistryConfig, RegistryEntry, RegistrySnapshot, RegistryStore,
    backup_path,
};
pub use rpc::{ChainRpc, HttpChainRpc};
pub use services::{BackendKind, NodeConfig, NodeHandle, NodeState, NodeSupervisor};
