//! Contract compilation.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};

use alloy_core::{json_abi::JsonAbi, primitives::Bytes};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CompilationError;

/// Contracts of the supply-chain system, in deployment order.
pub const DEFAULT_CONTRACTS: [&str; 9] = [
    "UserRegistry",
    "ProductRegistry",
    "OperationRegistry",
    "QualityControl",
    "SustainabilityMetrics",
    "CO2Token",
    "ProductRequest",
    "SupplyChainCO2",
    "SupplyChain",
];

/// Compiler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Directory holding one `<Name>.sol` per contract.
    pub contracts_dir: PathBuf,
    /// Contract names, in deployment order.
    pub contracts: Vec<String>,
    /// Path or name of the `solc` executable.
    pub solc_path: String,
    pub optimize: bool,
    pub optimize_runs: u32,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            contracts_dir: PathBuf::from("contracts"),
            contracts: DEFAULT_CONTRACTS.iter().map(|s| s.to_string()).collect(),
            solc_path: "solc".to_string(),
            optimize: true,
            optimize_runs: 200,
        }
    }
}

/// A named contract source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractSource {
    pub name: String,
    pub path: PathBuf,
}

impl ContractSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Resolve `<dir>/<Name>.sol` for each name, keeping the order.
    pub fn discover(dir: &Path, names: &[String]) -> Result<Vec<Self>, CompilationError> {
        let mut seen = HashSet::new();

        names
            .iter()
            .map(|name| {
                if !seen.insert(name.as_str()) {
                    return Err(CompilationError::new(
                        name,
                        anyhow::anyhow!("contract listed more than once"),
                    ));
                }

                let path = dir.join(format!("{}.sol", name));
                if !path.is_file() {
                    return Err(CompilationError::new(
                        name,
                        anyhow::anyhow!("source file {} not found", path.display()),
                    ));
                }

                Ok(Self::new(name, path))
            })
            .collect()
    }
}

/// Output of a successful compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledContract {
    pub name: String,
    /// Where the contract came from, for logs.
    pub source: String,
    pub bytecode: Bytes,
    pub abi: JsonAbi,
}

/// A contract compilation toolchain.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        source: &ContractSource,
    ) -> impl Future<Output = Result<CompiledContract, CompilationError>> + Send;

    /// Compile in order. The first failure aborts the batch.
    fn compile_all(
        &self,
        sources: &[ContractSource],
    ) -> impl Future<Output = Result<Vec<CompiledContract>, CompilationError>> + Send {
        async move {
            let mut compiled = Vec::with_capacity(sources.len());
            for source in sources {
                tracing::info!(contract = %source.name, "Compiling contract...");
                let contract = self.compile(source).await.inspect_err(|err| {
                    tracing::error!(contract = %source.name, error = ?err, "Compilation failed");
                })?;
                tracing::debug!(
                    contract = %contract.name,
                    bytecode_len = contract.bytecode.len(),
                    "Contract compiled"
                );
                compiled.push(contract);
            }
            Ok(compiled)
        }
    }
}

/// Compiles through the `solc` command line.
#[derive(Debug, Clone)]
pub struct SolcCompiler {
    solc_path: String,
    optimize_runs: Option<u32>,
}

impl SolcCompiler {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            solc_path: config.solc_path.clone(),
            optimize_runs: config.optimize.then_some(config.optimize_runs),
        }
    }

    fn args(&self, source: &Path) -> Vec<String> {
        let mut args = vec!["--combined-json".to_string(), "abi,bin".to_string()];

        if let Some(runs) = self.optimize_runs {
            args.push("--optimize".to_string());
            args.push("--optimize-runs".to_string());
            args.push(runs.to_string());
        }

        if let Some(dir) = source.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            args.push("--allow-paths".to_string());
            args.push(dir.display().to_string());
        }

        args.push(source.display().to_string());
        args
    }

    async fn run_solc(&self, source: &ContractSource) -> anyhow::Result<CompiledContract> {
        let output = tokio::process::Command::new(&self.solc_path)
            .args(self.args(&source.path))
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.solc_path))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.solc_path,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let combined: CombinedJson =
            serde_json::from_slice(&output.stdout).context("Failed to parse solc output")?;

        let (bytecode, abi) = combined.artifact(&source.name)?;

        Ok(CompiledContract {
            name: source.name.clone(),
            source: source.path.display().to_string(),
            bytecode,
            abi,
        })
    }
}

impl Compiler for SolcCompiler {
    async fn compile(&self, source: &ContractSource) -> Result<CompiledContract, CompilationError> {
        self.run_solc(source)
            .await
            .map_err(|err| CompilationError::new(&source.name, err))
    }
}

/// `solc --combined-json abi,bin` output.
#[derive(Debug, Deserialize)]
struct CombinedJson {
    contracts: BTreeMap<String, CombinedArtifact>,
}

#[derive(Debug, Deserialize)]
struct CombinedArtifact {
    abi: Value,
    bin: String,
}

impl CombinedJson {
    /// Artifact of `name`. Entries are keyed `<source path>:<name>`.
    fn artifact(&self, name: &str) -> anyhow::Result<(Bytes, JsonAbi)> {
        let artifact = self
            .contracts
            .iter()
            .find(|(key, _)| key.rsplit(':').next() == Some(name))
            .map(|(_, artifact)| artifact)
            .with_context(|| format!("solc output has no contract named {}", name))?;

        let bytecode: Bytes = hex::decode(artifact.bin.trim_start_matches("0x"))
            .context("Invalid bytecode in solc output")?
            .into();
        if bytecode.is_empty() {
            anyhow::bail!("{} has no bytecode (interface or abstract contract?)", name);
        }

        // Older solc releases emit the ABI as a JSON string.
        let abi: JsonAbi = match &artifact.abi {
            Value::String(raw) => serde_json::from_str(raw),
            value => serde_json::from_value(value.clone()),
        }
        .context("Invalid ABI in solc output")?;
        if abi.is_empty() {
            anyhow::bail!("{} has an empty ABI", name);
        }

        Ok((bytecode, abi))
    }
}
