//! End-to-end orchestration: node, readiness, compilation, deployment, registry.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use alloy_core::primitives::Address;
use anyhow::Context;
use tokio::task::JoinHandle;

use crate::{
    client::ContractClient,
    compiler::{Compiler, SolcCompiler},
    config::OrchestratorConfig,
    deployment::{DeployedContract, DeploymentEngine},
    error::{DeploymentFailure, OrchestrationError, RegistryPersistError},
    readiness::ReadinessProber,
    registry::{BackupRecord, RegistryEntry, RegistrySnapshot, RegistryStore},
    rpc::{ChainRpc, HttpChainRpc},
    services::node::{NodeHandle, NodeState, NodeSupervisor},
};

/// Progress of a run, reported through [`Orchestrator::on_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    /// The registry already lists every contract; nothing to do.
    RegistryReused { contracts: usize },
    StartingNode { port: u16 },
    NodeAdopted { port: u16 },
    NodeLaunched { pid: Option<u32> },
    WaitingForNode { endpoint: String, max_attempts: u32 },
    NodeReady,
    Compiling { contracts: usize },
    Deploying { contracts: usize },
    WritingRegistry { contracts: usize },
    Completed { deployed: usize, failed: usize },
    Failed { reason: String },
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryReused { contracts } => {
                write!(f, "Registry already lists all {} contracts", contracts)
            }
            Self::StartingNode { port } => write!(f, "Starting chain backend on port {}", port),
            Self::NodeAdopted { port } => write!(f, "Reusing chain backend on port {}", port),
            Self::NodeLaunched { pid } => match pid {
                Some(pid) => write!(f, "Chain backend launched (pid {})", pid),
                None => write!(f, "Chain backend launched"),
            },
            Self::WaitingForNode { endpoint, max_attempts } => write!(
                f,
                "Waiting for {} (up to {} attempts)",
                endpoint, max_attempts
            ),
            Self::NodeReady => write!(f, "Chain backend ready"),
            Self::Compiling { contracts } => write!(f, "Compiling {} contracts", contracts),
            Self::Deploying { contracts } => write!(f, "Deploying {} contracts", contracts),
            Self::WritingRegistry { contracts } => {
                write!(f, "Writing {} contracts to the registry", contracts)
            }
            Self::Completed { deployed, failed } => {
                write!(f, "Done: {} deployed, {} failed", deployed, failed)
            }
            Self::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

/// Receives [`OrchestrationStatus`] updates. Runs inline on the orchestration task and must
/// return quickly.
pub type StatusCallback = Arc<dyn Fn(&OrchestrationStatus) + Send + Sync>;

/// What a run leaves behind.
#[derive(Debug)]
pub struct OrchestrationResult<R> {
    /// The chain backend: launched by this run, adopted, or `None` when the registry was
    /// reused and nothing listens on the port.
    pub node: Option<NodeHandle>,
    /// The registry as now on disk.
    pub registry: RegistrySnapshot,
    /// Contracts deployed by this run, in deployment order.
    pub deployed: Vec<DeployedContract>,
    pub failures: Vec<DeploymentFailure>,
    /// Backup taken before the registry was rewritten.
    pub backup: Option<BackupRecord>,
    /// True when the existing registry was reused without deploying.
    pub reused_registry: bool,
    /// Client over the contracts of [`Self::registry`].
    pub client: ContractClient<R>,
}

/// Brings the chain backend up and makes sure the registry lists a deployment of every
/// configured contract.
pub struct Orchestrator<R = HttpChainRpc, C = SolcCompiler> {
    config: OrchestratorConfig,
    rpc: R,
    compiler: C,
    supervisor: NodeSupervisor,
    store: RegistryStore,
    status: Option<StatusCallback>,
    /// Node of the run in progress.
    node: Option<NodeHandle>,
}

impl<R, C> fmt::Debug for Orchestrator<R, C>
where
    R: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("rpc", &self.rpc)
            .field("compiler", &self.compiler)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// An orchestrator talking JSON-RPC over HTTP and compiling with `solc`.
    pub fn new(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let endpoint = config.node.endpoint()?;
        let rpc = HttpChainRpc::new(endpoint).context("Failed to create RPC client")?;
        let compiler = SolcCompiler::new(&config.compiler);
        Self::with_components(config, rpc, compiler)
    }
}

impl<R: ChainRpc, C: Compiler> Orchestrator<R, C> {
    pub fn with_components(
        config: OrchestratorConfig,
        rpc: R,
        compiler: C,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        Ok(Self {
            supervisor: NodeSupervisor::new(config.node.clone()),
            store: RegistryStore::new(config.registry.path.clone()),
            config,
            rpc,
            compiler,
            status: None,
            node: None,
        })
    }

    /// Register the status callback.
    pub fn on_status(
        mut self,
        callback: impl Fn(&OrchestrationStatus) + Send + Sync + 'static,
    ) -> Self {
        self.status = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &NodeSupervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    fn notify(&self, status: OrchestrationStatus) {
        tracing::debug!(%status, "Orchestration status");
        if let Some(callback) = &self.status {
            callback(&status);
        }
    }

    /// Run the orchestration.
    ///
    /// Without `force`, a registry already listing every configured contract is returned
    /// as is: nothing is launched, compiled or deployed. On a fatal error the registry is
    /// left as found and a node launched by this run is stopped.
    pub async fn run(&mut self) -> Result<OrchestrationResult<R>, OrchestrationError> {
        if !self.config.force {
            let required = &self.config.compiler.contracts;
            match self.store.load() {
                Ok(Some(snapshot)) if RegistryStore::is_valid(&snapshot, required) => {
                    return Ok(self.reuse(snapshot).await);
                }
                Ok(Some(snapshot)) => tracing::info!(
                    missing = ?snapshot.missing(required),
                    "Registry is incomplete, deploying"
                ),
                Ok(None) => tracing::info!(
                    path = %self.store.path().display(),
                    "No registry found, deploying"
                ),
                Err(err) => tracing::warn!(error = ?err, "Registry unreadable, deploying"),
            }
        }

        match self.deploy().await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.notify(OrchestrationStatus::Failed {
                    reason: err.to_string(),
                });
                self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Run the orchestration on a background task.
    ///
    /// Aborting the task drops the orchestrator, which kills a node it launched.
    pub fn spawn(mut self) -> JoinHandle<(Self, Result<OrchestrationResult<R>, OrchestrationError>)>
    where
        C: 'static,
    {
        tokio::spawn(async move {
            let result = self.run().await;
            (self, result)
        })
    }

    /// Stop the node of an interrupted run, if this orchestrator launched it.
    pub async fn shutdown(&mut self) {
        if let Some(mut node) = self.node.take() {
            self.supervisor.stop(&mut node).await;
        }
    }

    /// Stop a node returned by [`Self::run`]. Adopted nodes are left running.
    pub async fn stop_node(&self, node: &mut NodeHandle) {
        self.supervisor.stop(node).await;
    }

    async fn reuse(&self, snapshot: RegistrySnapshot) -> OrchestrationResult<R> {
        let node = if self.supervisor.is_backend_listening().await {
            Some(self.supervisor.adopt())
        } else {
            tracing::warn!(
                port = self.config.node.port,
                "Registry is complete but no chain backend listens on the port"
            );
            None
        };

        tracing::info!(
            path = %self.store.path().display(),
            contracts = snapshot.contracts.len(),
            "Registry already lists every contract, skipping deployment"
        );
        self.notify(OrchestrationStatus::RegistryReused {
            contracts: snapshot.contracts.len(),
        });

        OrchestrationResult {
            node,
            client: self.client(&snapshot),
            registry: snapshot,
            deployed: Vec::new(),
            failures: Vec::new(),
            backup: None,
            reused_registry: true,
        }
    }

    async fn deploy(&mut self) -> Result<OrchestrationResult<R>, OrchestrationError> {
        self.notify(OrchestrationStatus::StartingNode {
            port: self.config.node.port,
        });
        let node = self.supervisor.start().await?;
        self.notify(if node.is_adopted() {
            OrchestrationStatus::NodeAdopted { port: node.port() }
        } else {
            OrchestrationStatus::NodeLaunched { pid: node.pid() }
        });
        self.node = Some(node);

        let endpoint = self.rpc.endpoint().to_string();
        let max_attempts = self.config.readiness.max_attempts;
        self.notify(OrchestrationStatus::WaitingForNode {
            endpoint: endpoint.clone(),
            max_attempts,
        });

        let prober = ReadinessProber::new(self.rpc.clone(), self.config.node.prefunds_accounts());
        let ready = prober
            .wait_until_ready(max_attempts, self.config.readiness.delay())
            .await;

        if let Some(node) = self.node.as_mut().filter(|n| n.state() == NodeState::Starting) {
            if ready.is_ok() {
                self.supervisor.mark_ready(node);
            } else {
                self.supervisor.mark_failed(node);
            }
        }
        if let Err(source) = ready {
            return Err(OrchestrationError::NodeNotReady {
                endpoint,
                attempts: max_attempts,
                source,
            });
        }
        self.notify(OrchestrationStatus::NodeReady);

        let sources = self.config.contract_sources()?;
        self.notify(OrchestrationStatus::Compiling {
            contracts: sources.len(),
        });
        let compiled = self.compiler.compile_all(&sources).await?;

        self.notify(OrchestrationStatus::Deploying {
            contracts: compiled.len(),
        });
        let report = DeploymentEngine::new(self.rpc.clone(), self.config.deployment.clone())
            .deploy_all(&compiled)
            .await?;
        let (deployed, failures) = report.into_parts();

        let entries = deployed
            .iter()
            .map(|contract| {
                RegistryEntry::try_from(contract).map(|entry| (contract.name.clone(), entry))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(RegistryPersistError::Serialize)?;

        self.notify(OrchestrationStatus::WritingRegistry {
            contracts: entries.len(),
        });
        let outcome = self
            .store
            .persist(entries, &self.config.network(), self.config.force)?;

        for failure in &failures {
            tracing::warn!(contract = %failure.contract, "Contract left out of the registry");
        }

        self.notify(OrchestrationStatus::Completed {
            deployed: deployed.len(),
            failed: failures.len(),
        });

        Ok(OrchestrationResult {
            node: self.node.take(),
            client: self.client(&outcome.snapshot),
            registry: outcome.snapshot,
            deployed,
            failures,
            backup: outcome.backup,
            reused_registry: false,
        })
    }

    fn client(&self, snapshot: &RegistrySnapshot) -> ContractClient<R> {
        ContractClient::from_snapshot(self.rpc.clone(), snapshot).with_receipt_polling(
            self.config.deployment.receipt_poll_attempts,
            Duration::from_millis(self.config.deployment.receipt_poll_interval_ms),
        )
    }
}

/// Address of `contract` in `snapshot`, for callers that only need to locate it.
pub fn contract_address(snapshot: &RegistrySnapshot, contract: &str) -> anyhow::Result<Address> {
    snapshot
        .contracts
        .get(contract)
        .with_context(|| format!("{} is not in the registry", contract))?
        .parse_address()
}
