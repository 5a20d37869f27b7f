//! Local chain backend supervision.

mod cmd;

use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

pub use cmd::NodeCmdBuilder;

use crate::{
    error::LaunchError,
    process::{CommandLine, ProcessHandle},
};

/// Default RPC port of the chain backend.
pub const DEFAULT_PORT: u16 = 8545;

/// Mnemonic the development backends derive their pre-funded accounts from.
pub const DEFAULT_MNEMONIC: &str =
    "candy maple cake sugar pudding cream honey rich smooth crumble sweet treat";

/// Timeout of the TCP probe telling whether something listens on the backend port.
const LISTEN_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for the output pipes of a backend that died at launch.
const OUTPUT_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between checks on a running dependency install.
const INSTALL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Supported chain backends.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    /// Foundry's anvil.
    #[default]
    Anvil,
    /// `npx hardhat node`.
    Hardhat,
    /// `ganache-cli`.
    Ganache,
    /// Any command given verbatim in [`NodeConfig::command`].
    Custom,
}

impl BackendKind {
    /// Whether the backend exposes funded, node-managed accounts out of the box.
    pub fn prefunds_accounts(self) -> bool {
        !matches!(self, Self::Custom)
    }
}

/// Configuration of the chain backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub backend: BackendKind,
    /// Address the backend binds to.
    pub host: String,
    pub port: u16,
    /// RPC endpoint. Defaults to `http://127.0.0.1:<port>/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub accounts: u32,
    pub balance_ether: u64,
    pub gas_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    /// Full command line of a [`BackendKind::Custom`] backend.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Overrides [`BackendKind::prefunds_accounts`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefunds_accounts: Option<bool>,
    /// Command installing the hardhat project's dependencies when `node_modules` is missing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub install_command: Vec<String>,
    pub install_timeout_ms: u64,
    /// Delay between the launch and the early-exit check.
    pub launch_check_delay_ms: u64,
    /// Time given to the backend to exit after the graceful signal.
    pub stop_grace_period_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: DEFAULT_PORT,
            rpc_url: None,
            chain_id: None,
            accounts: 10,
            balance_ether: 1000,
            gas_limit: 8_000_000,
            mnemonic: Some(DEFAULT_MNEMONIC.to_string()),
            command: Vec::new(),
            extra_args: Vec::new(),
            working_directory: None,
            prefunds_accounts: None,
            install_command: vec!["npm".to_string(), "install".to_string()],
            install_timeout_ms: 300_000,
            launch_check_delay_ms: 500,
            stop_grace_period_ms: 5_000,
        }
    }
}

impl NodeConfig {
    /// The RPC endpoint of the backend.
    pub fn endpoint(&self) -> anyhow::Result<Url> {
        match &self.rpc_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(&format!("http://{}:{}/", Ipv4Addr::LOCALHOST, self.port))
                .context("Failed to parse RPC URL"),
        }
    }

    pub fn prefunds_accounts(&self) -> bool {
        self.prefunds_accounts
            .unwrap_or_else(|| self.backend.prefunds_accounts())
    }

    /// The command line launching the configured backend.
    pub fn command_line(&self) -> Result<CommandLine, LaunchError> {
        NodeCmdBuilder::new(self.backend)
            .host(&self.host)
            .port(self.port)
            .chain_id(self.chain_id)
            .accounts(self.accounts)
            .balance_ether(self.balance_ether)
            .gas_limit(self.gas_limit)
            .mnemonic(self.mnemonic.clone())
            .custom_command(self.command.clone())
            .extra_args(self.extra_args.clone())
            .build()
    }
}

/// Lifecycle state of a chain backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum NodeState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl NodeState {
    fn rank(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Ready | Self::Failed => 1,
            Self::Stopped => 2,
        }
    }

    /// Transitions only move forward: Starting, then Ready or Failed, then Stopped.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        next.rank() > self.rank()
    }
}

/// A chain backend, either launched by this process or adopted because it was already
/// listening.
#[derive(Debug)]
pub struct NodeHandle {
    process: Option<ProcessHandle>,
    backend: BackendKind,
    port: u16,
    started_at: DateTime<Utc>,
    state: NodeState,
    history: Vec<NodeState>,
}

impl NodeHandle {
    fn launched(process: ProcessHandle, backend: BackendKind, port: u16) -> Self {
        Self {
            started_at: process.started_at(),
            process: Some(process),
            backend,
            port,
            state: NodeState::Starting,
            history: vec![NodeState::Starting],
        }
    }

    fn adopted(backend: BackendKind, port: u16) -> Self {
        Self {
            process: None,
            backend,
            port,
            started_at: Utc::now(),
            state: NodeState::Ready,
            history: vec![NodeState::Ready],
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Every state the handle went through, oldest first.
    pub fn history(&self) -> &[NodeState] {
        &self.history
    }

    /// Process id of a launched backend.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    /// Launch time, or adoption time for an adopted backend.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the backend was already running and is not owned by this handle.
    pub fn is_adopted(&self) -> bool {
        self.process.is_none()
    }

    /// Move to [`NodeState::Stopped`]. A backend that never became ready fails first.
    fn stopped(&mut self) {
        if self.state == NodeState::Starting {
            self.transition(NodeState::Failed);
        }
        self.transition(NodeState::Stopped);
    }

    fn transition(&mut self, next: NodeState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(from = %self.state, to = %next, port = self.port, "Node state changed");
            self.state = next;
            self.history.push(next);
        } else {
            tracing::warn!(
                from = %self.state,
                to = %next,
                port = self.port,
                "Ignoring backward node state transition"
            );
        }
    }
}

/// True if something accepts TCP connections on `127.0.0.1:port`.
pub async fn is_backend_listening(port: u16) -> bool {
    let connect = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(LISTEN_PROBE_TIMEOUT, connect).await,
        Ok(Ok(_))
    )
}

/// Starts, watches and stops the chain backend.
#[derive(Debug, Clone)]
pub struct NodeSupervisor {
    config: NodeConfig,
}

impl NodeSupervisor {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn is_backend_listening(&self) -> bool {
        is_backend_listening(self.config.port).await
    }

    /// A Ready handle over a backend this process does not own.
    pub fn adopt(&self) -> NodeHandle {
        NodeHandle::adopted(self.config.backend, self.config.port)
    }

    /// Launch the backend, or adopt it if something already listens on the port.
    ///
    /// A launched backend is returned in state [`NodeState::Starting`]; readiness is the
    /// caller's concern.
    pub async fn start(&self) -> Result<NodeHandle, LaunchError> {
        if self.is_backend_listening().await {
            tracing::info!(
                port = self.config.port,
                "A chain backend is already listening, reusing it"
            );
            return Ok(self.adopt());
        }

        self.ensure_dependencies().await?;

        let command = self.config.command_line()?;

        tracing::info!(
            backend = %self.config.backend,
            port = self.config.port,
            command = %command,
            "Starting chain backend..."
        );

        let process = ProcessHandle::start(&command, self.config.working_directory.as_deref())?;
        let mut handle = NodeHandle::launched(process, self.config.backend, self.config.port);

        tokio::time::sleep(Duration::from_millis(self.config.launch_check_delay_ms)).await;

        let exited = match handle.process.as_mut() {
            Some(process) => {
                if process.is_alive() {
                    None
                } else {
                    Some((
                        process.exit_status(),
                        process.captured_output(OUTPUT_SETTLE_TIMEOUT).await,
                    ))
                }
            }
            None => None,
        };

        if let Some((status, output)) = exited {
            handle.transition(NodeState::Failed);

            tracing::error!(
                program = %command.program,
                ?status,
                "Chain backend exited right after launch"
            );

            return Err(LaunchError::exited_early(&command.program, status, output));
        }

        tracing::info!(
            pid = ?handle.pid(),
            port = self.config.port,
            "Chain backend process started"
        );

        Ok(handle)
    }

    /// Install the hardhat project's npm dependencies when `node_modules` is missing.
    ///
    /// Other backends ship as standalone binaries and need nothing.
    pub async fn ensure_dependencies(&self) -> Result<(), LaunchError> {
        if self.config.backend != BackendKind::Hardhat {
            return Ok(());
        }

        let project = self
            .config
            .working_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        if project.join("node_modules").exists() {
            return Ok(());
        }

        let command = CommandLine::from_parts(self.config.install_command.clone())?;
        tracing::info!(
            project = %project.display(),
            command = %command,
            "node_modules not found, installing dependencies..."
        );

        let mut process = ProcessHandle::start(&command, Some(project.as_path()))?;
        let timeout = Duration::from_millis(self.config.install_timeout_ms);
        let deadline = Instant::now() + timeout;

        while process.is_alive() {
            if Instant::now() >= deadline {
                process
                    .terminate(Duration::from_millis(self.config.stop_grace_period_ms))
                    .await;
                let output = process.captured_output(OUTPUT_SETTLE_TIMEOUT).await;
                tracing::error!(
                    program = %command.program,
                    ?timeout,
                    "Dependency install timed out"
                );
                return Err(LaunchError::DependencyInstall {
                    program: command.program,
                    status: format!("timed out after {:?}", timeout),
                    output,
                });
            }
            tokio::time::sleep(INSTALL_POLL_INTERVAL).await;
        }

        let status = process.exit_status();
        if !status.is_some_and(|status| status.success()) {
            let output = process.captured_output(OUTPUT_SETTLE_TIMEOUT).await;
            tracing::error!(program = %command.program, ?status, "Dependency install failed");
            return Err(LaunchError::DependencyInstall {
                program: command.program,
                status: status.map_or_else(|| "unknown status".to_string(), |s| s.to_string()),
                output,
            });
        }

        tracing::info!(project = %project.display(), "Dependencies installed");
        Ok(())
    }

    /// Starting to Ready.
    pub fn mark_ready(&self, handle: &mut NodeHandle) {
        handle.transition(NodeState::Ready);
    }

    /// Starting to Failed, for a backend that never became ready.
    pub fn mark_failed(&self, handle: &mut NodeHandle) {
        handle.transition(NodeState::Failed);
    }

    /// Liveness of the backend behind `handle`.
    ///
    /// A launched backend found dead is moved to [`NodeState::Stopped`].
    pub async fn is_running(&self, handle: &mut NodeHandle) -> bool {
        match handle.process.as_mut() {
            None => is_backend_listening(handle.port).await,
            Some(process) => {
                if process.is_alive() {
                    return true;
                }
                if handle.state != NodeState::Stopped {
                    tracing::warn!(
                        pid = process.pid(),
                        status = ?process.exit_status(),
                        "Chain backend exited on its own"
                    );
                    handle.stopped();
                }
                false
            }
        }
    }

    /// Stop a launched backend. Adopted backends are left running.
    pub async fn stop(&self, handle: &mut NodeHandle) {
        let Some(process) = handle.process.as_mut() else {
            tracing::debug!(port = handle.port, "Not stopping an adopted chain backend");
            return;
        };

        if handle.state == NodeState::Stopped {
            return;
        }

        tracing::info!(pid = process.pid(), "Stopping chain backend...");
        process
            .terminate(Duration::from_millis(self.config.stop_grace_period_ms))
            .await;
        handle.stopped();
        tracing::info!(port = handle.port, "Chain backend stopped");
    }
}
