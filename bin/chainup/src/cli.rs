use std::path::PathBuf;

use chainup_deploy::{BackendKind, OrchestratorConfig};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "chainup")]
#[command(
    author,
    version,
    about = "Start a local chain backend and deploy the contract suite to it"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(
        short,
        long,
        global = true,
        env = "CHAINUP_VERBOSITY",
        default_value_t = LevelFilter::INFO
    )]
    pub verbosity: LevelFilter,

    /// Path to a Chainup.toml configuration file, or a directory containing one.
    ///
    /// Values from the file are overridden by `CHAINUP_*` environment variables (nested keys
    /// separated by `__`, e.g. `CHAINUP_NODE__PORT`), which are in turn overridden by flags.
    #[arg(short, long, global = true, alias = "conf", env = "CHAINUP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start (or reuse) the chain backend and deploy every contract missing from the registry.
    Up(UpArgs),
    /// Print the registry and whether a chain backend is listening.
    Status(StatusArgs),
    /// Write the effective configuration to a TOML file.
    InitConfig {
        /// Where to write the configuration.
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
pub struct UpArgs {
    /// Port of the chain backend.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// JSON-RPC endpoint of the chain backend.
    ///
    /// Defaults to `http://127.0.0.1:<port>/`.
    #[arg(long)]
    pub rpc_url: Option<Url>,

    /// Backend to launch: anvil, hardhat, ganache or custom.
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Directory holding one `<Name>.sol` file per contract.
    #[arg(long)]
    pub contracts_dir: Option<PathBuf>,

    /// Path of the JSON contract registry.
    #[arg(long, alias = "addresses")]
    pub registry: Option<PathBuf>,

    /// Redeploy every contract and replace the registry, even if it is complete.
    #[arg(long)]
    pub force: bool,

    /// Readiness probes before giving up on the backend.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay between readiness probes, in milliseconds.
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Share of the block gas limit used for the first deployment attempt.
    #[arg(long)]
    pub gas_limit_fraction: Option<f64>,

    /// Exit once deployed instead of keeping a launched backend running until Ctrl+C.
    #[arg(short, long)]
    pub detach: bool,
}

impl UpArgs {
    /// Override `config` with the flags that were given.
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(port) = self.port {
            config.node.port = port;
        }
        if let Some(rpc_url) = &self.rpc_url {
            config.node.rpc_url = Some(rpc_url.clone());
        }
        if let Some(backend) = self.backend {
            config.node.backend = backend;
        }
        if let Some(contracts_dir) = &self.contracts_dir {
            config.compiler.contracts_dir = contracts_dir.clone();
        }
        if let Some(registry) = &self.registry {
            config.registry.path = registry.clone();
        }
        if self.force {
            config.force = true;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.readiness.max_attempts = max_attempts;
        }
        if let Some(delay_ms) = self.delay_ms {
            config.readiness.delay_ms = delay_ms;
        }
        if let Some(fraction) = self.gas_limit_fraction {
            config.deployment.gas_limit_fraction = fraction;
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Path of the JSON contract registry.
    #[arg(long, alias = "addresses")]
    pub registry: Option<PathBuf>,

    /// Port of the chain backend.
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl StatusArgs {
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(registry) = &self.registry {
            config.registry.path = registry.clone();
        }
        if let Some(port) = self.port {
            config.node.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_flags_override_config() {
        let cli = Cli::try_parse_from([
            "chainup",
            "up",
            "--port",
            "7545",
            "--backend",
            "Ganache",
            "--force",
            "--max-attempts",
            "3",
            "--gas-limit-fraction",
            "0.5",
            "--registry",
            "out/addresses.json",
        ])
        .unwrap();

        let Command::Up(args) = cli.command else {
            panic!("expected the up command");
        };

        let mut config = OrchestratorConfig::default();
        args.apply(&mut config);

        assert_eq!(config.node.port, 7545);
        assert_eq!(config.node.backend, BackendKind::Ganache);
        assert!(config.force);
        assert_eq!(config.readiness.max_attempts, 3);
        assert_eq!(config.readiness.delay_ms, 1_000);
        assert_eq!(config.deployment.gas_limit_fraction, 0.5);
        assert_eq!(config.registry.path, PathBuf::from("out/addresses.json"));
        assert!(!args.detach);
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let cli = Cli::try_parse_from(["chainup", "up"]).unwrap();
        let Command::Up(args) = cli.command else {
            panic!("expected the up command");
        };

        let mut config = OrchestratorConfig::default();
        args.apply(&mut config);
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["chainup", "status", "--verbosity", "debug", "-c", "Chainup.toml"])
                .unwrap();
        assert_eq!(cli.verbosity, LevelFilter::DEBUG);
        assert_eq!(cli.config, Some(PathBuf::from("Chainup.toml")));
        assert!(matches!(cli.command, Command::Status(_)));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["chainup", "up", "--backend", "geth"]).is_err());
    }
}
