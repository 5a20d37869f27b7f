//! chainup starts a local Ethereum chain backend and deploys the contract suite to it.

mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use chainup_deploy::{
    HttpChainRpc, OrchestrationResult, OrchestratorConfig, Orchestrator, RegistrySnapshot,
    RegistryStore, services::node::is_backend_listening,
};
use clap::Parser;
use comfy_table::Table;

use cli::{Cli, Command, UpArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let mut config = OrchestratorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Up(args) => up(config, &args).await,
        Command::Status(args) => {
            args.apply(&mut config);
            status(&config).await
        }
        Command::InitConfig { path } => init_config(&config, &path),
    }
}

async fn up(mut config: OrchestratorConfig, args: &UpArgs) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        backend = %config.node.backend,
        port = config.node.port,
        registry = %config.registry.path.display(),
        contracts = config.compiler.contracts.len(),
        force = config.force,
        "Bringing the chain up..."
    );

    let mut orchestrator = Orchestrator::new(config)?
        .on_status(|status| tracing::info!(target: "chainup", "{}", status));

    let outcome = tokio::select! {
        result = orchestrator.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(result) = outcome else {
        tracing::warn!("Interrupted, stopping the chain backend...");
        orchestrator.shutdown().await;
        anyhow::bail!("Interrupted before the deployment completed");
    };

    let mut result = result.context("Deployment failed")?;
    print_result(&result);

    let Some(node) = result.node.as_mut() else {
        return Ok(());
    };

    if node.is_adopted() || args.detach {
        return Ok(());
    }

    tracing::info!(
        pid = ?node.pid(),
        port = node.port(),
        "Chain backend running, press Ctrl+C to stop it"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    orchestrator.stop_node(node).await;
    Ok(())
}

fn print_result(result: &OrchestrationResult<HttpChainRpc>) {
    if result.reused_registry {
        println!("Registry already complete, nothing deployed.");
        println!("{}", registry_table(&result.registry));
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["Contract", "Address", "Gas used", "Fallback gas limit"]);
    for contract in &result.deployed {
        table.add_row(vec![
            contract.name.clone(),
            contract.address.to_checksum(None),
            contract.gas_used.to_string(),
            if contract.used_fallback_gas_limit { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{table}");

    if !result.failures.is_empty() {
        let mut table = Table::new();
        table.set_header(vec![
            "Failed contract",
            "Gas limit",
            "Error",
            "Fallback gas limit",
            "Error",
        ]);
        for failure in &result.failures {
            table.add_row(vec![
                failure.contract.clone(),
                failure.primary_gas_limit.to_string(),
                failure.primary_error.clone(),
                failure.fallback_gas_limit.to_string(),
                failure.fallback_error.clone(),
            ]);
        }
        println!("{table}");
    }

    if let Some(backup) = &result.backup {
        println!("Previous registry saved to {}", backup.backup.display());
    }
}

fn registry_table(snapshot: &RegistrySnapshot) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Contract", "Address", "Transaction"]);
    for (name, entry) in &snapshot.contracts {
        table.add_row(vec![
            name.clone(),
            entry.address.clone(),
            entry
                .transaction_hash
                .map(|hash| hash.to_string())
                .unwrap_or_default(),
        ]);
    }
    table
}

async fn status(config: &OrchestratorConfig) -> Result<()> {
    let store = RegistryStore::new(config.registry.path.clone());
    let listening = is_backend_listening(config.node.port).await;
    println!(
        "Chain backend on port {}: {}",
        config.node.port,
        if listening { "listening" } else { "not listening" }
    );

    let snapshot = store
        .load()?
        .with_context(|| format!("No registry at {}", store.path().display()))?;

    println!(
        "Registry {} (network {}, written {})",
        store.path().display(),
        snapshot.network,
        snapshot.timestamp
    );
    println!("{}", registry_table(&snapshot));

    let required = &config.compiler.contracts;
    if !RegistryStore::is_valid(&snapshot, required) {
        anyhow::bail!(
            "Registry is missing contracts: {}",
            snapshot.missing(required).join(", ")
        );
    }

    println!("Registry lists all {} contracts.", required.len());
    Ok(())
}

fn init_config(config: &OrchestratorConfig, path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    config.save_to_file(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}
