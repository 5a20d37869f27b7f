//! Contract deployment with a two-tier gas limit policy.
//!
//! Each contract is first submitted with a fraction of the latest block gas limit. Any
//! failure (rejected send, revert, missing contract address, receipt timeout) is retried
//! exactly once with the full block gas limit. A contract failing both attempts is reported
//! and the batch moves on to the next one.

use std::{collections::BTreeMap, time::Duration};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, B256},
};
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    compiler::CompiledContract,
    error::{DeploymentFailure, DeploymentSetupError},
    rpc::{ChainRpc, TransactionRequest, wait_for_receipt},
};

/// Deployment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Share of the block gas limit used for the first attempt, in (0, 1].
    pub gas_limit_fraction: f64,
    /// Receipt polls per transaction.
    pub receipt_poll_attempts: usize,
    pub receipt_poll_interval_ms: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            gas_limit_fraction: 0.8,
            receipt_poll_attempts: 60,
            receipt_poll_interval_ms: 500,
        }
    }
}

impl DeploymentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.gas_limit_fraction > 0.0 && self.gas_limit_fraction <= 1.0) {
            anyhow::bail!(
                "gas_limit_fraction must be in (0, 1], got {}",
                self.gas_limit_fraction
            );
        }
        if self.receipt_poll_attempts == 0 {
            anyhow::bail!("receipt_poll_attempts must be at least 1");
        }
        Ok(())
    }

    /// Gas limit of the first attempt: `floor(fraction * block_gas_limit)`.
    pub fn primary_gas_limit(&self, block_gas_limit: u64) -> u64 {
        (self.gas_limit_fraction * block_gas_limit as f64).floor() as u64
    }
}

/// A contract live on chain.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedContract {
    pub name: String,
    pub address: Address,
    pub abi: JsonAbi,
    pub transaction_hash: B256,
    pub gas_used: u64,
    /// Whether the first attempt failed and the block gas limit was needed.
    pub used_fallback_gas_limit: bool,
}

/// Outcome of a deployment batch, per contract.
#[derive(Debug, Clone, Default)]
pub struct DeploymentReport {
    order: Vec<String>,
    outcomes: BTreeMap<String, Result<DeployedContract, DeploymentFailure>>,
}

impl DeploymentReport {
    fn record(&mut self, name: String, outcome: Result<DeployedContract, DeploymentFailure>) {
        if self.outcomes.insert(name.clone(), outcome).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Result<DeployedContract, DeploymentFailure>> {
        self.outcomes.get(name)
    }

    /// Contract names, in submission order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Deployed contracts, in submission order.
    pub fn deployed(&self) -> impl Iterator<Item = &DeployedContract> {
        self.in_order().filter_map(|outcome| outcome.as_ref().ok())
    }

    /// Failures, in submission order.
    pub fn failures(&self) -> impl Iterator<Item = &DeploymentFailure> {
        self.in_order().filter_map(|outcome| outcome.as_ref().err())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Split into successes and failures, both in submission order.
    pub fn into_parts(mut self) -> (Vec<DeployedContract>, Vec<DeploymentFailure>) {
        let mut deployed = Vec::new();
        let mut failures = Vec::new();
        for name in &self.order {
            match self.outcomes.remove(name) {
                Some(Ok(contract)) => deployed.push(contract),
                Some(Err(failure)) => failures.push(failure),
                None => {}
            }
        }
        (deployed, failures)
    }

    fn in_order(&self) -> impl Iterator<Item = &Result<DeployedContract, DeploymentFailure>> {
        self.order.iter().filter_map(|name| self.outcomes.get(name))
    }
}

/// Submits compiled contracts through a node-managed account.
#[derive(Debug, Clone)]
pub struct DeploymentEngine<R> {
    rpc: R,
    config: DeploymentConfig,
}

impl<R: ChainRpc> DeploymentEngine<R> {
    pub fn new(rpc: R, config: DeploymentConfig) -> Self {
        Self { rpc, config }
    }

    /// Deploy sequentially, in input order.
    ///
    /// Fails only when the batch cannot start: the block gas limit or the sender account
    /// cannot be read. Per-contract failures are part of the report.
    pub async fn deploy_all(
        &self,
        compiled: &[CompiledContract],
    ) -> Result<DeploymentReport, DeploymentSetupError> {
        let endpoint = self.rpc.endpoint().to_string();

        let block_gas_limit = self
            .rpc
            .latest_block()
            .await
            .map_err(|source| DeploymentSetupError::GasLimit {
                endpoint: endpoint.clone(),
                source,
            })?
            .gas_limit;

        let sender = self
            .rpc
            .accounts()
            .await
            .map_err(|source| DeploymentSetupError::Accounts {
                endpoint: endpoint.clone(),
                source,
            })?
            .first()
            .copied()
            .ok_or(DeploymentSetupError::NoSender { endpoint })?;

        let primary_gas_limit = self.config.primary_gas_limit(block_gas_limit);

        tracing::info!(
            contracts = compiled.len(),
            %sender,
            block_gas_limit,
            primary_gas_limit,
            "Deploying contracts..."
        );

        let mut report = DeploymentReport::default();
        for contract in compiled {
            let outcome = self
                .deploy_one(sender, contract, primary_gas_limit, block_gas_limit)
                .await;
            report.record(contract.name.clone(), outcome);
        }

        tracing::info!(
            deployed = report.deployed().count(),
            failed = report.failures().count(),
            "Deployment batch finished"
        );

        Ok(report)
    }

    async fn deploy_one(
        &self,
        sender: Address,
        contract: &CompiledContract,
        primary_gas_limit: u64,
        fallback_gas_limit: u64,
    ) -> Result<DeployedContract, DeploymentFailure> {
        let primary_error = match self.submit(sender, contract, primary_gas_limit).await {
            Ok(deployed) => return Ok(deployed),
            Err(err) => err,
        };

        tracing::warn!(
            contract = %contract.name,
            gas_limit = primary_gas_limit,
            error = ?primary_error,
            "Deployment failed, retrying with the block gas limit"
        );

        match self.submit(sender, contract, fallback_gas_limit).await {
            Ok(deployed) => Ok(DeployedContract {
                used_fallback_gas_limit: true,
                ..deployed
            }),
            Err(fallback_error) => {
                tracing::error!(
                    contract = %contract.name,
                    gas_limit = fallback_gas_limit,
                    error = ?fallback_error,
                    "Deployment failed with the block gas limit"
                );
                Err(DeploymentFailure {
                    contract: contract.name.clone(),
                    primary_gas_limit,
                    primary_error: format!("{:#}", primary_error),
                    fallback_gas_limit,
                    fallback_error: format!("{:#}", fallback_error),
                })
            }
        }
    }

    async fn submit(
        &self,
        sender: Address,
        contract: &CompiledContract,
        gas_limit: u64,
    ) -> anyhow::Result<DeployedContract> {
        let tx = TransactionRequest::create(sender, contract.bytecode.clone(), gas_limit);

        let hash = self
            .rpc
            .send_transaction(&tx)
            .await
            .context("Transaction rejected")?;

        tracing::debug!(
            contract = %contract.name,
            tx_hash = %hash,
            gas_limit,
            "Deployment submitted"
        );

        let receipt = wait_for_receipt(
            &self.rpc,
            hash,
            self.config.receipt_poll_attempts,
            Duration::from_millis(self.config.receipt_poll_interval_ms),
        )
        .await?;

        if !receipt.succeeded() {
            anyhow::bail!("Transaction {} reverted", hash);
        }

        let address = receipt
            .contract_address
            .with_context(|| format!("Receipt of {} carries no contract address", hash))?;

        tracing::info!(
            contract = %contract.name,
            %address,
            gas_used = receipt.gas_used,
            "Contract deployed"
        );

        Ok(DeployedContract {
            name: contract.name.clone(),
            address,
            abi: contract.abi.clone(),
            transaction_hash: receipt.transaction_hash,
            gas_used: receipt.gas_used,
            used_fallback_gas_limit: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, compiled};

    fn engine(chain: &FakeChain) -> DeploymentEngine<FakeChain> {
        DeploymentEngine::new(
            chain.clone(),
            DeploymentConfig {
                receipt_poll_attempts: 2,
                receipt_poll_interval_ms: 1,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_primary_gas_limit() {
        let config = DeploymentConfig::default();
        assert_eq!(config.primary_gas_limit(8_000_000), 6_400_000);
        assert_eq!(config.primary_gas_limit(30_000_001), 24_000_000);

        assert!(config.validate().is_ok());
        for fraction in [0.0, -0.5, 1.5, f64::NAN] {
            let config = DeploymentConfig {
                gas_limit_fraction: fraction,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[tokio::test]
    async fn test_deploys_in_order_with_primary_gas_limit() {
        let chain = FakeChain::default();
        let report = engine(&chain)
            .deploy_all(&[compiled("A"), compiled("B")])
            .await
            .unwrap();

        assert_eq!(report.order(), ["A", "B"]);
        assert_eq!(report.failures().count(), 0);
        assert!(report.deployed().all(|c| !c.used_fallback_gas_limit));

        let sent = chain.sent_transactions();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|tx| tx.gas == Some(6_400_000)));
        assert!(sent.iter().all(|tx| tx.to.is_none()));
    }

    #[tokio::test]
    async fn test_falls_back_to_block_gas_limit() {
        let chain = FakeChain::default().reject_deploy_below("A", 7_000_000);
        let report = engine(&chain).deploy_all(&[compiled("A")]).await.unwrap();

        let deployed: Vec<_> = report.deployed().collect();
        assert_eq!(deployed.len(), 1);
        assert!(deployed[0].used_fallback_gas_limit);

        let gas: Vec<_> = chain.sent_transactions().iter().map(|tx| tx.gas).collect();
        assert_eq!(gas, vec![Some(6_400_000), Some(8_000_000)]);
    }

    #[tokio::test]
    async fn test_reverted_deployment_is_retried() {
        let chain = FakeChain::default().revert_deploy("A");
        let report = engine(&chain)
            .deploy_all(&[compiled("A"), compiled("B")])
            .await
            .unwrap();

        let failure = report.failures().next().unwrap();
        assert_eq!(failure.contract, "A");
        assert_eq!(failure.primary_gas_limit, 6_400_000);
        assert_eq!(failure.fallback_gas_limit, 8_000_000);
        assert!(failure.fallback_error.contains("reverted"));

        // The sibling still deploys.
        assert!(matches!(report.get("B"), Some(Ok(_))));
        assert_eq!(chain.sent_transactions().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let chain = FakeChain::default().reject_deploy("B");
        let report = engine(&chain)
            .deploy_all(&[compiled("A"), compiled("B"), compiled("C")])
            .await
            .unwrap();

        let (deployed, failures) = report.into_parts();
        let names: Vec<_> = deployed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["A", "C"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].contract, "B");
    }

    #[tokio::test]
    async fn test_setup_failures() {
        let chain = FakeChain::default().with_accounts(vec![]);
        let err = engine(&chain).deploy_all(&[compiled("A")]).await.unwrap_err();
        assert!(matches!(err, DeploymentSetupError::NoSender { .. }));
        assert!(chain.sent_transactions().is_empty());

        let chain = FakeChain::default().without_latest_block();
        let err = engine(&chain).deploy_all(&[compiled("A")]).await.unwrap_err();
        assert!(matches!(err, DeploymentSetupError::GasLimit { .. }));
    }
}
