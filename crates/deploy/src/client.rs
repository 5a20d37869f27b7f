//! Client for calling deployed contracts.

use std::{collections::BTreeMap, time::Duration};

use alloy_core::{
    dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt},
    json_abi::{Function, JsonAbi},
    primitives::{Address, Bytes},
};
use anyhow::Context;

use crate::{
    registry::RegistrySnapshot,
    rpc::{ChainRpc, TransactionReceipt, TransactionRequest, wait_for_receipt},
};

const DEFAULT_RECEIPT_POLL_ATTEMPTS: usize = 60;
const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A contract known to the client.
#[derive(Debug, Clone)]
struct BoundContract {
    address: Address,
    abi: JsonAbi,
}

/// Calls contracts listed in a registry snapshot.
#[derive(Debug, Clone)]
pub struct ContractClient<R> {
    rpc: R,
    sender: Option<Address>,
    contracts: BTreeMap<String, BoundContract>,
    receipt_poll_attempts: usize,
    receipt_poll_interval: Duration,
}

impl<R: ChainRpc> ContractClient<R> {
    /// Bind every usable entry of `snapshot`. Entries whose address or ABI cannot be parsed
    /// are skipped with a warning.
    pub fn from_snapshot(rpc: R, snapshot: &RegistrySnapshot) -> Self {
        let contracts = snapshot
            .contracts
            .iter()
            .filter_map(|(name, entry)| {
                let bound = entry
                    .parse_address()
                    .and_then(|address| Ok(BoundContract { address, abi: entry.parse_abi()? }));
                match bound {
                    Ok(bound) => Some((name.clone(), bound)),
                    Err(err) => {
                        tracing::warn!(
                            contract = %name,
                            error = ?err,
                            "Registry entry not callable, skipping"
                        );
                        None
                    }
                }
            })
            .collect();

        Self {
            rpc,
            sender: None,
            contracts,
            receipt_poll_attempts: DEFAULT_RECEIPT_POLL_ATTEMPTS,
            receipt_poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
        }
    }

    /// Send transactions from `sender` instead of the first node-managed account.
    pub fn with_sender(mut self, sender: Address) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_receipt_polling(mut self, attempts: usize, interval: Duration) -> Self {
        self.receipt_poll_attempts = attempts;
        self.receipt_poll_interval = interval;
        self
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    /// Names of the callable contracts.
    pub fn contracts(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    pub fn address(&self, contract: &str) -> Option<Address> {
        self.contracts.get(contract).map(|c| c.address)
    }

    /// Resolve `function` on `contract`, picking the overload taking `arg_count` inputs.
    fn resolve(
        &self,
        contract: &str,
        function: &str,
        arg_count: usize,
    ) -> anyhow::Result<(Address, &Function)> {
        let bound = self
            .contracts
            .get(contract)
            .with_context(|| format!("Unknown contract {}", contract))?;

        let function = bound
            .abi
            .function(function)
            .with_context(|| format!("{} has no function {}", contract, function))?
            .iter()
            .find(|f| f.inputs.len() == arg_count)
            .with_context(|| {
                format!(
                    "{}.{} has no overload taking {} arguments",
                    contract, function, arg_count
                )
            })?;

        Ok((bound.address, function))
    }

    async fn sender(&self) -> anyhow::Result<Address> {
        if let Some(sender) = self.sender {
            return Ok(sender);
        }
        self.rpc
            .accounts()
            .await?
            .first()
            .copied()
            .with_context(|| format!("{} exposes no account to send from", self.rpc.endpoint()))
    }

    /// Read-only call through `eth_call`.
    pub async fn call(
        &self,
        contract: &str,
        function: &str,
        args: &[DynSolValue],
    ) -> anyhow::Result<Vec<DynSolValue>> {
        let (to, abi_function) = self.resolve(contract, function, args.len())?;
        let data = abi_function
            .abi_encode_input(args)
            .with_context(|| format!("Failed to encode arguments of {}.{}", contract, function))?;

        let from = self.sender.unwrap_or(Address::ZERO);
        let output = self
            .rpc
            .call(&TransactionRequest::call(from, to, Bytes::from(data)))
            .await
            .with_context(|| format!("Call to {}.{} failed", contract, function))?;

        abi_function
            .abi_decode_output(&output, true)
            .with_context(|| format!("Failed to decode output of {}.{}", contract, function))
    }

    /// State-changing call. Waits for the receipt and fails if the transaction reverted.
    pub async fn send(
        &self,
        contract: &str,
        function: &str,
        args: &[DynSolValue],
    ) -> anyhow::Result<TransactionReceipt> {
        let (to, abi_function) = self.resolve(contract, function, args.len())?;
        let data = abi_function
            .abi_encode_input(args)
            .with_context(|| format!("Failed to encode arguments of {}.{}", contract, function))?;

        let from = self.sender().await?;
        let hash = self
            .rpc
            .send_transaction(&TransactionRequest::call(from, to, Bytes::from(data)))
            .await
            .with_context(|| format!("Transaction to {}.{} rejected", contract, function))?;

        tracing::debug!(contract, function, tx_hash = %hash, "Transaction submitted");

        let receipt = wait_for_receipt(
            &self.rpc,
            hash,
            self.receipt_poll_attempts,
            self.receipt_poll_interval,
        )
        .await?;

        if !receipt.succeeded() {
            anyhow::bail!("Transaction {} to {}.{} reverted", hash, contract, function);
        }

        Ok(receipt)
    }
}
