//! In-memory fakes of the RPC and compiler seams.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, B256, Bytes},
};

use crate::{
    compiler::{CompiledContract, Compiler, ContractSource},
    error::CompilationError,
    rpc::{BlockHeader, ChainRpc, TransactionReceipt, TransactionRequest},
};

/// Bytecode the fakes use for contract `name`.
pub(crate) fn fake_bytecode(name: &str) -> Bytes {
    Bytes::from(name.as_bytes().to_vec())
}

pub(crate) fn fake_abi() -> JsonAbi {
    serde_json::from_value(serde_json::json!([
        { "type": "constructor", "inputs": [], "stateMutability": "nonpayable" }
    ]))
    .unwrap()
}

pub(crate) fn compiled(name: &str) -> CompiledContract {
    CompiledContract {
        name: name.to_string(),
        source: format!("{}.sol", name),
        bytecode: fake_bytecode(name),
        abi: fake_abi(),
    }
}

#[derive(Debug, Clone, Copy)]
enum DeployRule {
    Reject,
    RejectBelow(u64),
    Revert,
}

#[derive(Debug)]
struct ChainState {
    reachable: bool,
    accounts: Vec<Address>,
    gas_limit: u64,
    latest_block: bool,
    rules: HashMap<Bytes, DeployRule>,
    sent: Vec<TransactionRequest>,
    receipts: HashMap<B256, TransactionReceipt>,
    call_result: Bytes,
    block_number_calls: usize,
    nonce: u8,
}

/// A chain answering from memory. Clones share state.
#[derive(Debug, Clone)]
pub(crate) struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                reachable: true,
                accounts: vec![Address::with_last_byte(0xd0)],
                gas_limit: 8_000_000,
                latest_block: true,
                rules: HashMap::new(),
                sent: Vec::new(),
                receipts: HashMap::new(),
                call_result: Bytes::new(),
                block_number_calls: 0,
                nonce: 0,
            })),
        }
    }
}

impl FakeChain {
    pub(crate) fn unreachable() -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().reachable = false;
        chain
    }

    pub(crate) fn with_accounts(self, accounts: Vec<Address>) -> Self {
        self.state.lock().unwrap().accounts = accounts;
        self
    }

    pub(crate) fn without_latest_block(self) -> Self {
        self.state.lock().unwrap().latest_block = false;
        self
    }

    pub(crate) fn with_call_result(self, result: Bytes) -> Self {
        self.state.lock().unwrap().call_result = result;
        self
    }

    /// Every deployment of `contract` is rejected.
    pub(crate) fn reject_deploy(self, contract: &str) -> Self {
        self.rule(contract, DeployRule::Reject)
    }

    /// Deployments of `contract` with less than `min_gas` are rejected.
    pub(crate) fn reject_deploy_below(self, contract: &str, min_gas: u64) -> Self {
        self.rule(contract, DeployRule::RejectBelow(min_gas))
    }

    /// Deployments of `contract` are mined but revert.
    pub(crate) fn revert_deploy(self, contract: &str) -> Self {
        self.rule(contract, DeployRule::Revert)
    }

    fn rule(self, contract: &str, rule: DeployRule) -> Self {
        self.state
            .lock()
            .unwrap()
            .rules
            .insert(fake_bytecode(contract), rule);
        self
    }

    pub(crate) fn block_number_calls(&self) -> usize {
        self.state.lock().unwrap().block_number_calls
    }

    pub(crate) fn sent_transactions(&self) -> Vec<TransactionRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Contract-creation transactions sent so far.
    pub(crate) fn deployments(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|tx| tx.to.is_none())
            .count()
    }

    fn ensure_reachable(state: &ChainState) -> anyhow::Result<()> {
        if state.reachable {
            Ok(())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

impl ChainRpc for FakeChain {
    fn endpoint(&self) -> &str {
        "http://fake-chain/"
    }

    async fn chain_id(&self) -> anyhow::Result<u64> {
        Self::ensure_reachable(&self.state.lock().unwrap())?;
        Ok(31337)
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.block_number_calls += 1;
        Self::ensure_reachable(&state)?;
        Ok(state.nonce as u64)
    }

    async fn accounts(&self) -> anyhow::Result<Vec<Address>> {
        let state = self.state.lock().unwrap();
        Self::ensure_reachable(&state)?;
        Ok(state.accounts.clone())
    }

    async fn latest_block(&self) -> anyhow::Result<BlockHeader> {
        let state = self.state.lock().unwrap();
        Self::ensure_reachable(&state)?;
        if !state.latest_block {
            anyhow::bail!("header not found");
        }
        Ok(BlockHeader {
            number: state.nonce as u64,
            gas_limit: state.gas_limit,
            timestamp: 1_700_000_000,
        })
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> anyhow::Result<B256> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_reachable(&state)?;
        state.sent.push(tx.clone());

        let rule = match tx.to {
            None => state.rules.get(&tx.data).copied(),
            Some(_) => None,
        };
        match rule {
            Some(DeployRule::Reject) => anyhow::bail!("rejected"),
            Some(DeployRule::RejectBelow(min_gas)) if tx.gas.unwrap_or_default() < min_gas => {
                anyhow::bail!("out of gas")
            }
            _ => {}
        }

        state.nonce += 1;
        let hash = B256::with_last_byte(state.nonce);
        let reverted = matches!(rule, Some(DeployRule::Revert));
        let contract_address = (tx.to.is_none() && !reverted)
            .then(|| Address::with_last_byte(state.nonce));

        state.receipts.insert(
            hash,
            TransactionReceipt {
                transaction_hash: hash,
                contract_address,
                gas_used: 21_000,
                status: Some(if reverted { 0 } else { 1 }),
            },
        );

        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<TransactionReceipt>> {
        let state = self.state.lock().unwrap();
        Self::ensure_reachable(&state)?;
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn call(&self, _tx: &TransactionRequest) -> anyhow::Result<Bytes> {
        let state = self.state.lock().unwrap();
        Self::ensure_reachable(&state)?;
        Ok(state.call_result.clone())
    }
}

/// A compiler producing [`compiled`] artifacts, failing on demand.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeCompiler {
    failing: HashSet<String>,
    compiled: Arc<Mutex<Vec<String>>>,
}

impl FakeCompiler {
    pub(crate) fn failing(mut self, contract: &str) -> Self {
        self.failing.insert(contract.to_string());
        self
    }

    /// Names passed to [`Compiler::compile`], in order.
    pub(crate) fn compiled(&self) -> Vec<String> {
        self.compiled.lock().unwrap().clone()
    }
}

impl Compiler for FakeCompiler {
    async fn compile(&self, source: &ContractSource) -> Result<CompiledContract, CompilationError> {
        self.compiled.lock().unwrap().push(source.name.clone());
        if self.failing.contains(&source.name) {
            return Err(CompilationError::new(
                &source.name,
                anyhow::anyhow!("ParserError: Expected ';'"),
            ));
        }
        Ok(compiled(&source.name))
    }
}
