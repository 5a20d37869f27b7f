//! Command builder for local chain backends.

use crate::{error::LaunchError, process::CommandLine};

use super::BackendKind;

/// Builder for chain backend commands.
#[derive(Debug, Clone)]
pub struct NodeCmdBuilder {
    kind: BackendKind,
    host: String,
    port: u16,
    chain_id: Option<u64>,
    accounts: u32,
    balance_ether: u64,
    gas_limit: u64,
    mnemonic: Option<String>,
    custom_command: Vec<String>,
    extra_args: Vec<String>,
}

impl NodeCmdBuilder {
    /// Create a new builder for the given backend kind.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            host: "127.0.0.1".to_string(),
            port: 8545,
            chain_id: None,
            accounts: 10,
            balance_ether: 1000,
            gas_limit: 8_000_000,
            mnemonic: None,
            custom_command: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    /// Set the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the chain ID.
    pub fn chain_id(mut self, chain_id: Option<u64>) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Set the number of pre-funded accounts.
    pub fn accounts(mut self, accounts: u32) -> Self {
        self.accounts = accounts;
        self
    }

    /// Set the balance of each pre-funded account, in ether.
    pub fn balance_ether(mut self, balance: u64) -> Self {
        self.balance_ether = balance;
        self
    }

    /// Set the block gas limit.
    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Set the mnemonic used to derive the pre-funded accounts.
    pub fn mnemonic(mut self, mnemonic: Option<String>) -> Self {
        self.mnemonic = mnemonic;
        self
    }

    /// Set the full command line of a custom backend.
    pub fn custom_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.custom_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Add extra arguments.
    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the command line.
    pub fn build(self) -> Result<CommandLine, LaunchError> {
        let mut cmd = match self.kind {
            BackendKind::Anvil => {
                let mut cmd = CommandLine::new("anvil").args([
                    "--host".to_string(),
                    self.host,
                    "--port".to_string(),
                    self.port.to_string(),
                    "--accounts".to_string(),
                    self.accounts.to_string(),
                    "--balance".to_string(),
                    self.balance_ether.to_string(),
                    "--gas-limit".to_string(),
                    self.gas_limit.to_string(),
                ]);
                if let Some(chain_id) = self.chain_id {
                    cmd = cmd.args(["--chain-id".to_string(), chain_id.to_string()]);
                }
                if let Some(mnemonic) = self.mnemonic {
                    cmd = cmd.args(["--mnemonic".to_string(), mnemonic]);
                }
                cmd
            }
            // Accounts, balances and mnemonic come from hardhat.config.
            BackendKind::Hardhat => CommandLine::new("npx").args([
                "hardhat".to_string(),
                "node".to_string(),
                "--hostname".to_string(),
                self.host,
                "--port".to_string(),
                self.port.to_string(),
            ]),
            BackendKind::Ganache => {
                let mut cmd = CommandLine::new("ganache-cli").args([
                    "--host".to_string(),
                    self.host,
                    "--port".to_string(),
                    self.port.to_string(),
                    "--accounts".to_string(),
                    self.accounts.to_string(),
                    "--gasLimit".to_string(),
                    self.gas_limit.to_string(),
                    "--defaultBalanceEther".to_string(),
                    self.balance_ether.to_string(),
                ]);
                if let Some(chain_id) = self.chain_id {
                    cmd = cmd.args(["--chainId".to_string(), chain_id.to_string()]);
                }
                if let Some(mnemonic) = self.mnemonic {
                    cmd = cmd.args(["--mnemonic".to_string(), mnemonic]);
                }
                cmd
            }
            BackendKind::Custom => CommandLine::from_parts(self.custom_command)?,
        };

        cmd.args.extend(self.extra_args);

        Ok(cmd)
    }
}
