//! Readiness probing of the chain backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ReadinessError, rpc::ChainRpc};

/// How far a probe got into the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum ReadinessLevel {
    /// No answer to `eth_blockNumber`.
    Unreachable,
    /// `eth_blockNumber` answers.
    RpcResponsive,
    /// `eth_accounts` lists at least one node-managed account.
    AccountsFunded,
    /// The latest block can be fetched.
    BlockQueryable,
}

/// Bounded polling schedule of [`ReadinessProber::wait_ready`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            delay_ms: 1_000,
        }
    }
}

impl ReadinessConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Polls the backend until it answers and, for pre-funding backends, exposes an account
/// and its latest block.
#[derive(Debug, Clone)]
pub struct ReadinessProber<R> {
    rpc: R,
    requires_funded_accounts: bool,
}

impl<R: ChainRpc> ReadinessProber<R> {
    pub fn new(rpc: R, requires_funded_accounts: bool) -> Self {
        Self {
            rpc,
            requires_funded_accounts,
        }
    }

    /// The level a probe must reach for the backend to be ready.
    pub fn target_level(&self) -> ReadinessLevel {
        if self.requires_funded_accounts {
            ReadinessLevel::BlockQueryable
        } else {
            ReadinessLevel::RpcResponsive
        }
    }

    /// Run a single probe.
    pub async fn probe(&self) -> ReadinessLevel {
        self.probe_with_cause().await.0
    }

    /// Run a single probe, keeping the error that stopped it below
    /// [`ReadinessLevel::BlockQueryable`].
    async fn probe_with_cause(&self) -> (ReadinessLevel, Option<anyhow::Error>) {
        let block_number = match self.rpc.block_number().await {
            Ok(number) => number,
            Err(err) => {
                tracing::trace!(
                    endpoint = self.rpc.endpoint(),
                    error = %err,
                    "eth_blockNumber failed"
                );
                return (
                    ReadinessLevel::Unreachable,
                    Some(err.context("eth_blockNumber failed")),
                );
            }
        };

        if !self.requires_funded_accounts {
            return (ReadinessLevel::RpcResponsive, None);
        }

        match self.rpc.accounts().await {
            Ok(accounts) if !accounts.is_empty() => {}
            Ok(_) => {
                return (
                    ReadinessLevel::RpcResponsive,
                    Some(anyhow::anyhow!("eth_accounts returned no accounts")),
                );
            }
            Err(err) => {
                tracing::trace!(error = %err, "eth_accounts failed");
                return (
                    ReadinessLevel::RpcResponsive,
                    Some(err.context("eth_accounts failed")),
                );
            }
        }

        match self.rpc.latest_block().await {
            Ok(block) => {
                tracing::trace!(block_number, latest = block.number, "Latest block fetched");
                (ReadinessLevel::BlockQueryable, None)
            }
            Err(err) => {
                tracing::trace!(error = %err, "eth_getBlockByNumber failed");
                (
                    ReadinessLevel::AccountsFunded,
                    Some(err.context("eth_getBlockByNumber failed")),
                )
            }
        }
    }

    /// Probe up to `max_attempts` times, `delay` apart. No sleep follows the last attempt.
    pub async fn wait_ready(&self, max_attempts: u32, delay: Duration) -> bool {
        self.wait_until_ready(max_attempts, delay).await.is_ok()
    }

    /// Like [`Self::wait_ready`], returning the level reached on success and the outcome of
    /// the last probe on failure.
    pub async fn wait_until_ready(
        &self,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<ReadinessLevel, ReadinessError> {
        let target = self.target_level();
        let mut last = ReadinessError {
            level: ReadinessLevel::Unreachable,
            source: anyhow::anyhow!("no readiness probe was attempted"),
        };

        for attempt in 1..=max_attempts {
            let (level, cause) = self.probe_with_cause().await;

            if level >= target {
                tracing::info!(
                    endpoint = self.rpc.endpoint(),
                    attempt,
                    %level,
                    "Chain backend is ready"
                );
                return Ok(level);
            }

            tracing::debug!(
                endpoint = self.rpc.endpoint(),
                attempt,
                max_attempts,
                %level,
                "Chain backend not ready yet"
            );
            last = ReadinessError {
                level,
                source: cause.unwrap_or_else(|| anyhow::anyhow!("probe stopped at {}", level)),
            };

            if attempt < max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::warn!(
            endpoint = self.rpc.endpoint(),
            max_attempts,
            level = %last.level,
            error = %last.source,
            "Chain backend did not become ready"
        );
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::Address;

    use super::*;
    use crate::testing::FakeChain;

    #[tokio::test]
    async fn test_never_ready_stops_after_max_attempts() {
        let chain = FakeChain::unreachable();
        let prober = ReadinessProber::new(chain.clone(), true);

        assert!(!prober.wait_ready(3, Duration::ZERO).await);
        assert_eq!(chain.block_number_calls(), 3);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_probe_error() {
        let prober = ReadinessProber::new(FakeChain::unreachable(), true);

        let err = prober.wait_until_ready(2, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.level, ReadinessLevel::Unreachable);
        assert!(format!("{:#}", err.source).contains("connection refused"));

        let chain = FakeChain::default().with_accounts(vec![]);
        let err = ReadinessProber::new(chain, true)
            .wait_until_ready(1, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.level, ReadinessLevel::RpcResponsive);
        assert!(err.source.to_string().contains("no accounts"));
    }

    #[tokio::test]
    async fn test_zero_attempts_never_probes() {
        let chain = FakeChain::default();
        let prober = ReadinessProber::new(chain.clone(), true);

        assert!(!prober.wait_ready(0, Duration::ZERO).await);
        assert_eq!(chain.block_number_calls(), 0);
    }

    #[tokio::test]
    async fn test_ready_on_first_probe() {
        let chain = FakeChain::default();
        let prober = ReadinessProber::new(chain.clone(), true);

        assert!(prober.wait_ready(5, Duration::from_secs(60)).await);
        assert_eq!(chain.block_number_calls(), 1);
    }

    #[tokio::test]
    async fn test_levels() {
        let chain = FakeChain::default().with_accounts(vec![]);
        let prober = ReadinessProber::new(chain.clone(), true);
        assert_eq!(prober.probe().await, ReadinessLevel::RpcResponsive);

        // Without pre-funded accounts, answering RPC is enough.
        let relaxed = ReadinessProber::new(chain.clone(), false);
        assert!(relaxed.wait_ready(1, Duration::ZERO).await);

        let chain = FakeChain::default()
            .with_accounts(vec![Address::with_last_byte(1)])
            .without_latest_block();
        let prober = ReadinessProber::new(chain, true);
        assert_eq!(prober.probe().await, ReadinessLevel::AccountsFunded);
        assert!(!prober.wait_ready(2, Duration::ZERO).await);
    }
}
