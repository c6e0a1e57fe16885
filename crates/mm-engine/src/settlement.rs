//! On-chain settlement: merging round-tripped inventory back to
//! collateral and redeeming resolved positions.
//!
//! Both operations go through the conditional-tokens contract (or the
//! negative-risk adapter for markets flagged that way) with fallback
//! RPC rotation and bounded confirmation waits. Redemption is queued:
//! expired markets hand their inventory to the manager, which polls
//! resolution on a timer and abandons entries after an hour.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::LocalSigner;
use alloy::sol;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::market::PendingRedeem;

/// Collateral token (USDC on Polygon).
const USDC_ADDRESS: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";

/// Conditional Tokens Framework on Polygon.
const CTF_ADDRESS: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";

/// Negative-risk adapter on Polygon.
const NEG_RISK_ADAPTER_ADDRESS: &str = "0xd91E80cF2E7be2e162c6513ceD06f1dD0dA35296";

/// Hard cap on waiting for a transaction receipt.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Pending redeems older than this are dropped with a warning.
const ABANDON_AFTER: chrono::Duration = chrono::Duration::minutes(60);

/// Collateral uses 6 decimals.
const COLLATERAL_DECIMALS: u32 = 6;

sol! {
    #[sol(rpc)]
    contract ConditionalTokens {
        function redeemPositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] calldata indexSets
        ) external;

        function mergePositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] calldata partition,
            uint256 amount
        ) external;

        function payoutDenominator(bytes32 conditionId) external view returns (uint256);
    }

    #[sol(rpc)]
    contract NegRiskAdapter {
        function redeemPositions(bytes32 conditionId, uint256[] calldata amounts) external;

        function mergePositions(bytes32 conditionId, uint256 amount) external;
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("invalid condition id '{0}'")]
    InvalidConditionId(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("all RPC endpoints failed, last error: {0}")]
    AllEndpointsFailed(String),

    #[error("transaction confirmation timed out")]
    ConfirmationTimeout,
}

/// Result of a settlement transaction attempt.
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl TxOutcome {
    fn ok(tx_hash: String) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            error: Some(error.into()),
        }
    }
}

/// Blockchain settlement contract.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn is_resolved(&self, condition_id: &str) -> Result<bool, SettlementError>;

    /// Redeem held outcome tokens of a resolved condition.
    async fn redeem(
        &self,
        condition_id: &str,
        neg_risk: bool,
        amount: Decimal,
    ) -> Result<TxOutcome, SettlementError>;

    /// Merge `amount` matched YES+NO pairs back to collateral.
    async fn merge(
        &self,
        condition_id: &str,
        neg_risk: bool,
        amount: Decimal,
    ) -> Result<TxOutcome, SettlementError>;
}

fn parse_condition_id(condition_id: &str) -> Result<B256, SettlementError> {
    B256::from_str(condition_id)
        .map_err(|_| SettlementError::InvalidConditionId(condition_id.to_string()))
}

fn to_collateral_units(amount: Decimal) -> U256 {
    let scaled = (amount * Decimal::from(10u64.pow(COLLATERAL_DECIMALS))).trunc();
    U256::from(scaled.to_u128().unwrap_or(0))
}

/// Settlement client over alloy with fallback RPC rotation.
pub struct AlloyChainClient {
    private_key: String,
    rpc_endpoints: Vec<String>,
    current_endpoint: AtomicUsize,
    usdc: Address,
    ctf: Address,
    neg_risk_adapter: Address,
}

impl AlloyChainClient {
    pub fn new(private_key: String, rpc_endpoints: Vec<String>) -> Result<Self, SettlementError> {
        let key = private_key.strip_prefix("0x").unwrap_or(&private_key);
        LocalSigner::from_str(key).map_err(|e| SettlementError::InvalidKey(e.to_string()))?;
        if rpc_endpoints.is_empty() {
            return Err(SettlementError::AllEndpointsFailed(
                "no RPC endpoints configured".to_string(),
            ));
        }

        let usdc = USDC_ADDRESS
            .parse()
            .map_err(|_| SettlementError::InvalidKey("bad USDC address".to_string()))?;
        let ctf = CTF_ADDRESS
            .parse()
            .map_err(|_| SettlementError::InvalidKey("bad CTF address".to_string()))?;
        let neg_risk_adapter = NEG_RISK_ADAPTER_ADDRESS
            .parse()
            .map_err(|_| SettlementError::InvalidKey("bad adapter address".to_string()))?;

        Ok(Self {
            private_key,
            rpc_endpoints,
            current_endpoint: AtomicUsize::new(0),
            usdc,
            ctf,
            neg_risk_adapter,
        })
    }

    fn signer(&self) -> Result<LocalSigner<alloy::signers::k256::ecdsa::SigningKey>, SettlementError> {
        let key = self.private_key.strip_prefix("0x").unwrap_or(&self.private_key);
        LocalSigner::from_str(key).map_err(|e| SettlementError::InvalidKey(e.to_string()))
    }

    fn endpoint(&self) -> &str {
        let idx = self.current_endpoint.load(Ordering::Relaxed) % self.rpc_endpoints.len();
        &self.rpc_endpoints[idx]
    }

    /// Rotate to the next endpoint after a rate-limit or network error.
    fn rotate_endpoint(&self) {
        let next = (self.current_endpoint.load(Ordering::Relaxed) + 1) % self.rpc_endpoints.len();
        self.current_endpoint.store(next, Ordering::Relaxed);
        debug!(endpoint = self.endpoint(), "rotated to fallback RPC endpoint");
    }

    /// Run `op` against the current endpoint, rotating through fallbacks
    /// on failure.
    async fn with_endpoints<T, F, Fut>(&self, mut op: F) -> Result<T, SettlementError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let mut last_err = String::new();
        for _ in 0..self.rpc_endpoints.len() {
            let url = self.endpoint().to_string();
            match op(url).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(error = %e, "RPC call failed, rotating endpoint");
                    last_err = e;
                    self.rotate_endpoint();
                }
            }
        }
        Err(SettlementError::AllEndpointsFailed(last_err))
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn is_resolved(&self, condition_id: &str) -> Result<bool, SettlementError> {
        let condition = parse_condition_id(condition_id)?;
        let ctf = self.ctf;

        self.with_endpoints(|url| async move {
            let provider = ProviderBuilder::new()
                .connect(&url)
                .await
                .map_err(|e| e.to_string())?;
            let contract = ConditionalTokens::new(ctf, &provider);
            let denominator = contract
                .payoutDenominator(condition)
                .call()
                .await
                .map_err(|e| e.to_string())?;
            Ok(denominator > U256::ZERO)
        })
        .await
    }

    async fn redeem(
        &self,
        condition_id: &str,
        neg_risk: bool,
        amount: Decimal,
    ) -> Result<TxOutcome, SettlementError> {
        let condition = parse_condition_id(condition_id)?;
        let signer = self.signer()?;
        let usdc = self.usdc;
        let ctf = self.ctf;
        let adapter = self.neg_risk_adapter;
        let units = to_collateral_units(amount);

        let outcome = self
            .with_endpoints(|url| {
                let signer = signer.clone();
                async move {
                    let provider = ProviderBuilder::new()
                        .wallet(signer)
                        .connect(&url)
                        .await
                        .map_err(|e| e.to_string())?;

                    let pending = if neg_risk {
                        let contract = NegRiskAdapter::new(adapter, &provider);
                        contract
                            .redeemPositions(condition, vec![units, units])
                            .send()
                            .await
                            .map_err(|e| e.to_string())?
                    } else {
                        let contract = ConditionalTokens::new(ctf, &provider);
                        contract
                            .redeemPositions(
                                usdc,
                                B256::ZERO,
                                condition,
                                vec![U256::from(1u64), U256::from(2u64)],
                            )
                            .send()
                            .await
                            .map_err(|e| e.to_string())?
                    };

                    let tx_hash = format!("0x{}", hex::encode(pending.tx_hash()));
                    let receipt = timeout(CONFIRMATION_TIMEOUT, pending.get_receipt())
                        .await
                        .map_err(|_| "confirmation timeout".to_string())?
                        .map_err(|e| e.to_string())?;

                    if receipt.status() {
                        Ok(TxOutcome::ok(tx_hash))
                    } else {
                        Ok(TxOutcome::failed(format!("reverted: {tx_hash}")))
                    }
                }
            })
            .await?;

        if outcome.success {
            info!(condition = condition_id, tx = ?outcome.tx_hash, "redeem confirmed");
        }
        Ok(outcome)
    }

    async fn merge(
        &self,
        condition_id: &str,
        neg_risk: bool,
        amount: Decimal,
    ) -> Result<TxOutcome, SettlementError> {
        let condition = parse_condition_id(condition_id)?;
        let signer = self.signer()?;
        let usdc = self.usdc;
        let ctf = self.ctf;
        let adapter = self.neg_risk_adapter;
        let units = to_collateral_units(amount);

        let outcome = self
            .with_endpoints(|url| {
                let signer = signer.clone();
                async move {
                    let provider = ProviderBuilder::new()
                        .wallet(signer)
                        .connect(&url)
                        .await
                        .map_err(|e| e.to_string())?;

                    let pending = if neg_risk {
                        let contract = NegRiskAdapter::new(adapter, &provider);
                        contract
                            .mergePositions(condition, units)
                            .send()
                            .await
                            .map_err(|e| e.to_string())?
                    } else {
                        let contract = ConditionalTokens::new(ctf, &provider);
                        contract
                            .mergePositions(
                                usdc,
                                B256::ZERO,
                                condition,
                                vec![U256::from(1u64), U256::from(2u64)],
                                units,
                            )
                            .send()
                            .await
                            .map_err(|e| e.to_string())?
                    };

                    let tx_hash = format!("0x{}", hex::encode(pending.tx_hash()));
                    let receipt = timeout(CONFIRMATION_TIMEOUT, pending.get_receipt())
                        .await
                        .map_err(|_| "confirmation timeout".to_string())?
                        .map_err(|e| e.to_string())?;

                    if receipt.status() {
                        Ok(TxOutcome::ok(tx_hash))
                    } else {
                        Ok(TxOutcome::failed(format!("reverted: {tx_hash}")))
                    }
                }
            })
            .await?;

        if outcome.success {
            info!(condition = condition_id, amount = %amount, tx = ?outcome.tx_hash, "merge confirmed");
        }
        Ok(outcome)
    }
}

/// Owns the pending-redeem queue and drives settlement on the engine's
/// redeem timer.
pub struct SettlementManager {
    chain: std::sync::Arc<dyn ChainClient>,
    pending: Vec<PendingRedeem>,
}

impl SettlementManager {
    pub fn new(chain: std::sync::Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            pending: Vec::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue expired-market inventory for redemption. Idempotent per
    /// market.
    pub fn queue_redeem(&mut self, redeem: PendingRedeem) {
        if self.pending.iter().any(|p| p.market_id == redeem.market_id) {
            return;
        }
        info!(market = %redeem.market_id, "queued for redemption");
        self.pending.push(redeem);
    }

    /// Merge matched YES+NO inventory back to collateral.
    pub async fn merge(
        &self,
        condition_id: &str,
        neg_risk: bool,
        amount: Decimal,
    ) -> Result<TxOutcome, SettlementError> {
        self.chain.merge(condition_id, neg_risk, amount).await
    }

    /// One redemption pass: drop abandoned entries, redeem resolved
    /// ones, keep the rest for the next tick.
    pub async fn poll_redeems(&mut self, now: DateTime<Utc>) {
        let mut keep = Vec::with_capacity(self.pending.len());

        for entry in self.pending.drain(..) {
            if now - entry.added_at > ABANDON_AFTER {
                warn!(
                    market = %entry.market_id,
                    age_min = (now - entry.added_at).num_minutes(),
                    "abandoning unresolved redeem"
                );
                continue;
            }

            match self.chain.is_resolved(&entry.market_id).await {
                Ok(true) => {
                    match self
                        .chain
                        .redeem(&entry.market_id, entry.neg_risk, Decimal::ZERO)
                        .await
                    {
                        Ok(outcome) if outcome.success => {
                            info!(market = %entry.market_id, tx = ?outcome.tx_hash, "redeemed");
                        }
                        Ok(outcome) => {
                            warn!(
                                market = %entry.market_id,
                                error = ?outcome.error,
                                "redeem failed, will retry"
                            );
                            keep.push(entry);
                        }
                        Err(e) => {
                            warn!(market = %entry.market_id, "redeem errored, will retry: {e}");
                            keep.push(entry);
                        }
                    }
                }
                Ok(false) => keep.push(entry),
                Err(e) => {
                    warn!(market = %entry.market_id, "resolution check failed, will retry: {e}");
                    keep.push(entry);
                }
            }
        }

        self.pending = keep;
    }
}
