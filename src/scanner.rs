//! # Pool Scanner
//!
//! Periodically samples `getReserves()` on the configured constant-product
//! pools, computes the deviation from the balanced `(√k, √k)` point and
//! emits an opportunity whenever the imbalance clears the chain's
//! threshold. A failed pool read logs and moves on; it never aborts the
//! tick.

use chrono::Utc;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::connector::ChainRpc;
use crate::database::Persistence;
use crate::errors::ConnectorError;
use crate::hub::BroadcastHub;
use crate::metrics;
use crate::types::{normalize_address, u256_to_decimal, Opportunity};

//================================================================================================//
//                                         CONSTANTS                                             //
//================================================================================================//

lazy_static! {
    /// Selector for `getReserves()`.
    static ref GET_RESERVES_SELECTOR: Bytes = {
        hex::decode("0902f1ac")
            .map(Bytes::from)
            .expect("Invalid selector for getReserves()")
    };
}

/// `√k` is computed on `k` scaled by 10^12, giving six fractional digits.
const SQRT_SCALE: u64 = 1_000_000_000_000;
/// Imbalance ratios are carried with 8 fractional digits.
const RATIO_SCALE: u64 = 100_000_000;
/// Stablecoin heuristic: token1 assumed 18-decimal for the USD estimate.
const STABLE_DECIMALS: u32 = 18;

//================================================================================================//
//                                           TYPES                                               //
//================================================================================================//

/// Raw `getReserves()` answer for one pool.
#[derive(Debug, Clone)]
pub struct PoolReserves {
    pub pool_address: Address,
    pub pool_label: String,
    pub reserve0: U256,
    pub reserve1: U256,
    pub block_timestamp_last: u32,
}

/// Constant-product imbalance measurement.
#[derive(Debug, Clone)]
pub struct ImbalanceData {
    pub imbalance_pct: Decimal,
    pub profit_native: Decimal,
    pub profit_usd: Decimal,
}

//================================================================================================//
//                                        IMBALANCE MATH                                         //
//================================================================================================//

/// Floor integer square root (Newton's method) on U256.
fn isqrt(value: U256) -> U256 {
    if value.is_zero() {
        return U256::zero();
    }
    let mut x = value;
    let mut y = (x + U256::one()) >> 1;
    while y < x {
        x = y;
        y = (x + value / x) >> 1;
    }
    x
}

/// Deviation of `reserve` from the balanced point, as a fraction scaled by
/// `RATIO_SCALE`. Both inputs carry the same sqrt scaling so it cancels.
fn deviation_ratio(reserve_scaled: U256, optimal_scaled: U256) -> U256 {
    let diff = if reserve_scaled > optimal_scaled {
        reserve_scaled - optimal_scaled
    } else {
        optimal_scaled - reserve_scaled
    };
    diff * U256::from(RATIO_SCALE) / optimal_scaled
}

/// Compute the CPMM imbalance of a pool and its profit potential.
///
/// `k = reserve0 × reserve1`, `optimal = √k`,
/// `imbalance = max(|r0 − optimal|, |r1 − optimal|) / optimal × 100`.
/// Profit potential is `max(0, imbalance/100 − fee) × min(r0, r1)` in base
/// units; the USD figure assumes token1 is an 18-decimal stablecoin.
///
/// Returns `None` when either reserve is zero.
pub fn calculate_imbalance(reserve0: U256, reserve1: U256, fee: Decimal) -> Option<ImbalanceData> {
    if reserve0.is_zero() || reserve1.is_zero() {
        return None;
    }

    let k = reserve0.checked_mul(reserve1)?;
    let sqrt_scale = U256::from(SQRT_SCALE);
    // √(10^12) = 10^6: the factor reserves must carry to compare against √(k·10^12).
    let reserve_scale = U256::from(1_000_000u64);

    // Scale k by 10^12 before the sqrt when it fits, for six fractional
    // digits of √k; at magnitudes where that would overflow the raw sqrt
    // is already precise beyond Decimal's resolution.
    let (optimal_scaled, r0_scaled, r1_scaled) = if k <= U256::MAX / sqrt_scale {
        (
            isqrt(k * sqrt_scale),
            reserve0 * reserve_scale,
            reserve1 * reserve_scale,
        )
    } else {
        (isqrt(k), reserve0, reserve1)
    };

    let ratio0 = deviation_ratio(r0_scaled, optimal_scaled);
    let ratio1 = deviation_ratio(r1_scaled, optimal_scaled);
    let max_ratio = ratio0.max(ratio1);

    // ratio <= max(r0/r1, r1/r0)^(1/2)-ish; fits i128 for uint112 reserves.
    let imbalance_fraction =
        Decimal::from_i128_with_scale(max_ratio.as_u128() as i128, 8);
    let imbalance_pct = imbalance_fraction * Decimal::from(100);

    let min_reserve = u256_to_decimal(reserve0.min(reserve1)).ok()?;
    let profit_fraction = (imbalance_fraction - fee).max(Decimal::ZERO);
    let profit_native = profit_fraction * min_reserve;
    let profit_usd = profit_native / Decimal::from(10u64.pow(STABLE_DECIMALS));

    Some(ImbalanceData {
        imbalance_pct,
        profit_native,
        profit_usd,
    })
}

//================================================================================================//
//                                          SCANNER                                              //
//================================================================================================//

/// Periodic reserve sampler for one chain.
pub struct PoolScanner {
    config: ChainConfig,
    rpc: Arc<dyn ChainRpc>,
    persistence: Arc<dyn Persistence>,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
}

impl PoolScanner {
    pub fn new(
        config: ChainConfig,
        rpc: Arc<dyn ChainRpc>,
        persistence: Arc<dyn Persistence>,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            rpc,
            persistence,
            hub,
            cancel,
        }
    }

    /// Fetch and decode `getReserves()` for one pool.
    pub async fn read_reserves(
        &self,
        pool_label: &str,
        pool_address: Address,
    ) -> Result<PoolReserves, ConnectorError> {
        let raw = self
            .rpc
            .call(pool_address, GET_RESERVES_SELECTOR.clone())
            .await?;

        let tokens = abi::decode(
            &[
                ParamType::Uint(112),
                ParamType::Uint(112),
                ParamType::Uint(32),
            ],
            &raw,
        )
        .map_err(|e| ConnectorError::Decode(format!("getReserves: {}", e)))?;

        let uint_at = |i: usize| -> Result<U256, ConnectorError> {
            match tokens.get(i) {
                Some(Token::Uint(v)) => Ok(*v),
                other => Err(ConnectorError::Decode(format!(
                    "getReserves slot {}: unexpected token {:?}",
                    i, other
                ))),
            }
        };

        Ok(PoolReserves {
            pool_address,
            pool_label: pool_label.to_string(),
            reserve0: uint_at(0)?,
            reserve1: uint_at(1)?,
            block_timestamp_last: uint_at(2)?.as_u32(),
        })
    }

    /// One full pass over the chain's pools. Returns the opportunities
    /// emitted this tick.
    pub async fn scan_once(&self) -> Vec<Opportunity> {
        let mut emitted = Vec::new();

        let block_number = match self.rpc.latest_height().await {
            Ok(height) => height,
            Err(e) => {
                error!(
                    target: "pool_scanner",
                    chain = %self.config.chain_name,
                    err = %e,
                    "Failed to read chain height, skipping tick"
                );
                return emitted;
            }
        };

        for (pool_label, pool_address) in &self.config.pools {
            if self.cancel.is_cancelled() {
                break;
            }

            let reserves = match self.read_reserves(pool_label, *pool_address).await {
                Ok(reserves) => reserves,
                Err(e) => {
                    warn!(
                        target: "pool_scanner",
                        chain = %self.config.chain_name,
                        pool = %pool_label,
                        err = %e,
                        "Reserve read failed"
                    );
                    continue;
                }
            };

            let imbalance = match calculate_imbalance(
                reserves.reserve0,
                reserves.reserve1,
                self.config.swap_fee,
            ) {
                Some(data) => data,
                None => {
                    debug!(
                        target: "pool_scanner",
                        chain = %self.config.chain_name,
                        pool = %pool_label,
                        "Zero reserve, skipping pool"
                    );
                    continue;
                }
            };

            if imbalance.imbalance_pct < self.config.imbalance_threshold_pct {
                continue;
            }

            let (reserve0, reserve1) = match (
                u256_to_decimal(reserves.reserve0),
                u256_to_decimal(reserves.reserve1),
            ) {
                (Ok(r0), Ok(r1)) => (r0, r1),
                _ => {
                    warn!(
                        target: "pool_scanner",
                        chain = %self.config.chain_name,
                        pool = %pool_label,
                        "Reserves exceed numeric range, skipping pool"
                    );
                    continue;
                }
            };

            let mut opportunity = Opportunity {
                id: None,
                chain_id: self.config.chain_id,
                pool_label: pool_label.clone(),
                pool_address: normalize_address(pool_address),
                imbalance_pct: imbalance.imbalance_pct,
                profit_usd: imbalance.profit_usd,
                profit_native: imbalance.profit_native,
                reserve0,
                reserve1,
                block_number,
                detected_at: Utc::now(),
                captured: false,
                captured_by: None,
                capture_tx_hash: None,
            };

            let is_small = self.is_small_opportunity(opportunity.profit_usd);
            metrics::OPPORTUNITIES_DETECTED
                .with_label_values(&[&self.config.chain_name])
                .inc();
            if is_small {
                metrics::SMALL_OPPORTUNITIES_DETECTED
                    .with_label_values(&[&self.config.chain_name])
                    .inc();
            }

            info!(
                target: "pool_scanner",
                chain = %self.config.chain_name,
                pool = %pool_label,
                block = block_number,
                imbalance_pct = %opportunity.imbalance_pct,
                profit_usd = %opportunity.profit_usd,
                small = is_small,
                "Opportunity detected"
            );

            match self.persistence.save_opportunity(&opportunity).await {
                Ok(id) => opportunity.id = Some(id),
                Err(e) => {
                    error!(
                        target: "pool_scanner",
                        chain = %self.config.chain_name,
                        pool = %pool_label,
                        err = %e,
                        "Failed to persist opportunity"
                    );
                }
            }

            self.hub.publish_opportunity(&opportunity);
            emitted.push(opportunity);
        }

        emitted
    }

    /// Whether an opportunity falls inside the configured small band.
    pub fn is_small_opportunity(&self, profit_usd: Decimal) -> bool {
        profit_usd >= self.config.small_opp_min_usd && profit_usd <= self.config.small_opp_max_usd
    }

    /// Scan loop: sequential tick over all pools, then sleep until the next
    /// interval or shutdown.
    pub async fn run(self) {
        let interval = Duration::from_secs_f64(self.config.scan_interval_secs);
        info!(
            target: "pool_scanner",
            chain = %self.config.chain_name,
            pools = self.config.pools.len(),
            interval_secs = self.config.scan_interval_secs,
            threshold_pct = %self.config.imbalance_threshold_pct,
            "Pool scanner started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = async {
                    self.scan_once().await;
                    sleep(interval).await;
                } => {}
            }
        }

        info!(
            target: "pool_scanner",
            chain = %self.config.chain_name,
            "Pool scanner stopped"
        );
    }
}
