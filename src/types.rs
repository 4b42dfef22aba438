//! # Core Domain Types
//!
//! Shared records flowing between the detectors, the persistence gateway
//! and the broadcast hub, plus the numeric conversion helpers that keep
//! monetary math on `Decimal` and raw token amounts on `U256`.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::AnalyzerError;

//================================================================================================//
//                                      ADDRESS HANDLING                                          //
//================================================================================================//

/// Canonical storage/comparison form: lowercase, 0x-prefixed, 20 bytes.
pub fn normalize_address(addr: &Address) -> String {
    format!("{:#x}", addr)
}

/// Canonical form for a transaction hash.
pub fn format_tx_hash(hash: &H256) -> String {
    format!("{:#x}", hash)
}

//================================================================================================//
//                                     NUMERIC CONVERSIONS                                        //
//================================================================================================//

/// Convert a `U256` base-unit amount to `Decimal` without going through
/// floats. Fails only when the value exceeds `Decimal`'s 96-bit mantissa,
/// which no real pool reserve or swap amount reaches.
pub fn u256_to_decimal(value: U256) -> Result<Decimal, AnalyzerError> {
    Decimal::from_str(&value.to_string()).map_err(|_| {
        AnalyzerError::NumericOverflow(format!("{} exceeds decimal range", value))
    })
}

/// Convert a `U256` amount into a `Decimal` scaled down by `10^scale`,
/// computed with exact integer div/rem so no precision is lost on the
/// fractional part.
pub fn u256_to_decimal_scaled(value: U256, scale: u32) -> Result<Decimal, AnalyzerError> {
    let divisor = U256::exp10(scale as usize);
    let whole = value / divisor;
    let frac = value % divisor;
    let whole_dec = Decimal::from_str(&whole.to_string()).map_err(|_| {
        AnalyzerError::NumericOverflow(format!("{} exceeds decimal range at scale {}", value, scale))
    })?;
    // frac < 10^scale, which fits i128 for every scale used here (<= 18)
    let frac_dec = Decimal::from_i128_with_scale(frac.as_u128() as i128, scale);
    Ok(whole_dec + frac_dec)
}

/// Wei to native units (18 decimals).
pub fn wei_to_native(value: U256) -> Result<Decimal, AnalyzerError> {
    u256_to_decimal_scaled(value, 18)
}

/// Wei to gwei (9 decimals).
pub fn wei_to_gwei(value: U256) -> Result<Decimal, AnalyzerError> {
    u256_to_decimal_scaled(value, 9)
}

//================================================================================================//
//                                          STRATEGY                                              //
//================================================================================================//

/// Hop-count bucket for a detected arbitrage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "2-hop")]
    TwoHop,
    #[serde(rename = "3-hop")]
    ThreeHop,
    #[serde(rename = "4-hop")]
    FourHop,
    #[serde(rename = "N-hop")]
    MultiHop,
}

impl Strategy {
    pub fn from_swap_count(swap_count: u32) -> Self {
        match swap_count {
            2 => Strategy::TwoHop,
            3 => Strategy::ThreeHop,
            4 => Strategy::FourHop,
            _ => Strategy::MultiHop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::TwoHop => "2-hop",
            Strategy::ThreeHop => "3-hop",
            Strategy::FourHop => "4-hop",
            Strategy::MultiHop => "N-hop",
        }
    }
}

impl FromStr for Strategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2-hop" => Ok(Strategy::TwoHop),
            "3-hop" => Ok(Strategy::ThreeHop),
            "4-hop" => Ok(Strategy::FourHop),
            "N-hop" => Ok(Strategy::MultiHop),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//================================================================================================//
//                                       EVENT RECORDS                                            //
//================================================================================================//

/// A single decoded Uniswap-V2-style Swap log entry. Transient: lives only
/// between the analyzer and the profit calculator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEvent {
    pub pool_address: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
    /// Intra-receipt ordering key.
    pub log_index: u64,
}

/// A detected pool-imbalance opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    /// Assigned by the persistence gateway on insert.
    pub id: Option<i64>,
    pub chain_id: u64,
    pub pool_label: String,
    pub pool_address: String,
    pub imbalance_pct: Decimal,
    pub profit_usd: Decimal,
    pub profit_native: Decimal,
    /// Token base units.
    pub reserve0: Decimal,
    pub reserve1: Decimal,
    pub block_number: u64,
    pub detected_at: DateTime<Utc>,
    pub captured: bool,
    pub captured_by: Option<String>,
    pub capture_tx_hash: Option<String>,
}

/// A confirmed multi-hop arbitrage transaction. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageTransaction {
    pub id: Option<i64>,
    pub chain_id: u64,
    pub tx_hash: String,
    pub from_address: String,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub gas_price_gwei: Decimal,
    pub gas_used: u64,
    pub gas_cost_native: Decimal,
    pub gas_cost_usd: Decimal,
    pub swap_count: u32,
    pub strategy: Strategy,
    /// Null when the token flow could not be determined.
    pub profit_gross_usd: Option<Decimal>,
    pub profit_net_usd: Option<Decimal>,
    /// One entry per swap, in log order. Duplicates preserved.
    pub pools_involved: Vec<String>,
    pub tokens_involved: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Cumulative per-address statistics, upserted on every detected transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arbitrageur {
    pub address: String,
    pub chain_id: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_transactions: i64,
    pub successful_transactions: i64,
    pub failed_transactions: i64,
    pub total_profit_usd: Decimal,
    pub total_gas_spent_usd: Decimal,
    pub avg_gas_price_gwei: Decimal,
    pub preferred_strategy: Option<Strategy>,
}

/// One hourly aggregation bucket per chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStat {
    pub chain_id: u64,
    pub hour_timestamp: DateTime<Utc>,
    pub opportunities_detected: i64,
    pub opportunities_captured: i64,
    pub small_opportunities_count: i64,
    pub small_opps_captured: i64,
    pub transactions_detected: i64,
    pub unique_arbitrageurs: i64,
    pub total_profit_usd: Decimal,
    pub total_gas_spent_usd: Decimal,
    pub avg_profit_usd: Option<Decimal>,
    pub median_profit_usd: Option<Decimal>,
    pub min_profit_usd: Option<Decimal>,
    pub max_profit_usd: Option<Decimal>,
    pub p95_profit_usd: Option<Decimal>,
    pub capture_rate: Option<Decimal>,
    pub small_opp_capture_rate: Option<Decimal>,
    pub avg_competition_level: Option<Decimal>,
}

//================================================================================================//
//                                       QUERY FILTERS                                            //
//================================================================================================//

/// Filters for historical opportunity queries (adapter surface over C9).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpportunityFilters {
    pub chain_id: Option<u64>,
    pub min_profit: Option<Decimal>,
    pub max_profit: Option<Decimal>,
    pub captured: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filters for historical transaction queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionFilters {
    pub chain_id: Option<u64>,
    pub from_address: Option<String>,
    pub min_profit: Option<Decimal>,
    pub max_profit: Option<Decimal>,
    pub min_swaps: Option<u32>,
    pub strategy: Option<Strategy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filters for arbitrageur leaderboard queries.
#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrageurFilters {
    pub chain_id: Option<u64>,
    pub min_transactions: Option<i64>,
    pub sort_by: String,
    pub descending: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Default for ArbitrageurFilters {
    fn default() -> Self {
        Self {
            chain_id: None,
            min_transactions: None,
            sort_by: "total_profit_usd".to_string(),
            descending: true,
            limit: None,
            offset: None,
        }
    }
}
