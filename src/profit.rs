//! # Profit Calculator
//!
//! Reconstructs the economics of a detected arbitrage: token flow through
//! the swap sequence, gas cost, gross and net profit, ROI. All monetary
//! math is `Decimal`; raw token amounts stay on `U256` until the final
//! conversion.

use ethers::types::{TransactionReceipt, U256};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::NativePriceFeed;
use crate::errors::AnalyzerError;
use crate::types::{u256_to_decimal, wei_to_gwei, wei_to_native, SwapEvent};

/// Token flow through an ordered swap sequence: what went in at the first
/// hop and what came out at the last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFlow {
    pub input_amount: U256,
    pub output_amount: U256,
    /// 0 or 1: which reserve slot of the first pool supplied the input.
    pub input_token_index: u8,
    /// 0 or 1: which reserve slot of the last pool produced the output.
    pub output_token_index: u8,
}

/// Gas accounting for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasCost {
    pub gas_used: u64,
    pub gas_price_wei: U256,
    pub gas_price_gwei: Decimal,
    pub gas_cost_native: Decimal,
    pub gas_cost_usd: Decimal,
}

impl GasCost {
    pub fn zero() -> Self {
        Self {
            gas_used: 0,
            gas_price_wei: U256::zero(),
            gas_price_gwei: Decimal::ZERO,
            gas_cost_native: Decimal::ZERO,
            gas_cost_usd: Decimal::ZERO,
        }
    }
}

/// Complete profit reconstruction for one arbitrage transaction.
#[derive(Debug, Clone)]
pub struct ProfitData {
    /// Signed: gas-subsidized bundles show real losses.
    pub gross_profit_native: Decimal,
    pub gross_profit_usd: Decimal,
    pub gas_cost: GasCost,
    pub net_profit_native: Decimal,
    pub net_profit_usd: Decimal,
    /// Omitted when the input amount is zero.
    pub roi_pct: Option<Decimal>,
    pub input_amount: Decimal,
    pub output_amount: Decimal,
}

/// Per-chain profit calculator fed by the hot-swappable native price.
pub struct ProfitCalculator {
    chain_name: String,
    price_feed: Arc<NativePriceFeed>,
}

impl ProfitCalculator {
    pub fn new(chain_name: impl Into<String>, price_feed: Arc<NativePriceFeed>) -> Self {
        Self {
            chain_name: chain_name.into(),
            price_feed,
        }
    }

    /// Input from the first swap's non-zero `amountN_in`, output from the
    /// last swap's non-zero `amountN_out`. Returns `None` when either side
    /// cannot be determined; the caller records the transaction anyway,
    /// with null profit fields.
    pub fn extract_token_flow(&self, swaps: &[SwapEvent]) -> Option<TokenFlow> {
        let first = swaps.first()?;
        let last = swaps.last()?;

        let (input_amount, input_token_index) = if !first.amount0_in.is_zero() {
            (first.amount0_in, 0u8)
        } else if !first.amount1_in.is_zero() {
            (first.amount1_in, 1u8)
        } else {
            warn!(
                target: "profit",
                chain = %self.chain_name,
                pool = ?first.pool_address,
                log_index = first.log_index,
                "First swap has no input amount"
            );
            return None;
        };

        let (output_amount, output_token_index) = if !last.amount0_out.is_zero() {
            (last.amount0_out, 0u8)
        } else if !last.amount1_out.is_zero() {
            (last.amount1_out, 1u8)
        } else {
            warn!(
                target: "profit",
                chain = %self.chain_name,
                pool = ?last.pool_address,
                log_index = last.log_index,
                "Last swap has no output amount"
            );
            return None;
        };

        Some(TokenFlow {
            input_amount,
            output_amount,
            input_token_index,
            output_token_index,
        })
    }

    /// Gas cost in wei, native units (wei / 10^18) and USD.
    pub async fn gas_cost(
        &self,
        gas_used: U256,
        effective_gas_price: U256,
    ) -> Result<GasCost, AnalyzerError> {
        let gas_cost_wei = gas_used
            .checked_mul(effective_gas_price)
            .ok_or_else(|| AnalyzerError::NumericOverflow("gas cost in wei".to_string()))?;
        let gas_cost_native = wei_to_native(gas_cost_wei)?;
        let gas_price_gwei = wei_to_gwei(effective_gas_price)?;
        let native_usd = self.price_feed.get().await;

        Ok(GasCost {
            gas_used: gas_used.as_u64(),
            gas_price_wei: effective_gas_price,
            gas_price_gwei,
            gas_cost_native,
            gas_cost_usd: gas_cost_native * native_usd,
        })
    }

    /// Full profit reconstruction for one transaction.
    ///
    /// `Ok(None)` means the token flow was indeterminate (the transaction
    /// still gets recorded, with null profit). A swap sequence shorter
    /// than two entries is a classification bug upstream and comes back as
    /// an error so the caller can skip persisting.
    ///
    /// Swap amounts are carried as-is; only the gas leg is converted from
    /// wei. Per-token decimal scaling is a future parameter.
    pub async fn calculate(
        &self,
        swaps: &[SwapEvent],
        receipt: &TransactionReceipt,
    ) -> Result<Option<ProfitData>, AnalyzerError> {
        if swaps.len() < 2 {
            return Err(AnalyzerError::InvariantViolation(format!(
                "profit calculation requires >= 2 swaps, got {}",
                swaps.len()
            )));
        }

        let flow = match self.extract_token_flow(swaps) {
            Some(flow) => flow,
            None => return Ok(None),
        };

        let input = u256_to_decimal(flow.input_amount)?;
        let output = u256_to_decimal(flow.output_amount)?;
        let native_usd = self.price_feed.get().await;

        let gross_profit_native = output - input;
        let gross_profit_usd = gross_profit_native * native_usd;

        let gas_used = receipt.gas_used.unwrap_or_default();
        let effective_gas_price = receipt.effective_gas_price.unwrap_or_default();
        let gas_cost = self.gas_cost(gas_used, effective_gas_price).await?;

        let net_profit_native = gross_profit_native - gas_cost.gas_cost_native;
        let net_profit_usd = gross_profit_usd - gas_cost.gas_cost_usd;

        let roi_pct = if input > Decimal::ZERO {
            Some(net_profit_native / input * Decimal::from(100))
        } else {
            None
        };

        debug!(
            target: "profit",
            chain = %self.chain_name,
            gross_usd = %gross_profit_usd,
            gas_usd = %gas_cost.gas_cost_usd,
            net_usd = %net_profit_usd,
            swap_count = swaps.len(),
            "Profit calculated"
        );

        Ok(Some(ProfitData {
            gross_profit_native,
            gross_profit_usd,
            gas_cost,
            net_profit_native,
            net_profit_usd,
            roi_pct,
            input_amount: input,
            output_amount: output,
        }))
    }
}
