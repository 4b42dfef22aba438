//! # Arbitrageur Tracker
//!
//! Turns each detected transaction into a per-address statistics update.
//! The success flag follows the receipt's `status` field; profit
//! contributions are clamped at zero so cumulative totals never go
//! negative. The atomic, row-locked upsert itself lives in the
//! persistence gateway.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::database::Persistence;
use crate::errors::PersistenceError;
use crate::types::{ArbitrageTransaction, Strategy};

/// One transaction's contribution to an arbitrageur profile.
#[derive(Debug, Clone)]
pub struct ArbitrageurObservation {
    pub address: String,
    pub chain_id: u64,
    /// Receipt `status == 1`, never "net profit > 0".
    pub success: bool,
    /// Clamped at zero; null profit contributes nothing.
    pub profit_contribution_usd: Decimal,
    pub gas_cost_usd: Decimal,
    pub gas_price_gwei: Decimal,
    pub strategy: Strategy,
}

impl ArbitrageurObservation {
    pub fn from_transaction(tx: &ArbitrageTransaction, success: bool) -> Self {
        Self {
            address: tx.from_address.clone(),
            chain_id: tx.chain_id,
            success,
            profit_contribution_usd: tx
                .profit_net_usd
                .unwrap_or(Decimal::ZERO)
                .max(Decimal::ZERO),
            gas_cost_usd: tx.gas_cost_usd,
            gas_price_gwei: tx.gas_price_gwei,
            strategy: tx.strategy,
        }
    }
}

/// Updates per-address cumulative statistics on each detected transaction.
pub struct ArbitrageurTracker {
    persistence: Arc<dyn Persistence>,
}

impl ArbitrageurTracker {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    pub async fn record(
        &self,
        tx: &ArbitrageTransaction,
        success: bool,
    ) -> Result<(), PersistenceError> {
        let observation = ArbitrageurObservation::from_transaction(tx, success);
        debug!(
            target: "tracker",
            chain = observation.chain_id,
            address = %observation.address,
            success = observation.success,
            strategy = %observation.strategy,
            "Recording arbitrageur observation"
        );
        self.persistence.upsert_arbitrageur(&observation).await
    }
}

//================================================================================================//
//                                       UPSERT HELPERS                                          //
//================================================================================================//

/// Running mean over `prev_count + 1` samples.
pub fn running_mean(prev_mean: Decimal, prev_count: i64, sample: Decimal) -> Decimal {
    if prev_count <= 0 {
        return sample;
    }
    let count = Decimal::from(prev_count);
    (prev_mean * count + sample) / (count + Decimal::ONE)
}

/// Increment the strategy-count map held in the arbitrageur row.
pub fn bump_strategy_count(counts: &mut Value, strategy: Strategy) {
    if !counts.is_object() {
        *counts = Value::Object(serde_json::Map::new());
    }
    let map = counts.as_object_mut().expect("just ensured object");
    let entry = map
        .entry(strategy.as_str().to_string())
        .or_insert(Value::from(0i64));
    let next = entry.as_i64().unwrap_or(0) + 1;
    *entry = Value::from(next);
}

/// Argmax over the observed strategy counts. Ties resolve to the
/// lexicographically smallest label so re-running the upsert is
/// deterministic.
pub fn preferred_strategy(counts: &Value) -> Option<Strategy> {
    let map = counts.as_object()?;
    let mut best: Option<(&str, i64)> = None;
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        let count = map.get(key).and_then(Value::as_i64).unwrap_or(0);
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((key, count)),
        }
    }
    best.and_then(|(key, _)| Strategy::from_str(key).ok())
}
