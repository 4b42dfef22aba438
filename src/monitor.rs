//! # Chain Monitor
//!
//! Per-chain driver of the detection pipeline: polls the chain height once
//! a second, walks new blocks strictly in ascending order, filters
//! router-bound transactions, and runs receipt → classification → profit
//! reconstruction → persistence → tracker → broadcast for each hit.
//!
//! Every failure below the tick level is absorbed: a bad transaction skips
//! to the next transaction, a bad block ends the inner loop so the next
//! tick retries from the first unprocessed height. Restart safety comes
//! from the `(chain_id, tx_hash)` uniqueness in storage, not from any
//! in-process dedup.

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Transaction, U64};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::TransactionAnalyzer;
use crate::config::ChainConfig;
use crate::connector::ChainRpc;
use crate::database::Persistence;
use crate::errors::ConnectorError;
use crate::hub::BroadcastHub;
use crate::metrics;
use crate::profit::{GasCost, ProfitCalculator};
use crate::tracker::ArbitrageurTracker;
use crate::types::{format_tx_hash, normalize_address, ArbitrageTransaction, Strategy};

pub struct ChainMonitor {
    config: ChainConfig,
    routers: HashSet<ethers::types::Address>,
    rpc: Arc<dyn ChainRpc>,
    analyzer: TransactionAnalyzer,
    profit: ProfitCalculator,
    persistence: Arc<dyn Persistence>,
    tracker: ArbitrageurTracker,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
}

impl ChainMonitor {
    pub fn new(
        config: ChainConfig,
        rpc: Arc<dyn ChainRpc>,
        analyzer: TransactionAnalyzer,
        profit: ProfitCalculator,
        persistence: Arc<dyn Persistence>,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> Self {
        let routers = config.router_set();
        let tracker = ArbitrageurTracker::new(persistence.clone());
        Self {
            config,
            routers,
            rpc,
            analyzer,
            profit,
            persistence,
            tracker,
            hub,
            cancel,
        }
    }

    /// Polling loop. The first observed tip is recorded as already synced;
    /// processing starts at the next height.
    pub async fn run(self) {
        let poll_interval = Duration::from_secs_f64(self.config.poll_interval_secs);

        let mut synced = loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.rpc.latest_height().await {
                Ok(height) => break height,
                Err(e) => {
                    error!(
                        target: "chain_monitor",
                        chain = %self.config.chain_name,
                        err = %e,
                        "Failed to read initial chain height, retrying"
                    );
                    sleep(poll_interval).await;
                }
            }
        };

        info!(
            target: "chain_monitor",
            chain = %self.config.chain_name,
            chain_id = self.config.chain_id,
            synced,
            "Chain monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(poll_interval) => {}
            }

            let tip = match self.rpc.latest_height().await {
                Ok(tip) => tip,
                Err(e) => {
                    error!(
                        target: "chain_monitor",
                        chain = %self.config.chain_name,
                        err = %e,
                        "Height poll failed"
                    );
                    continue;
                }
            };

            if tip <= synced {
                metrics::BLOCKS_BEHIND
                    .with_label_values(&[&self.config.chain_name])
                    .set(0);
                continue;
            }

            metrics::BLOCKS_BEHIND
                .with_label_values(&[&self.config.chain_name])
                .set((tip - synced) as i64);
            debug!(
                target: "chain_monitor",
                chain = %self.config.chain_name,
                synced,
                tip,
                blocks_behind = tip - synced,
                "New blocks detected"
            );

            for height in (synced + 1)..=tip {
                if self.cancel.is_cancelled() {
                    break;
                }
                match self.process_block(height).await {
                    Ok(()) => synced = height,
                    Err(e) => {
                        error!(
                            target: "chain_monitor",
                            chain = %self.config.chain_name,
                            block = height,
                            err = %e,
                            "Block processing failed, retrying next tick"
                        );
                        break;
                    }
                }
            }

            if let Err(e) = self
                .persistence
                .update_chain_sync(self.config.chain_id, synced, (tip.saturating_sub(synced)) as i64)
                .await
            {
                debug!(
                    target: "chain_monitor",
                    chain = %self.config.chain_name,
                    err = %e,
                    "Chain sync bookkeeping failed"
                );
            }
        }

        info!(
            target: "chain_monitor",
            chain = %self.config.chain_name,
            "Chain monitor stopped"
        );
    }

    /// Fetch one block with full transactions and run every router-bound
    /// transaction through the pipeline.
    pub async fn process_block(&self, height: u64) -> Result<(), ConnectorError> {
        let block = self
            .rpc
            .block_with_txs(height)
            .await?
            .ok_or_else(|| ConnectorError::Provider(format!("block {} not yet available", height)))?;

        let block_timestamp = Utc
            .timestamp_opt(block.timestamp.as_u64() as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);

        debug!(
            target: "chain_monitor",
            chain = %self.config.chain_name,
            block = height,
            transactions = block.transactions.len(),
            "Processing block"
        );

        for tx in &block.transactions {
            if self.cancel.is_cancelled() {
                break;
            }
            let to = match tx.to {
                Some(to) => to,
                None => continue,
            };
            if !self.routers.contains(&to) {
                continue;
            }
            self.process_transaction(tx, height, block_timestamp).await;
        }

        Ok(())
    }

    /// Run one router-bound transaction through classify → decode →
    /// profit → persist → track → broadcast. Absorbs every error: one bad
    /// transaction never halts the block.
    pub async fn process_transaction(
        &self,
        tx: &Transaction,
        height: u64,
        block_timestamp: DateTime<Utc>,
    ) {
        let tx_hash = format_tx_hash(&tx.hash);

        let receipt = match self.rpc.receipt(tx.hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                debug!(
                    target: "chain_monitor",
                    chain = %self.config.chain_name,
                    tx_hash = %tx_hash,
                    "Receipt not available yet"
                );
                return;
            }
            Err(e) => {
                warn!(
                    target: "chain_monitor",
                    chain = %self.config.chain_name,
                    tx_hash = %tx_hash,
                    err = %e,
                    "Receipt fetch failed"
                );
                return;
            }
        };

        if !self.analyzer.is_arbitrage(&receipt, tx) {
            return;
        }

        let swaps = self.analyzer.parse_swap_events(&receipt);
        if swaps.len() < 2 {
            warn!(
                target: "chain_monitor",
                chain = %self.config.chain_name,
                tx_hash = %tx_hash,
                swap_count = swaps.len(),
                "Classified arbitrage decoded to fewer than two swaps, skipping"
            );
            return;
        }

        let profit_data = match self.profit.calculate(&swaps, &receipt).await {
            Ok(profit_data) => profit_data,
            Err(e) => {
                error!(
                    target: "chain_monitor",
                    chain = %self.config.chain_name,
                    tx_hash = %tx_hash,
                    err = %e,
                    "Profit reconstruction failed, skipping"
                );
                return;
            }
        };

        let swap_count = swaps.len() as u32;
        let pools_involved: Vec<String> = swaps
            .iter()
            .map(|swap| normalize_address(&swap.pool_address))
            .collect();
        let gas = profit_data
            .as_ref()
            .map(|p| p.gas_cost.clone())
            .unwrap_or_else(GasCost::zero);

        let mut record = ArbitrageTransaction {
            id: None,
            chain_id: self.config.chain_id,
            tx_hash: tx_hash.clone(),
            from_address: normalize_address(&tx.from),
            block_number: tx.block_number.unwrap_or(U64::from(height)).as_u64(),
            block_timestamp,
            gas_price_gwei: gas.gas_price_gwei,
            gas_used: gas.gas_used,
            gas_cost_native: gas.gas_cost_native,
            gas_cost_usd: gas.gas_cost_usd,
            swap_count,
            strategy: Strategy::from_swap_count(swap_count),
            profit_gross_usd: profit_data.as_ref().map(|p| p.gross_profit_usd),
            profit_net_usd: profit_data.as_ref().map(|p| p.net_profit_usd),
            pools_involved,
            tokens_involved: Vec::new(),
            detected_at: Utc::now(),
        };

        match self.persistence.save_transaction(&record).await {
            Ok(id) => record.id = Some(id),
            Err(e) => {
                error!(
                    target: "chain_monitor",
                    chain = %self.config.chain_name,
                    tx_hash = %tx_hash,
                    err = %e,
                    "Failed to persist transaction, skipping"
                );
                return;
            }
        }

        let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
        if let Err(e) = self.tracker.record(&record, success).await {
            error!(
                target: "chain_monitor",
                chain = %self.config.chain_name,
                tx_hash = %tx_hash,
                err = %e,
                "Arbitrageur update failed, skipping"
            );
            return;
        }

        self.hub.publish_transaction(&record);

        metrics::TRANSACTIONS_DETECTED
            .with_label_values(&[&self.config.chain_name])
            .inc();
        info!(
            target: "chain_monitor",
            chain = %self.config.chain_name,
            tx_hash = %tx_hash,
            block = record.block_number,
            from = %record.from_address,
            swap_count,
            strategy = %record.strategy,
            profit_net_usd = ?record.profit_net_usd,
            "Arbitrage transaction processed"
        );

        // A transaction through these pools plausibly realized any
        // still-open imbalance detected on them recently.
        let min_block = record
            .block_number
            .saturating_sub(self.config.capture_window_blocks);
        if let Err(e) = self
            .persistence
            .mark_opportunities_captured(
                self.config.chain_id,
                &record.pools_involved,
                min_block,
                &record.from_address,
                &record.tx_hash,
            )
            .await
        {
            debug!(
                target: "chain_monitor",
                chain = %self.config.chain_name,
                tx_hash = %tx_hash,
                err = %e,
                "Capture marking failed"
            );
        }
    }
}
