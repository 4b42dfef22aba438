//! Shared fixtures for the pipeline integration tests: a programmable
//! in-memory `ChainRpc`, an in-memory `Persistence` and builders for
//! receipts, swap logs and router transactions.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{
    Address, Block, Bytes, Log, Transaction, TransactionReceipt, H256, U256, U64,
};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use arbmon::aggregator::{OpportunityCounts, TransactionHourStats};
use arbmon::analyzer::SWAP_EVENT_TOPIC;
use arbmon::circuit_breaker::CircuitBreakerStats;
use arbmon::config::ChainConfig;
use arbmon::connector::ChainRpc;
use arbmon::database::Persistence;
use arbmon::errors::{ConnectorError, PersistenceError};
use arbmon::tracker::ArbitrageurObservation;
use arbmon::types::{ArbitrageTransaction, ChainStat, Opportunity};

pub const ROUTER: &str = "0x10ed43c718714eb63d5aa57b78b54704e256024e";

pub fn router_address() -> Address {
    Address::from_str(ROUTER).unwrap()
}

pub fn chain_config() -> ChainConfig {
    ChainConfig {
        chain_name: "bsc".to_string(),
        chain_id: 56,
        rpc_urls: vec!["http://127.0.0.1:18545".to_string()],
        block_time_seconds: 3.0,
        native_token_symbol: "BNB".to_string(),
        native_token_usd_price: Decimal::from(300),
        dex_routers: HashMap::from([("pancakeswap_v2".to_string(), router_address())]),
        pools: HashMap::from([(
            "wbnb_busd".to_string(),
            Address::from_low_u64_be(0x77),
        )]),
        scan_interval_secs: 3.0,
        imbalance_threshold_pct: Decimal::from(5),
        swap_fee: Decimal::new(3, 3),
        small_opp_min_usd: Decimal::from(10_000),
        small_opp_max_usd: Decimal::from(100_000),
        poll_interval_secs: 1.0,
        rpc_timeout_secs: 10,
        capture_window_blocks: 100,
        extra_swap_selectors: vec![],
    }
}

//================================================================================================//
//                                         BUILDERS                                              //
//================================================================================================//

fn address_topic(addr: Address) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(addr.as_bytes());
    H256::from(bytes)
}

pub fn swap_log(pool: Address, amounts: [u64; 4], log_index: u64) -> Log {
    let mut data = vec![0u8; 128];
    for (i, amount) in amounts.iter().enumerate() {
        U256::from(*amount).to_big_endian(&mut data[i * 32..(i + 1) * 32]);
    }
    Log {
        address: pool,
        topics: vec![
            *SWAP_EVENT_TOPIC,
            address_topic(Address::from_low_u64_be(0xaa)),
            address_topic(Address::from_low_u64_be(0xbb)),
        ],
        data: Bytes::from(data),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

pub fn noise_log(signature: &str, log_index: u64) -> Log {
    Log {
        address: Address::from_low_u64_be(1),
        topics: vec![H256::from(keccak256(signature.as_bytes()))],
        data: Bytes::default(),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

pub fn receipt(
    tx_hash: H256,
    logs: Vec<Log>,
    gas_used: u64,
    effective_gas_price: u64,
    success: bool,
) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        logs,
        gas_used: Some(U256::from(gas_used)),
        effective_gas_price: Some(U256::from(effective_gas_price)),
        status: Some(U64::from(if success { 1 } else { 0 })),
        ..Default::default()
    }
}

/// A router-bound transaction using the `swapExactTokensForTokens`
/// selector.
pub fn router_tx(hash: H256, from: Address, block_number: u64) -> Transaction {
    let mut input = hex::decode("38ed1739").unwrap();
    input.extend_from_slice(&[0u8; 64]);
    Transaction {
        hash,
        from,
        to: Some(router_address()),
        input: Bytes::from(input),
        block_number: Some(U64::from(block_number)),
        ..Default::default()
    }
}

pub fn block_with(height: u64, timestamp: u64, txs: Vec<Transaction>) -> Block<Transaction> {
    Block {
        number: Some(U64::from(height)),
        timestamp: U256::from(timestamp),
        transactions: txs,
        ..Default::default()
    }
}

//================================================================================================//
//                                         MOCK RPC                                              //
//================================================================================================//

#[derive(Default)]
pub struct MockRpc {
    pub height: AtomicU64,
    pub blocks: Mutex<HashMap<u64, Block<Transaction>>>,
    pub receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    /// Per-pool eth_call answers (raw ABI bytes).
    pub call_results: Mutex<HashMap<Address, Bytes>>,
    pub fail_height: AtomicBool,
}

impl MockRpc {
    pub fn new(height: u64) -> Self {
        let rpc = Self::default();
        rpc.height.store(height, Ordering::SeqCst);
        rpc
    }

    pub fn add_block(&self, block: Block<Transaction>) {
        let height = block.number.unwrap().as_u64();
        self.blocks.lock().unwrap().insert(height, block);
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        self.receipts
            .lock()
            .unwrap()
            .insert(receipt.transaction_hash, receipt);
    }

    pub fn set_reserves(&self, pool: Address, reserve0: u128, reserve1: u128, ts: u32) {
        let mut data = vec![0u8; 96];
        U256::from(reserve0).to_big_endian(&mut data[0..32]);
        U256::from(reserve1).to_big_endian(&mut data[32..64]);
        U256::from(ts).to_big_endian(&mut data[64..96]);
        self.call_results
            .lock()
            .unwrap()
            .insert(pool, Bytes::from(data));
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    fn chain_name(&self) -> &str {
        "bsc"
    }

    fn chain_id(&self) -> u64 {
        56
    }

    async fn latest_height(&self) -> Result<u64, ConnectorError> {
        if self.fail_height.load(Ordering::SeqCst) {
            return Err(ConnectorError::Timeout {
                method: "eth_blockNumber".to_string(),
                timeout_secs: 10,
            });
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn block_with_txs(
        &self,
        height: u64,
    ) -> Result<Option<Block<Transaction>>, ConnectorError> {
        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ConnectorError> {
        Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
    }

    async fn call(&self, to: Address, _data: Bytes) -> Result<Bytes, ConnectorError> {
        self.call_results
            .lock()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or_else(|| ConnectorError::Rpc {
                code: -32000,
                message: "execution reverted".to_string(),
            })
    }

    async fn endpoint_health(&self) -> Vec<CircuitBreakerStats> {
        Vec::new()
    }
}

//================================================================================================//
//                                     MOCK PERSISTENCE                                          //
//================================================================================================//

#[derive(Default)]
pub struct MockPersistence {
    pub opportunities: Mutex<Vec<Opportunity>>,
    pub transactions: Mutex<Vec<ArbitrageTransaction>>,
    pub observations: Mutex<Vec<ArbitrageurObservation>>,
    /// (chain_id, pools, min_block, captured_by, tx_hash)
    pub captures: Mutex<Vec<(u64, Vec<String>, u64, String, String)>>,
    pub chain_sync: Mutex<Vec<(u64, u64, i64)>>,
    pub stats: Mutex<Vec<ChainStat>>,
    pub fail_transaction_saves: AtomicBool,
}

#[async_trait]
impl Persistence for MockPersistence {
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<i64, PersistenceError> {
        let mut opportunities = self.opportunities.lock().unwrap();
        opportunities.push(opportunity.clone());
        Ok(opportunities.len() as i64)
    }

    async fn save_transaction(
        &self,
        transaction: &ArbitrageTransaction,
    ) -> Result<i64, PersistenceError> {
        if self.fail_transaction_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Query("injected failure".to_string()));
        }
        let mut transactions = self.transactions.lock().unwrap();
        // (chain_id, tx_hash) uniqueness: re-ingest updates in place.
        if let Some(existing) = transactions
            .iter_mut()
            .find(|t| t.chain_id == transaction.chain_id && t.tx_hash == transaction.tx_hash)
        {
            existing.profit_gross_usd = transaction.profit_gross_usd;
            existing.profit_net_usd = transaction.profit_net_usd;
            return Ok(existing.id.unwrap_or(0));
        }
        let id = transactions.len() as i64 + 1;
        let mut stored = transaction.clone();
        stored.id = Some(id);
        transactions.push(stored);
        Ok(id)
    }

    async fn upsert_arbitrageur(
        &self,
        observation: &ArbitrageurObservation,
    ) -> Result<(), PersistenceError> {
        self.observations.lock().unwrap().push(observation.clone());
        Ok(())
    }

    async fn mark_opportunities_captured(
        &self,
        chain_id: u64,
        pools: &[String],
        min_block: u64,
        captured_by: &str,
        capture_tx_hash: &str,
    ) -> Result<u64, PersistenceError> {
        self.captures.lock().unwrap().push((
            chain_id,
            pools.to_vec(),
            min_block,
            captured_by.to_string(),
            capture_tx_hash.to_string(),
        ));
        Ok(0)
    }

    async fn update_chain_sync(
        &self,
        chain_id: u64,
        last_synced_block: u64,
        blocks_behind: i64,
    ) -> Result<(), PersistenceError> {
        self.chain_sync
            .lock()
            .unwrap()
            .push((chain_id, last_synced_block, blocks_behind));
        Ok(())
    }

    async fn hourly_opportunity_counts(
        &self,
        _chain_id: u64,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _small_min: Decimal,
        _small_max: Decimal,
    ) -> Result<OpportunityCounts, PersistenceError> {
        Ok(OpportunityCounts::default())
    }

    async fn hourly_transaction_stats(
        &self,
        _chain_id: u64,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<TransactionHourStats, PersistenceError> {
        Ok(TransactionHourStats::default())
    }

    async fn upsert_chain_stat(&self, stat: &ChainStat) -> Result<(), PersistenceError> {
        let mut stats = self.stats.lock().unwrap();
        stats.retain(|s| !(s.chain_id == stat.chain_id && s.hour_timestamp == stat.hour_timestamp));
        stats.push(stat.clone());
        Ok(())
    }
}
