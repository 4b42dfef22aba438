//! # Transaction Analyzer
//!
//! Classifies confirmed transactions as arbitrage and decodes their
//! Uniswap-V2-style Swap logs into structured records.
//!
//! A log entry counts as a swap iff its topic-0 equals the canonical Swap
//! event hash. Transfer, Sync, Approval, Mint and Burn entries in the same
//! receipt are ignored, which is what keeps false positives out of the
//! pipeline.

use ethers::types::{Address, Log, Transaction, TransactionReceipt, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::types::{format_tx_hash, SwapEvent};

//================================================================================================//
//                                         CONSTANTS                                             //
//================================================================================================//

/// Canonical Uniswap-V2 Swap event:
/// `Swap(address indexed sender, uint256 amount0In, uint256 amount1In,
///       uint256 amount0Out, uint256 amount1Out, address indexed to)`
pub const SWAP_EVENT_SIGNATURE: &str = "Swap(address,uint256,uint256,uint256,uint256,address)";

/// topic-0 of the canonical Swap event.
pub static SWAP_EVENT_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256(SWAP_EVENT_SIGNATURE.as_bytes())));

/// Recognized swap-function selectors (first 4 bytes of calldata).
/// Uniswap V2 family, fee-on-transfer variants, Balancer batch swaps and
/// Uniswap V3 exact-input/output entry points.
pub static DEFAULT_SWAP_SELECTORS: Lazy<HashSet<[u8; 4]>> = Lazy::new(|| {
    const SELECTORS: &[&str] = &[
        "38ed1739", // swapExactTokensForTokens
        "8803dbee", // swapTokensForExactTokens
        "7ff36ab5", // swapExactETHForTokens
        "18cbafe5", // swapExactTokensForETH
        "fb3bdb41", // swapETHForExactTokens
        "4a25d94a", // swapTokensForExactETH
        "5c11d795", // swapExactTokensForTokensSupportingFeeOnTransferTokens
        "b6f9de95", // swapExactETHForTokensSupportingFeeOnTransferTokens
        "791ac947", // swapExactTokensForETHSupportingFeeOnTransferTokens
        "472b43f3", // swapExactAmountIn (Balancer)
        "128acb08", // swapExactAmountOut (Balancer)
        "c04b8d59", // exactInput (Uniswap V3)
        "09b81346", // exactInputSingle (Uniswap V3)
        "f28c0498", // exactOutput (Uniswap V3)
        "db3e2198", // exactOutputSingle (Uniswap V3)
    ];
    SELECTORS
        .iter()
        .map(|s| {
            let bytes = hex::decode(s).expect("static selector is valid hex");
            let mut selector = [0u8; 4];
            selector.copy_from_slice(&bytes);
            selector
        })
        .collect()
});

/// Swap log payload: 4 x uint256.
const SWAP_DATA_LEN: usize = 128;

//================================================================================================//
//                                          ANALYZER                                             //
//================================================================================================//

/// Per-chain arbitrage classifier and swap decoder.
pub struct TransactionAnalyzer {
    chain_name: String,
    routers: HashSet<Address>,
    selectors: HashSet<[u8; 4]>,
}

impl TransactionAnalyzer {
    pub fn new(
        chain_name: impl Into<String>,
        routers: HashSet<Address>,
        extra_selectors: &[String],
    ) -> Self {
        let mut selectors = DEFAULT_SWAP_SELECTORS.clone();
        for raw in extra_selectors {
            let trimmed = raw.trim_start_matches("0x");
            if let Ok(bytes) = hex::decode(trimmed) {
                if bytes.len() == 4 {
                    let mut selector = [0u8; 4];
                    selector.copy_from_slice(&bytes);
                    selectors.insert(selector);
                    continue;
                }
            }
            warn!(target: "analyzer", selector = %raw, "Ignoring malformed swap selector");
        }
        Self {
            chain_name: chain_name.into(),
            routers,
            selectors,
        }
    }

    /// Count Swap events in a receipt by the topic-0 rule. Other event
    /// types never contribute, no matter how many are present.
    pub fn count_swap_events(&self, receipt: &TransactionReceipt) -> usize {
        receipt
            .logs
            .iter()
            .filter(|log| is_swap_log(log))
            .count()
    }

    /// A transaction is arbitrage iff all three hold: `to` is a known
    /// router, the calldata starts with a recognized swap selector, and
    /// the receipt contains at least two Swap logs. Anything else is
    /// explicitly not-arbitrage.
    pub fn is_arbitrage(&self, receipt: &TransactionReceipt, tx: &Transaction) -> bool {
        let to = match tx.to {
            Some(to) => to,
            None => return false,
        };
        if !self.routers.contains(&to) {
            return false;
        }

        if tx.input.len() < 4 {
            return false;
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&tx.input[..4]);
        if !self.selectors.contains(&selector) {
            debug!(
                target: "analyzer",
                chain = %self.chain_name,
                tx_hash = %format_tx_hash(&tx.hash),
                selector = %hex::encode(selector),
                "Unrecognized method selector"
            );
            return false;
        }

        let swap_count = self.count_swap_events(receipt);
        if swap_count < 2 {
            debug!(
                target: "analyzer",
                chain = %self.chain_name,
                tx_hash = %format_tx_hash(&tx.hash),
                swap_count,
                "Insufficient swap events"
            );
            return false;
        }

        true
    }

    /// Decode every Swap log in the receipt, in ascending `log_index`
    /// order. Malformed payloads are skipped with a structured warning and
    /// never abort the transaction.
    pub fn parse_swap_events(&self, receipt: &TransactionReceipt) -> Vec<SwapEvent> {
        let mut swaps: Vec<SwapEvent> = receipt
            .logs
            .iter()
            .filter(|log| is_swap_log(log))
            .filter_map(|log| match decode_swap_log(log) {
                Ok(swap) => Some(swap),
                Err(reason) => {
                    warn!(
                        target: "analyzer",
                        chain = %self.chain_name,
                        tx_hash = %format_tx_hash(&receipt.transaction_hash),
                        log_index = log.log_index.map(|v| v.as_u64()).unwrap_or_default(),
                        err = %reason,
                        "Skipping malformed swap log"
                    );
                    None
                }
            })
            .collect();
        swaps.sort_by_key(|swap| swap.log_index);
        swaps
    }
}

fn is_swap_log(log: &Log) -> bool {
    log.topics
        .first()
        .map(|topic| *topic == *SWAP_EVENT_TOPIC)
        .unwrap_or(false)
}

fn decode_swap_log(log: &Log) -> Result<SwapEvent, String> {
    if log.topics.len() < 3 {
        return Err(format!("expected 3 topics, got {}", log.topics.len()));
    }
    if log.data.len() < SWAP_DATA_LEN {
        return Err(format!(
            "payload too short: {} bytes, need {}",
            log.data.len(),
            SWAP_DATA_LEN
        ));
    }

    let sender = Address::from_slice(&log.topics[1].as_bytes()[12..]);
    let recipient = Address::from_slice(&log.topics[2].as_bytes()[12..]);

    let word = |i: usize| U256::from_big_endian(&log.data[i * 32..(i + 1) * 32]);

    Ok(SwapEvent {
        pool_address: log.address,
        sender,
        recipient,
        amount0_in: word(0),
        amount1_in: word(1),
        amount0_out: word(2),
        amount1_out: word(3),
        log_index: log.log_index.map(|v| v.as_u64()).unwrap_or_default(),
    })
}
