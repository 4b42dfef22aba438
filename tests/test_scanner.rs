//! Pool scanner integration tests: reserve decoding, imbalance emission,
//! boundary behavior and fan-out, all against the in-memory chain.

mod common;

use common::*;
use ethers::types::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use arbmon::config::HubSettings;
use arbmon::hub::{BroadcastHub, OutboundMessage};
use arbmon::scanner::PoolScanner;

fn scanner_with(
    rpc: Arc<MockRpc>,
    persistence: Arc<MockPersistence>,
    hub: Arc<BroadcastHub>,
    threshold: Decimal,
) -> PoolScanner {
    let mut config = chain_config();
    config.imbalance_threshold_pct = threshold;
    PoolScanner::new(config, rpc, persistence, hub, CancellationToken::new())
}

fn the_pool() -> Address {
    Address::from_low_u64_be(0x77)
}

#[tokio::test]
async fn imbalanced_pool_emits_opportunity() {
    let rpc = Arc::new(MockRpc::new(1234));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());

    let subscriber = hub.register().unwrap();
    subscriber.mailbox().recv().await.unwrap();
    hub.handle_client_message(
        &subscriber,
        r#"{"type":"subscribe","channel":"opportunities","filters":{"chain_id":56}}"#,
    );
    subscriber.mailbox().recv().await.unwrap();

    // E4 numbers: reserves 1200/800 -> ~22.47% imbalance, well over 5%.
    rpc.set_reserves(the_pool(), 1200, 800, 1_700_000_000);

    let scanner = scanner_with(rpc, persistence.clone(), hub.clone(), dec!(5));
    let emitted = scanner.scan_once().await;

    assert_eq!(emitted.len(), 1);
    let opp = &emitted[0];
    assert_eq!(opp.chain_id, 56);
    assert_eq!(opp.block_number, 1234);
    assert!(opp.imbalance_pct > dec!(22.47) && opp.imbalance_pct < dec!(22.48));
    assert!(opp.profit_native > dec!(177.3) && opp.profit_native < dec!(177.5));
    assert!(opp.reserve0 > Decimal::ZERO && opp.reserve1 > Decimal::ZERO);
    assert!(opp.profit_usd >= Decimal::ZERO);
    assert!(!opp.captured);
    assert_eq!(opp.id, Some(1));

    assert_eq!(persistence.opportunities.lock().unwrap().len(), 1);

    match subscriber.mailbox().recv().await.unwrap() {
        OutboundMessage::Opportunity { data, .. } => {
            assert_eq!(data.pool_label, "wbnb_busd");
        }
        other => panic!("expected opportunity event, got {:?}", other),
    }
}

#[tokio::test]
async fn balanced_pool_stays_quiet() {
    let rpc = Arc::new(MockRpc::new(10));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());

    rpc.set_reserves(the_pool(), 1_000_000, 1_000_000, 1_700_000_000);

    let scanner = scanner_with(rpc, persistence.clone(), hub, dec!(5));
    let emitted = scanner.scan_once().await;
    assert!(emitted.is_empty());
    assert!(persistence.opportunities.lock().unwrap().is_empty());
}

#[tokio::test]
async fn zero_reserve_pool_is_skipped_without_error() {
    let rpc = Arc::new(MockRpc::new(10));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());

    rpc.set_reserves(the_pool(), 0, 800, 1_700_000_000);

    let scanner = scanner_with(rpc, persistence.clone(), hub, dec!(5));
    let emitted = scanner.scan_once().await;
    assert!(emitted.is_empty());
    assert!(persistence.opportunities.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_reserve_read_never_aborts_the_tick() {
    let rpc = Arc::new(MockRpc::new(10));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());

    // No call result registered: the eth_call reverts for this pool.
    let scanner = scanner_with(rpc, persistence.clone(), hub, dec!(5));
    let emitted = scanner.scan_once().await;
    assert!(emitted.is_empty());
}

#[tokio::test]
async fn imbalance_exactly_at_threshold_emits() {
    let rpc = Arc::new(MockRpc::new(10));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());

    rpc.set_reserves(the_pool(), 1200, 800, 1_700_000_000);

    // Threshold set to the exact imbalance the math produces for
    // 1200/800: the boundary is inclusive.
    let scanner = scanner_with(rpc, persistence.clone(), hub, dec!(22.474487));
    let emitted = scanner.scan_once().await;
    assert_eq!(emitted.len(), 1);
    assert!(emitted[0].imbalance_pct >= dec!(22.474487));
}

#[tokio::test]
async fn multiple_pools_scan_independently() {
    let rpc = Arc::new(MockRpc::new(10));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());

    let healthy = Address::from_low_u64_be(0x78);
    let skewed = Address::from_low_u64_be(0x79);
    rpc.set_reserves(healthy, 1_000_000, 1_000_000, 1_700_000_000);
    rpc.set_reserves(skewed, 5_000_000, 1_000_000, 1_700_000_000);

    let mut config = chain_config();
    config.pools = HashMap::from([
        ("healthy".to_string(), healthy),
        ("skewed".to_string(), skewed),
    ]);
    let scanner = PoolScanner::new(
        config,
        rpc,
        persistence.clone(),
        hub,
        CancellationToken::new(),
    );

    let emitted = scanner.scan_once().await;
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].pool_label, "skewed");
}

#[test]
fn small_band_classification_is_inclusive() {
    let rpc = Arc::new(MockRpc::new(10));
    let persistence = Arc::new(MockPersistence::default());
    let hub = BroadcastHub::new(HubSettings::default());
    let scanner = scanner_with(rpc, persistence, hub, dec!(5));

    assert!(!scanner.is_small_opportunity(dec!(9999.99)));
    assert!(scanner.is_small_opportunity(dec!(10000)));
    assert!(scanner.is_small_opportunity(dec!(55000)));
    assert!(scanner.is_small_opportunity(dec!(100000)));
    assert!(!scanner.is_small_opportunity(dec!(100000.01)));
}
