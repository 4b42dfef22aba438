//! # Broadcast Hub
//!
//! Bounded fan-out of opportunity and transaction events to filtered
//! subscribers. Publishing never blocks: every subscriber owns a bounded
//! mailbox that discards its oldest entries under backpressure and counts
//! the drops. Transport is someone else's problem (`stream` adapts the
//! hub to WebSocket); the hub owns the registry, the filter semantics and
//! the message grammar.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::errors::HubError;
use crate::metrics;
use crate::types::{ArbitrageTransaction, Opportunity};

//================================================================================================//
//                                       WIRE GRAMMAR                                            //
//================================================================================================//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Opportunities,
    Transactions,
}

impl Channel {
    pub fn parse(raw: &str) -> Option<Channel> {
        match raw {
            "opportunities" => Some(Channel::Opportunities),
            "transactions" => Some(Channel::Transactions),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Opportunities => "opportunities",
            Channel::Transactions => "transactions",
        }
    }
}

/// Per-subscription filter. All fields optional; an unset field matches
/// everything. `min_swaps` is only meaningful on the transactions channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_swaps: Option<u32>,
}

impl SubscriptionFilter {
    pub fn matches_opportunity(&self, opp: &Opportunity) -> bool {
        if let Some(chain_id) = self.chain_id {
            if opp.chain_id != chain_id {
                return false;
            }
        }
        if let Some(min) = self.min_profit {
            if opp.profit_usd < min {
                return false;
            }
        }
        if let Some(max) = self.max_profit {
            if opp.profit_usd > max {
                return false;
            }
        }
        true
    }

    pub fn matches_transaction(&self, tx: &ArbitrageTransaction) -> bool {
        if let Some(chain_id) = self.chain_id {
            if tx.chain_id != chain_id {
                return false;
            }
        }
        // Profit rules apply to net profit; a null profit only passes
        // unconstrained subscriptions.
        match tx.profit_net_usd {
            Some(profit) => {
                if let Some(min) = self.min_profit {
                    if profit < min {
                        return false;
                    }
                }
                if let Some(max) = self.max_profit {
                    if profit > max {
                        return false;
                    }
                }
            }
            None => {
                if self.min_profit.is_some() || self.max_profit.is_some() {
                    return false;
                }
            }
        }
        if let Some(min_swaps) = self.min_swaps {
            if tx.swap_count < min_swaps {
                return false;
            }
        }
        true
    }
}

/// Hub -> subscriber messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Connected {
        connection_id: String,
    },
    Subscribed {
        channel: Channel,
        filters: SubscriptionFilter,
    },
    Unsubscribed {
        channel: Channel,
    },
    Opportunity {
        timestamp: DateTime<Utc>,
        data: Opportunity,
    },
    Transaction {
        timestamp: DateTime<Utc>,
        data: ArbitrageTransaction,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Connected { .. } => "connected",
            OutboundMessage::Subscribed { .. } => "subscribed",
            OutboundMessage::Unsubscribed { .. } => "unsubscribed",
            OutboundMessage::Opportunity { .. } => "opportunity",
            OutboundMessage::Transaction { .. } => "transaction",
            OutboundMessage::Heartbeat { .. } => "heartbeat",
            OutboundMessage::Pong { .. } => "pong",
            OutboundMessage::Error { .. } => "error",
        }
    }
}

/// Subscriber -> hub messages. `channel` stays a raw string so an unknown
/// channel produces a single `error` reply instead of a parse failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Subscribe {
        channel: String,
        #[serde(default)]
        filters: SubscriptionFilter,
    },
    Unsubscribe {
        channel: String,
    },
    Ping,
}

//================================================================================================//
//                                          MAILBOX                                              //
//================================================================================================//

/// Bounded outbound queue with drop-oldest backpressure. `push` is
/// synchronous and never blocks; `recv` parks until a message or close.
pub struct Mailbox {
    queue: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, message: OutboundMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("mailbox lock poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::WS_MESSAGES_DROPPED.inc();
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Next message, or `None` once the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<OutboundMessage> {
        loop {
            {
                let mut queue = self.queue.lock().expect("mailbox lock poisoned");
                if let Some(message) = queue.pop_front() {
                    return Some(message);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("mailbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//================================================================================================//
//                                        SUBSCRIBERS                                            //
//================================================================================================//

#[derive(Debug, Clone)]
struct Subscription {
    channel: Channel,
    filter: SubscriptionFilter,
}

/// One connected subscriber: identity, active subscriptions, mailbox.
pub struct SubscriberHandle {
    id: String,
    subscriptions: Mutex<Vec<Subscription>>,
    mailbox: Arc<Mailbox>,
}

impl SubscriberHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    fn wants_opportunity(&self, opp: &Opportunity) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .iter()
            .any(|s| s.channel == Channel::Opportunities && s.filter.matches_opportunity(opp))
    }

    fn wants_transaction(&self, tx: &ArbitrageTransaction) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .iter()
            .any(|s| s.channel == Channel::Transactions && s.filter.matches_transaction(tx))
    }
}

//================================================================================================//
//                                            HUB                                                //
//================================================================================================//

/// Subscriber registry and event router.
pub struct BroadcastHub {
    settings: HubSettings,
    subscribers: DashMap<String, Arc<SubscriberHandle>>,
    connection_counter: AtomicU64,
}

impl BroadcastHub {
    pub fn new(settings: HubSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            subscribers: DashMap::new(),
            connection_counter: AtomicU64::new(0),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn at_capacity(&self) -> bool {
        self.connection_count() >= self.settings.max_subscribers
    }

    /// Admit a new subscriber and greet it, or reject at capacity.
    pub fn register(&self) -> Result<Arc<SubscriberHandle>, HubError> {
        if self.at_capacity() {
            warn!(
                target: "hub",
                connections = self.connection_count(),
                capacity = self.settings.max_subscribers,
                "Subscriber rejected: hub at capacity"
            );
            return Err(HubError::AtCapacity {
                capacity: self.settings.max_subscribers,
            });
        }

        let seq = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("ws_{}_{}", seq, uuid::Uuid::new_v4().simple());
        let handle = Arc::new(SubscriberHandle {
            id: id.clone(),
            subscriptions: Mutex::new(Vec::new()),
            mailbox: Arc::new(Mailbox::new(self.settings.mailbox_capacity)),
        });
        handle.mailbox.push(OutboundMessage::Connected {
            connection_id: id.clone(),
        });
        self.subscribers.insert(id.clone(), handle.clone());
        metrics::WS_ACTIVE_CONNECTIONS.set(self.connection_count() as i64);
        info!(
            target: "hub",
            connection_id = %id,
            connections = self.connection_count(),
            "Subscriber connected"
        );
        Ok(handle)
    }

    /// Drop a subscriber and release its mailbox.
    pub fn unregister(&self, id: &str) {
        if let Some((_, handle)) = self.subscribers.remove(id) {
            handle.mailbox.close();
            metrics::WS_ACTIVE_CONNECTIONS.set(self.connection_count() as i64);
            info!(
                target: "hub",
                connection_id = %id,
                dropped_messages = handle.mailbox.dropped(),
                "Subscriber disconnected"
            );
        }
    }

    /// Process one client message per the wire grammar, replying into the
    /// subscriber's own mailbox.
    pub fn handle_client_message(&self, handle: &SubscriberHandle, raw: &str) {
        let message: InboundMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    target: "hub",
                    connection_id = %handle.id,
                    err = %e,
                    "Malformed client message"
                );
                handle.mailbox.push(OutboundMessage::Error {
                    message: "Invalid message".to_string(),
                });
                return;
            }
        };

        match message {
            InboundMessage::Subscribe { channel, filters } => {
                let parsed = match Channel::parse(&channel) {
                    Some(parsed) => parsed,
                    None => {
                        handle.mailbox.push(OutboundMessage::Error {
                            message: HubError::UnknownChannel(channel).to_string(),
                        });
                        return;
                    }
                };
                handle
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .push(Subscription {
                        channel: parsed,
                        filter: filters.clone(),
                    });
                handle.mailbox.push(OutboundMessage::Subscribed {
                    channel: parsed,
                    filters,
                });
            }
            InboundMessage::Unsubscribe { channel } => {
                let parsed = match Channel::parse(&channel) {
                    Some(parsed) => parsed,
                    None => {
                        handle.mailbox.push(OutboundMessage::Error {
                            message: HubError::UnknownChannel(channel).to_string(),
                        });
                        return;
                    }
                };
                handle
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .retain(|s| s.channel != parsed);
                handle
                    .mailbox
                    .push(OutboundMessage::Unsubscribed { channel: parsed });
            }
            InboundMessage::Ping => {
                handle.mailbox.push(OutboundMessage::Pong {
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Route an opportunity to every subscriber with a matching
    /// subscription. At most one delivery per subscriber per event.
    pub fn publish_opportunity(&self, opportunity: &Opportunity) {
        let timestamp = Utc::now();
        let mut delivered = 0u64;
        for entry in self.subscribers.iter() {
            if entry.value().wants_opportunity(opportunity) {
                entry.value().mailbox.push(OutboundMessage::Opportunity {
                    timestamp,
                    data: opportunity.clone(),
                });
                delivered += 1;
            }
        }
        if delivered > 0 {
            metrics::WS_MESSAGES_SENT
                .with_label_values(&["opportunity"])
                .inc_by(delivered);
        }
    }

    /// Route a transaction event; same delivery rules as opportunities.
    pub fn publish_transaction(&self, transaction: &ArbitrageTransaction) {
        let timestamp = Utc::now();
        let mut delivered = 0u64;
        for entry in self.subscribers.iter() {
            if entry.value().wants_transaction(transaction) {
                entry.value().mailbox.push(OutboundMessage::Transaction {
                    timestamp,
                    data: transaction.clone(),
                });
                delivered += 1;
            }
        }
        if delivered > 0 {
            metrics::WS_MESSAGES_SENT
                .with_label_values(&["transaction"])
                .inc_by(delivered);
        }
    }

    /// Push a heartbeat to every subscriber every `heartbeat_interval`.
    pub async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.heartbeat_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let timestamp = Utc::now();
                    for entry in self.subscribers.iter() {
                        entry.value().mailbox.push(OutboundMessage::Heartbeat { timestamp });
                    }
                }
            }
        }
        info!(target: "hub", "Heartbeat loop stopped");
    }
}

pub fn serialize_outbound(message: &OutboundMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        warn!(target: "hub", err = %e, kind = message.kind(), "Failed to serialize outbound message");
        r#"{"type":"error","message":"serialization failure"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Strategy;
    use rust_decimal_macros::dec;

    fn hub_with_capacity(max_subscribers: usize, mailbox_capacity: usize) -> Arc<BroadcastHub> {
        BroadcastHub::new(HubSettings {
            max_subscribers,
            mailbox_capacity,
            heartbeat_interval_secs: 30,
        })
    }

    fn opportunity(chain_id: u64, profit_usd: Decimal) -> Opportunity {
        Opportunity {
            id: None,
            chain_id,
            pool_label: "wbnb_busd".to_string(),
            pool_address: "0xpool".to_string(),
            imbalance_pct: dec!(10),
            profit_usd,
            profit_native: profit_usd,
            reserve0: dec!(1),
            reserve1: dec!(1),
            block_number: 1,
            detected_at: Utc::now(),
            captured: false,
            captured_by: None,
            capture_tx_hash: None,
        }
    }

    fn transaction(chain_id: u64, profit: Option<Decimal>, swap_count: u32) -> ArbitrageTransaction {
        ArbitrageTransaction {
            id: None,
            chain_id,
            tx_hash: "0xabc".to_string(),
            from_address: "0xfeed".to_string(),
            block_number: 1,
            block_timestamp: Utc::now(),
            gas_price_gwei: dec!(5),
            gas_used: 21_000,
            gas_cost_native: dec!(0.0001),
            gas_cost_usd: dec!(0.03),
            swap_count,
            strategy: Strategy::from_swap_count(swap_count),
            profit_gross_usd: profit,
            profit_net_usd: profit,
            pools_involved: vec!["0xa".to_string(); swap_count as usize],
            tokens_involved: vec![],
            detected_at: Utc::now(),
        }
    }

    async fn drain_connected(handle: &SubscriberHandle) {
        let first = handle.mailbox().recv().await.unwrap();
        assert!(matches!(first, OutboundMessage::Connected { .. }));
    }

    fn subscribe(hub: &BroadcastHub, handle: &SubscriberHandle, channel: &str, filters: &str) {
        hub.handle_client_message(
            handle,
            &format!(
                r#"{{"type":"subscribe","channel":"{}","filters":{}}}"#,
                channel, filters
            ),
        );
    }

    #[tokio::test]
    async fn capacity_limit_rejects_new_subscribers() {
        let hub = hub_with_capacity(2, 8);
        let _a = hub.register().unwrap();
        let _b = hub.register().unwrap();
        assert!(matches!(
            hub.register(),
            Err(HubError::AtCapacity { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn no_matching_filter_means_no_delivery() {
        // E6: S1 wants chain 56 with min_profit 20000, S2 wants chain 137.
        // An opportunity on chain 56 worth 15000 matches neither.
        let hub = hub_with_capacity(10, 8);
        let s1 = hub.register().unwrap();
        let s2 = hub.register().unwrap();
        drain_connected(&s1).await;
        drain_connected(&s2).await;

        subscribe(&hub, &s1, "opportunities", r#"{"chain_id":56,"min_profit":20000}"#);
        subscribe(&hub, &s2, "opportunities", r#"{"chain_id":137}"#);
        assert!(matches!(
            s1.mailbox().recv().await.unwrap(),
            OutboundMessage::Subscribed { .. }
        ));
        assert!(matches!(
            s2.mailbox().recv().await.unwrap(),
            OutboundMessage::Subscribed { .. }
        ));

        hub.publish_opportunity(&opportunity(56, dec!(15000)));
        assert!(s1.mailbox().is_empty());
        assert!(s2.mailbox().is_empty());
    }

    #[tokio::test]
    async fn overlapping_subscriptions_deliver_once() {
        let hub = hub_with_capacity(10, 8);
        let sub = hub.register().unwrap();
        drain_connected(&sub).await;

        subscribe(&hub, &sub, "opportunities", r#"{}"#);
        subscribe(&hub, &sub, "opportunities", r#"{"chain_id":56}"#);
        sub.mailbox().recv().await.unwrap();
        sub.mailbox().recv().await.unwrap();

        hub.publish_opportunity(&opportunity(56, dec!(100)));
        assert!(matches!(
            sub.mailbox().recv().await.unwrap(),
            OutboundMessage::Opportunity { .. }
        ));
        assert!(sub.mailbox().is_empty());
    }

    #[tokio::test]
    async fn transaction_filters_apply_to_net_profit_and_swaps() {
        let hub = hub_with_capacity(10, 8);
        let sub = hub.register().unwrap();
        drain_connected(&sub).await;
        subscribe(
            &hub,
            &sub,
            "transactions",
            r#"{"chain_id":56,"min_profit":10,"min_swaps":3}"#,
        );
        sub.mailbox().recv().await.unwrap();

        hub.publish_transaction(&transaction(56, Some(dec!(50)), 2));
        assert!(sub.mailbox().is_empty());

        hub.publish_transaction(&transaction(56, None, 3));
        assert!(sub.mailbox().is_empty());

        hub.publish_transaction(&transaction(56, Some(dec!(50)), 3));
        assert!(matches!(
            sub.mailbox().recv().await.unwrap(),
            OutboundMessage::Transaction { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_channel_yields_single_error() {
        let hub = hub_with_capacity(10, 8);
        let sub = hub.register().unwrap();
        drain_connected(&sub).await;

        subscribe(&hub, &sub, "liquidations", r#"{}"#);
        match sub.mailbox().recv().await.unwrap() {
            OutboundMessage::Error { message } => {
                assert!(message.contains("liquidations"));
            }
            other => panic!("expected error, got {:?}", other.kind()),
        }
        assert!(sub.mailbox().is_empty());
    }

    #[tokio::test]
    async fn mailbox_drops_oldest_under_backpressure() {
        let mailbox = Mailbox::new(3);
        for i in 0..5 {
            mailbox.push(OutboundMessage::Error {
                message: format!("m{}", i),
            });
        }
        assert_eq!(mailbox.dropped(), 2);
        assert_eq!(mailbox.len(), 3);

        // Oldest survivors are m2, m3, m4.
        match mailbox.recv().await.unwrap() {
            OutboundMessage::Error { message } => assert_eq!(message, "m2"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let hub = hub_with_capacity(10, 8);
        let sub = hub.register().unwrap();
        drain_connected(&sub).await;
        hub.handle_client_message(&sub, r#"{"type":"ping"}"#);
        assert!(matches!(
            sub.mailbox().recv().await.unwrap(),
            OutboundMessage::Pong { .. }
        ));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = hub_with_capacity(10, 8);
        let sub = hub.register().unwrap();
        drain_connected(&sub).await;
        subscribe(&hub, &sub, "opportunities", r#"{}"#);
        sub.mailbox().recv().await.unwrap();

        hub.handle_client_message(&sub, r#"{"type":"unsubscribe","channel":"opportunities"}"#);
        assert!(matches!(
            sub.mailbox().recv().await.unwrap(),
            OutboundMessage::Unsubscribed { .. }
        ));

        hub.publish_opportunity(&opportunity(56, dec!(100)));
        assert!(sub.mailbox().is_empty());
    }
}
