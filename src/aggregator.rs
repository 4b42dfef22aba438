//! # Stats Aggregator
//!
//! Periodic roll-up of the just-closed hour into one `chain_stats` row per
//! chain. Re-running the aggregation for the same hour overwrites the row
//! rather than duplicating it, so catch-up runs and restarts are safe.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::database::Persistence;
use crate::errors::PersistenceError;
use crate::types::ChainStat;

/// Opportunity tallies for one (chain, hour) window.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpportunityCounts {
    pub total: i64,
    pub captured: i64,
    pub small: i64,
    pub small_captured: i64,
}

/// Transaction tallies and profit distribution for one (chain, hour)
/// window. Distribution fields are null when no transaction in the hour
/// carried a net profit.
#[derive(Debug, Clone, Default)]
pub struct TransactionHourStats {
    pub count: i64,
    pub unique_arbitrageurs: i64,
    pub total_profit_usd: Decimal,
    pub total_gas_spent_usd: Decimal,
    pub avg_profit_usd: Option<Decimal>,
    pub median_profit_usd: Option<Decimal>,
    pub min_profit_usd: Option<Decimal>,
    pub max_profit_usd: Option<Decimal>,
    pub p95_profit_usd: Option<Decimal>,
}

/// Truncate to the containing hour, UTC.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("hour truncation is always representable")
}

/// Assemble the stat row from the raw window tallies. Rates degrade to
/// zero (not null) on an empty denominator.
pub fn compute_stat(
    chain_id: u64,
    hour_timestamp: DateTime<Utc>,
    opportunities: OpportunityCounts,
    transactions: &TransactionHourStats,
) -> ChainStat {
    let pct = |num: i64, den: i64| -> Decimal {
        if den > 0 {
            Decimal::from(num) / Decimal::from(den) * Decimal::from(100)
        } else {
            Decimal::ZERO
        }
    };

    let competition = if opportunities.total > 0 {
        Decimal::from(transactions.unique_arbitrageurs) / Decimal::from(opportunities.total)
    } else {
        Decimal::ZERO
    };

    ChainStat {
        chain_id,
        hour_timestamp,
        opportunities_detected: opportunities.total,
        opportunities_captured: opportunities.captured,
        small_opportunities_count: opportunities.small,
        small_opps_captured: opportunities.small_captured,
        transactions_detected: transactions.count,
        unique_arbitrageurs: transactions.unique_arbitrageurs,
        total_profit_usd: transactions.total_profit_usd,
        total_gas_spent_usd: transactions.total_gas_spent_usd,
        avg_profit_usd: transactions.avg_profit_usd,
        median_profit_usd: transactions.median_profit_usd,
        min_profit_usd: transactions.min_profit_usd,
        max_profit_usd: transactions.max_profit_usd,
        p95_profit_usd: transactions.p95_profit_usd,
        capture_rate: Some(pct(opportunities.captured, opportunities.total)),
        small_opp_capture_rate: Some(pct(opportunities.small_captured, opportunities.small)),
        avg_competition_level: Some(competition),
    }
}

/// Hourly roll-up driver across all configured chains.
pub struct StatsAggregator {
    persistence: Arc<dyn Persistence>,
    /// (chain_id, chain_name, small_min_usd, small_max_usd)
    chains: Vec<(u64, String, Decimal, Decimal)>,
    interval: Duration,
    cancel: CancellationToken,
}

impl StatsAggregator {
    pub fn new(config: &Config, persistence: Arc<dyn Persistence>, cancel: CancellationToken) -> Self {
        let chains = config
            .chains
            .values()
            .map(|c| {
                (
                    c.chain_id,
                    c.chain_name.clone(),
                    c.small_opp_min_usd,
                    c.small_opp_max_usd,
                )
            })
            .collect();
        Self {
            persistence,
            chains,
            interval: Duration::from_secs(config.aggregation_interval_secs),
            cancel,
        }
    }

    /// Aggregate one (chain, hour) window and upsert the row. Public so
    /// operators can backfill specific hours.
    pub async fn aggregate_hour(
        &self,
        chain_id: u64,
        small_min: Decimal,
        small_max: Decimal,
        hour_start: DateTime<Utc>,
    ) -> Result<ChainStat, PersistenceError> {
        let hour_start = truncate_to_hour(hour_start);
        let hour_end = hour_start + ChronoDuration::hours(1);

        let opportunities = self
            .persistence
            .hourly_opportunity_counts(chain_id, hour_start, hour_end, small_min, small_max)
            .await?;
        let transactions = self
            .persistence
            .hourly_transaction_stats(chain_id, hour_start, hour_end)
            .await?;

        let stat = compute_stat(chain_id, hour_start, opportunities, &transactions);
        self.persistence.upsert_chain_stat(&stat).await?;
        Ok(stat)
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; it covers the hour that just
        // closed, so a restart backfills at most that one window.
        info!(
            target: "stats_aggregator",
            chains = self.chains.len(),
            interval_secs = self.interval.as_secs(),
            "Stats aggregator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let closed_hour = truncate_to_hour(Utc::now() - ChronoDuration::hours(1));
            for (chain_id, chain_name, small_min, small_max) in &self.chains {
                match self
                    .aggregate_hour(*chain_id, *small_min, *small_max, closed_hour)
                    .await
                {
                    Ok(stat) => {
                        info!(
                            target: "stats_aggregator",
                            chain = %chain_name,
                            hour = %stat.hour_timestamp,
                            opportunities = stat.opportunities_detected,
                            transactions = stat.transactions_detected,
                            capture_rate = ?stat.capture_rate,
                            "Hourly stats aggregated"
                        );
                    }
                    Err(e) => {
                        error!(
                            target: "stats_aggregator",
                            chain = %chain_name,
                            hour = %closed_hour,
                            err = %e,
                            "Hourly aggregation failed"
                        );
                    }
                }
            }
        }

        info!(target: "stats_aggregator", "Stats aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn truncation_zeroes_sub_hour_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 2, 14, 37, 21).unwrap();
        let truncated = truncate_to_hour(ts);
        assert_eq!(truncated, Utc.with_ymd_and_hms(2026, 8, 2, 14, 0, 0).unwrap());
    }

    #[test]
    fn rates_are_bounded_and_zero_on_empty_windows() {
        let hour = Utc.with_ymd_and_hms(2026, 8, 2, 14, 0, 0).unwrap();
        let stat = compute_stat(
            56,
            hour,
            OpportunityCounts::default(),
            &TransactionHourStats::default(),
        );
        assert_eq!(stat.capture_rate, Some(Decimal::ZERO));
        assert_eq!(stat.small_opp_capture_rate, Some(Decimal::ZERO));
        assert_eq!(stat.avg_competition_level, Some(Decimal::ZERO));
    }

    #[test]
    fn capture_rate_matches_counts() {
        let hour = Utc.with_ymd_and_hms(2026, 8, 2, 14, 0, 0).unwrap();
        let counts = OpportunityCounts {
            total: 40,
            captured: 10,
            small: 8,
            small_captured: 2,
        };
        let txs = TransactionHourStats {
            count: 12,
            unique_arbitrageurs: 5,
            total_profit_usd: dec!(12345.67),
            total_gas_spent_usd: dec!(89.10),
            avg_profit_usd: Some(dec!(1028.8)),
            median_profit_usd: Some(dec!(700)),
            min_profit_usd: Some(dec!(-3)),
            max_profit_usd: Some(dec!(9000)),
            p95_profit_usd: Some(dec!(8100)),
        };
        let stat = compute_stat(137, hour, counts, &txs);
        assert_eq!(stat.capture_rate, Some(dec!(25)));
        assert_eq!(stat.small_opp_capture_rate, Some(dec!(25)));
        assert_eq!(stat.avg_competition_level, Some(dec!(0.125)));
        assert!(stat.capture_rate.unwrap() <= dec!(100));
    }

    #[test]
    fn recomputing_same_inputs_is_stable() {
        // The upsert overwrites; equality of the computed row is what
        // makes the re-run a no-op.
        let hour = Utc.with_ymd_and_hms(2026, 8, 2, 3, 0, 0).unwrap();
        let counts = OpportunityCounts {
            total: 7,
            captured: 3,
            small: 1,
            small_captured: 0,
        };
        let txs = TransactionHourStats {
            count: 2,
            unique_arbitrageurs: 2,
            ..Default::default()
        };
        let a = compute_stat(56, hour, counts, &txs);
        let b = compute_stat(56, hour, counts, &txs);
        assert_eq!(a.capture_rate, b.capture_rate);
        assert_eq!(a.opportunities_detected, b.opportunities_detected);
        assert_eq!(a.avg_competition_level, b.avg_competition_level);
    }
}
