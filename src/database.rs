//! # Persistence Gateway
//!
//! Pooled PostgreSQL access for every durable record the monitor produces.
//! All statements are parameterized; writes retry transiently with
//! 0.5s/1s/2s backoff and surface `PersistenceError` on exhaustion, which
//! callers log and skip. Schema bootstrap is idempotent.
//!
//! The `Persistence` trait is the seam the detectors depend on, so the
//! pipeline is testable without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PgConfig, Pool, PoolConfig, Runtime};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info, warn};

use crate::aggregator::{OpportunityCounts, TransactionHourStats};
use crate::config::{ChainConfig, DatabaseSettings};
use crate::errors::PersistenceError;
use crate::schema::SCHEMA_SQL;
use crate::tracker::{bump_strategy_count, preferred_strategy, running_mean, ArbitrageurObservation};
use crate::types::{
    ArbitrageTransaction, Arbitrageur, ArbitrageurFilters, ChainStat, Opportunity,
    OpportunityFilters, Strategy, TransactionFilters,
};

/// Hard cap on rows per query, whatever the caller asks for.
pub const MAX_QUERY_LIMIT: i64 = 1_000;
const DEFAULT_QUERY_LIMIT: i64 = 100;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

//================================================================================================//
//                                            TRAIT                                              //
//================================================================================================//

/// Write surface the detectors and the aggregator depend on.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<i64, PersistenceError>;

    async fn save_transaction(
        &self,
        transaction: &ArbitrageTransaction,
    ) -> Result<i64, PersistenceError>;

    async fn upsert_arbitrageur(
        &self,
        observation: &ArbitrageurObservation,
    ) -> Result<(), PersistenceError>;

    /// Mark still-open opportunities on the given pools (at or above
    /// `min_block`) as captured. Returns the number of rows updated.
    async fn mark_opportunities_captured(
        &self,
        chain_id: u64,
        pools: &[String],
        min_block: u64,
        captured_by: &str,
        capture_tx_hash: &str,
    ) -> Result<u64, PersistenceError>;

    async fn update_chain_sync(
        &self,
        chain_id: u64,
        last_synced_block: u64,
        blocks_behind: i64,
    ) -> Result<(), PersistenceError>;

    async fn hourly_opportunity_counts(
        &self,
        chain_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        small_min: Decimal,
        small_max: Decimal,
    ) -> Result<OpportunityCounts, PersistenceError>;

    async fn hourly_transaction_stats(
        &self,
        chain_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TransactionHourStats, PersistenceError>;

    async fn upsert_chain_stat(&self, stat: &ChainStat) -> Result<(), PersistenceError>;
}

//================================================================================================//
//                                          MANAGER                                              //
//================================================================================================//

/// Deadpool-backed gateway.
pub struct DatabaseManager {
    pool: Pool,
    operation_timeout: Duration,
}

impl DatabaseManager {
    /// Parse the database URL, build the pool and verify connectivity.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, PersistenceError> {
        let url = url::Url::parse(&settings.url)
            .map_err(|e| PersistenceError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "postgres" && url.scheme() != "postgresql" {
            return Err(PersistenceError::InvalidUrl(format!(
                "expected postgres:// scheme, got {}",
                url.scheme()
            )));
        }

        let mut pg_config = PgConfig::new();
        pg_config.host = Some(
            url.host_str()
                .ok_or_else(|| PersistenceError::InvalidUrl("missing host".to_string()))?
                .to_string(),
        );
        pg_config.port = Some(url.port().unwrap_or(5432));
        pg_config.user = Some(if url.username().is_empty() {
            "postgres".to_string()
        } else {
            url.username().to_string()
        });
        pg_config.password = url.password().map(str::to_string);
        pg_config.dbname = Some(url.path().trim_start_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| Some("arbmon".to_string()));
        // Deadpool grows the pool lazily; min_pool_size is advisory.
        pg_config.pool = Some(PoolConfig {
            max_size: settings.max_pool_size,
            timeouts: deadpool_postgres::Timeouts {
                create: Some(Duration::from_secs(30)),
                wait: Some(Duration::from_secs(30)),
                recycle: Some(Duration::from_secs(300)),
            },
            queue_mode: Default::default(),
        });

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| PersistenceError::Pool(e.to_string()))?;

        // Fail fast on unreachable stores.
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        info!(
            target: "database",
            max_pool_size = settings.max_pool_size,
            "Database pool created"
        );

        Ok(Self {
            pool,
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
        })
    }

    /// Create tables and indices. Safe to run on every boot.
    pub async fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let client = self.pool.get().await?;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        info!(target: "database", "Schema initialized");
        Ok(())
    }

    /// Upsert the chain registry row for one configured chain.
    pub async fn register_chain(&self, chain: &ChainConfig) -> Result<(), PersistenceError> {
        let block_time =
            Decimal::from_f64_retain(chain.block_time_seconds).unwrap_or_default();
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO chains (name, chain_id, block_time_seconds, native_token, native_token_usd)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (chain_id) DO UPDATE SET
                     name = EXCLUDED.name,
                     block_time_seconds = EXCLUDED.block_time_seconds,
                     native_token = EXCLUDED.native_token,
                     native_token_usd = EXCLUDED.native_token_usd,
                     updated_at = CURRENT_TIMESTAMP",
                &[
                    &chain.chain_name,
                    &(chain.chain_id as i64),
                    &block_time,
                    &chain.native_token_symbol,
                    &chain.native_token_usd_price,
                ],
            )
            .await?;
        Ok(())
    }

    /// Retry a transient-failure-prone operation with 0.5s/1s/2s backoff.
    /// Each attempt runs under the configured operation deadline.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PersistenceError>>,
    {
        let mut last_error = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            let result = match timeout(self.operation_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(PersistenceError::Timeout {
                    timeout_secs: self.operation_timeout.as_secs(),
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < RETRY_ATTEMPTS {
                        let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                        warn!(
                            target: "database",
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            err = %e,
                            "Database operation retry"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }

    //============================================================================================//
    //                                      QUERY SURFACE                                         //
    //============================================================================================//

    /// Historical opportunity query for the external adapters.
    pub async fn get_opportunities(
        &self,
        filters: &OpportunityFilters,
    ) -> Result<Vec<Opportunity>, PersistenceError> {
        let chain_id = filters.chain_id.map(|v| v as i64);
        let limit = clamp_limit(filters.limit);
        let offset = filters.offset.unwrap_or(0).max(0);

        let mut query = String::from(
            "SELECT id, chain_id, pool_label, pool_address, imbalance_pct, profit_usd,
                    profit_native, reserve0, reserve1, block_number, detected_at,
                    captured, captured_by, capture_tx_hash
             FROM opportunities WHERE TRUE",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(ref v) = chain_id {
            params.push(v);
            query.push_str(&format!(" AND chain_id = ${}", params.len()));
        }
        if let Some(ref v) = filters.min_profit {
            params.push(v);
            query.push_str(&format!(" AND profit_usd >= ${}", params.len()));
        }
        if let Some(ref v) = filters.max_profit {
            params.push(v);
            query.push_str(&format!(" AND profit_usd <= ${}", params.len()));
        }
        if let Some(ref v) = filters.captured {
            params.push(v);
            query.push_str(&format!(" AND captured = ${}", params.len()));
        }

        params.push(&limit);
        query.push_str(&format!(" ORDER BY detected_at DESC LIMIT ${}", params.len()));
        params.push(&offset);
        query.push_str(&format!(" OFFSET ${}", params.len()));

        let client = self.pool.get().await?;
        let rows = client.query(query.as_str(), &params).await?;
        Ok(rows.iter().map(opportunity_from_row).collect())
    }

    /// Historical transaction query for the external adapters.
    pub async fn get_transactions(
        &self,
        filters: &TransactionFilters,
    ) -> Result<Vec<ArbitrageTransaction>, PersistenceError> {
        let chain_id = filters.chain_id.map(|v| v as i64);
        let min_swaps = filters.min_swaps.map(|v| v as i32);
        let strategy = filters.strategy.map(|s| s.as_str().to_string());
        let limit = clamp_limit(filters.limit);
        let offset = filters.offset.unwrap_or(0).max(0);

        let mut query = String::from(
            "SELECT id, chain_id, tx_hash, from_address, block_number, block_timestamp,
                    gas_price_gwei, gas_used, gas_cost_native, gas_cost_usd, swap_count,
                    strategy, profit_gross_usd, profit_net_usd, pools_involved,
                    tokens_involved, detected_at
             FROM transactions WHERE TRUE",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(ref v) = chain_id {
            params.push(v);
            query.push_str(&format!(" AND chain_id = ${}", params.len()));
        }
        if let Some(ref v) = filters.from_address {
            params.push(v);
            query.push_str(&format!(" AND from_address = ${}", params.len()));
        }
        if let Some(ref v) = filters.min_profit {
            params.push(v);
            query.push_str(&format!(" AND profit_net_usd >= ${}", params.len()));
        }
        if let Some(ref v) = filters.max_profit {
            params.push(v);
            query.push_str(&format!(" AND profit_net_usd <= ${}", params.len()));
        }
        if let Some(ref v) = min_swaps {
            params.push(v);
            query.push_str(&format!(" AND swap_count >= ${}", params.len()));
        }
        if let Some(ref v) = strategy {
            params.push(v);
            query.push_str(&format!(" AND strategy = ${}", params.len()));
        }

        params.push(&limit);
        query.push_str(&format!(" ORDER BY detected_at DESC LIMIT ${}", params.len()));
        params.push(&offset);
        query.push_str(&format!(" OFFSET ${}", params.len()));

        let client = self.pool.get().await?;
        let rows = client.query(query.as_str(), &params).await?;
        Ok(rows.iter().map(transaction_from_row).collect())
    }

    /// Arbitrageur leaderboard query.
    pub async fn get_arbitrageurs(
        &self,
        filters: &ArbitrageurFilters,
    ) -> Result<Vec<Arbitrageur>, PersistenceError> {
        let chain_id = filters.chain_id.map(|v| v as i64);
        let limit = clamp_limit(filters.limit);
        let offset = filters.offset.unwrap_or(0).max(0);

        // sort_by goes into the statement text: allow-list it.
        let sort_by = match filters.sort_by.as_str() {
            "total_transactions" | "last_seen" | "total_gas_spent_usd" | "total_profit_usd" => {
                filters.sort_by.as_str()
            }
            _ => "total_profit_usd",
        };
        let direction = if filters.descending { "DESC" } else { "ASC" };

        let mut query = String::from(
            "SELECT address, chain_id, first_seen, last_seen, total_transactions,
                    successful_transactions, failed_transactions, total_profit_usd,
                    total_gas_spent_usd, avg_gas_price_gwei, preferred_strategy
             FROM arbitrageurs WHERE TRUE",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(ref v) = chain_id {
            params.push(v);
            query.push_str(&format!(" AND chain_id = ${}", params.len()));
        }
        if let Some(ref v) = filters.min_transactions {
            params.push(v);
            query.push_str(&format!(" AND total_transactions >= ${}", params.len()));
        }

        query.push_str(&format!(" ORDER BY {} {}", sort_by, direction));
        params.push(&limit);
        query.push_str(&format!(" LIMIT ${}", params.len()));
        params.push(&offset);
        query.push_str(&format!(" OFFSET ${}", params.len()));

        let client = self.pool.get().await?;
        let rows = client.query(query.as_str(), &params).await?;
        Ok(rows.iter().map(arbitrageur_from_row).collect())
    }

    /// Hourly stat rows for a chain since `since`, newest first.
    pub async fn get_chain_stats(
        &self,
        chain_id: u64,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<ChainStat>, PersistenceError> {
        let limit = clamp_limit(limit);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT chain_id, hour_timestamp, opportunities_detected, opportunities_captured,
                        small_opportunities_count, small_opps_captured, transactions_detected,
                        unique_arbitrageurs, total_profit_usd, total_gas_spent_usd,
                        avg_profit_usd, median_profit_usd, min_profit_usd, max_profit_usd,
                        p95_profit_usd, capture_rate, small_opp_capture_rate, avg_competition_level
                 FROM chain_stats
                 WHERE chain_id = $1 AND hour_timestamp >= $2
                 ORDER BY hour_timestamp DESC LIMIT $3",
                &[&(chain_id as i64), &since, &limit],
            )
            .await?;
        Ok(rows.iter().map(chain_stat_from_row).collect())
    }

    //============================================================================================//
    //                                     SINGLE-SHOT WRITES                                     //
    //============================================================================================//

    async fn save_opportunity_once(
        &self,
        opportunity: &Opportunity,
    ) -> Result<i64, PersistenceError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO opportunities (
                     chain_id, pool_label, pool_address, imbalance_pct, profit_usd,
                     profit_native, reserve0, reserve1, block_number, detected_at,
                     captured, captured_by, capture_tx_hash
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 RETURNING id",
                &[
                    &(opportunity.chain_id as i64),
                    &opportunity.pool_label,
                    &opportunity.pool_address,
                    &opportunity.imbalance_pct,
                    &opportunity.profit_usd,
                    &opportunity.profit_native,
                    &opportunity.reserve0,
                    &opportunity.reserve1,
                    &(opportunity.block_number as i64),
                    &opportunity.detected_at,
                    &opportunity.captured,
                    &opportunity.captured_by,
                    &opportunity.capture_tx_hash,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn save_transaction_once(
        &self,
        transaction: &ArbitrageTransaction,
    ) -> Result<i64, PersistenceError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO transactions (
                     chain_id, tx_hash, from_address, block_number, block_timestamp,
                     gas_price_gwei, gas_used, gas_cost_native, gas_cost_usd, swap_count,
                     strategy, profit_gross_usd, profit_net_usd, pools_involved,
                     tokens_involved, detected_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                 ON CONFLICT (chain_id, tx_hash) DO UPDATE SET
                     profit_gross_usd = EXCLUDED.profit_gross_usd,
                     profit_net_usd = EXCLUDED.profit_net_usd
                 RETURNING id",
                &[
                    &(transaction.chain_id as i64),
                    &transaction.tx_hash,
                    &transaction.from_address,
                    &(transaction.block_number as i64),
                    &transaction.block_timestamp,
                    &transaction.gas_price_gwei,
                    &(transaction.gas_used as i64),
                    &transaction.gas_cost_native,
                    &transaction.gas_cost_usd,
                    &(transaction.swap_count as i32),
                    &transaction.strategy.as_str(),
                    &transaction.profit_gross_usd,
                    &transaction.profit_net_usd,
                    &transaction.pools_involved,
                    &transaction.tokens_involved,
                    &transaction.detected_at,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn upsert_arbitrageur_once(
        &self,
        observation: &ArbitrageurObservation,
    ) -> Result<(), PersistenceError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let existing = tx
            .query_opt(
                "SELECT total_transactions, successful_transactions, failed_transactions,
                        total_profit_usd, total_gas_spent_usd, avg_gas_price_gwei, strategy_counts
                 FROM arbitrageurs
                 WHERE address = $1 AND chain_id = $2
                 FOR UPDATE",
                &[&observation.address, &(observation.chain_id as i64)],
            )
            .await?;

        let now = Utc::now();
        match existing {
            Some(row) => {
                let total: i64 = row.get(0);
                let successful: i64 = row.get(1);
                let failed: i64 = row.get(2);
                let total_profit: Decimal = row.get(3);
                let total_gas: Decimal = row.get(4);
                let avg_gas: Decimal = row.get(5);
                let mut counts: Value = row.get(6);

                bump_strategy_count(&mut counts, observation.strategy);
                let preferred = preferred_strategy(&counts).map(|s| s.as_str().to_string());
                let new_avg = running_mean(avg_gas, total, observation.gas_price_gwei);

                tx.execute(
                    "UPDATE arbitrageurs SET
                         last_seen = $1,
                         total_transactions = $2,
                         successful_transactions = $3,
                         failed_transactions = $4,
                         total_profit_usd = $5,
                         total_gas_spent_usd = $6,
                         avg_gas_price_gwei = $7,
                         preferred_strategy = $8,
                         strategy_counts = $9
                     WHERE address = $10 AND chain_id = $11",
                    &[
                        &now,
                        &(total + 1),
                        &(successful + if observation.success { 1 } else { 0 }),
                        &(failed + if observation.success { 0 } else { 1 }),
                        &(total_profit + observation.profit_contribution_usd),
                        &(total_gas + observation.gas_cost_usd),
                        &new_avg,
                        &preferred,
                        &counts,
                        &observation.address,
                        &(observation.chain_id as i64),
                    ],
                )
                .await?;
            }
            None => {
                let mut counts = json!({});
                bump_strategy_count(&mut counts, observation.strategy);
                let preferred = preferred_strategy(&counts).map(|s| s.as_str().to_string());

                let inserted = tx
                    .execute(
                        "INSERT INTO arbitrageurs (
                             address, chain_id, first_seen, last_seen, total_transactions,
                             successful_transactions, failed_transactions, total_profit_usd,
                             total_gas_spent_usd, avg_gas_price_gwei, preferred_strategy,
                             strategy_counts
                         ) VALUES ($1, $2, $3, $3, 1, $4, $5, $6, $7, $8, $9, $10)
                         ON CONFLICT (address, chain_id) DO NOTHING",
                        &[
                            &observation.address,
                            &(observation.chain_id as i64),
                            &now,
                            &(if observation.success { 1i64 } else { 0i64 }),
                            &(if observation.success { 0i64 } else { 1i64 }),
                            &observation.profit_contribution_usd,
                            &observation.gas_cost_usd,
                            &observation.gas_price_gwei,
                            &preferred,
                            &counts,
                        ],
                    )
                    .await?;
                if inserted == 0 {
                    // Lost a create race; the retry takes the update path.
                    return Err(PersistenceError::Query(
                        "arbitrageur insert raced, retrying".to_string(),
                    ));
                }
            }
        }

        tx.commit().await?;
        debug!(
            target: "database",
            address = %observation.address,
            chain_id = observation.chain_id,
            "Arbitrageur upserted"
        );
        Ok(())
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
}

//================================================================================================//
//                                        ROW MAPPING                                            //
//================================================================================================//

fn opportunity_from_row(row: &Row) -> Opportunity {
    Opportunity {
        id: Some(row.get::<_, i64>(0)),
        chain_id: row.get::<_, i64>(1) as u64,
        pool_label: row.get(2),
        pool_address: row.get(3),
        imbalance_pct: row.get(4),
        profit_usd: row.get(5),
        profit_native: row.get(6),
        reserve0: row.get(7),
        reserve1: row.get(8),
        block_number: row.get::<_, i64>(9) as u64,
        detected_at: row.get(10),
        captured: row.get(11),
        captured_by: row.get(12),
        capture_tx_hash: row.get(13),
    }
}

fn transaction_from_row(row: &Row) -> ArbitrageTransaction {
    ArbitrageTransaction {
        id: Some(row.get::<_, i64>(0)),
        chain_id: row.get::<_, i64>(1) as u64,
        tx_hash: row.get(2),
        from_address: row.get(3),
        block_number: row.get::<_, i64>(4) as u64,
        block_timestamp: row.get(5),
        gas_price_gwei: row.get(6),
        gas_used: row.get::<_, i64>(7) as u64,
        gas_cost_native: row.get(8),
        gas_cost_usd: row.get(9),
        swap_count: row.get::<_, i32>(10) as u32,
        strategy: Strategy::from_str(row.get(11)).unwrap_or(Strategy::MultiHop),
        profit_gross_usd: row.get(12),
        profit_net_usd: row.get(13),
        pools_involved: row.get(14),
        tokens_involved: row.get(15),
        detected_at: row.get(16),
    }
}

fn arbitrageur_from_row(row: &Row) -> Arbitrageur {
    Arbitrageur {
        address: row.get(0),
        chain_id: row.get::<_, i64>(1) as u64,
        first_seen: row.get(2),
        last_seen: row.get(3),
        total_transactions: row.get(4),
        successful_transactions: row.get(5),
        failed_transactions: row.get(6),
        total_profit_usd: row.get(7),
        total_gas_spent_usd: row.get(8),
        avg_gas_price_gwei: row.get(9),
        preferred_strategy: row
            .get::<_, Option<String>>(10)
            .and_then(|s| Strategy::from_str(&s).ok()),
    }
}

fn chain_stat_from_row(row: &Row) -> ChainStat {
    ChainStat {
        chain_id: row.get::<_, i64>(0) as u64,
        hour_timestamp: row.get(1),
        opportunities_detected: row.get(2),
        opportunities_captured: row.get(3),
        small_opportunities_count: row.get(4),
        small_opps_captured: row.get(5),
        transactions_detected: row.get(6),
        unique_arbitrageurs: row.get(7),
        total_profit_usd: row.get(8),
        total_gas_spent_usd: row.get(9),
        avg_profit_usd: row.get(10),
        median_profit_usd: row.get(11),
        min_profit_usd: row.get(12),
        max_profit_usd: row.get(13),
        p95_profit_usd: row.get(14),
        capture_rate: row.get(15),
        small_opp_capture_rate: row.get(16),
        avg_competition_level: row.get(17),
    }
}

//================================================================================================//
//                                     TRAIT IMPLEMENTATION                                      //
//================================================================================================//

#[async_trait]
impl Persistence for DatabaseManager {
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<i64, PersistenceError> {
        self.with_retry("save_opportunity", || self.save_opportunity_once(opportunity))
            .await
    }

    async fn save_transaction(
        &self,
        transaction: &ArbitrageTransaction,
    ) -> Result<i64, PersistenceError> {
        self.with_retry("save_transaction", || self.save_transaction_once(transaction))
            .await
    }

    async fn upsert_arbitrageur(
        &self,
        observation: &ArbitrageurObservation,
    ) -> Result<(), PersistenceError> {
        self.with_retry("upsert_arbitrageur", || {
            self.upsert_arbitrageur_once(observation)
        })
        .await
    }

    async fn mark_opportunities_captured(
        &self,
        chain_id: u64,
        pools: &[String],
        min_block: u64,
        captured_by: &str,
        capture_tx_hash: &str,
    ) -> Result<u64, PersistenceError> {
        if pools.is_empty() {
            return Ok(0);
        }
        let pools: Vec<String> = pools.to_vec();
        let chain_id = chain_id as i64;
        let min_block = min_block as i64;
        let captured_by = captured_by.to_string();
        let capture_tx_hash = capture_tx_hash.to_string();

        self.with_retry("mark_opportunities_captured", || {
            let pools = pools.clone();
            let captured_by = captured_by.clone();
            let capture_tx_hash = capture_tx_hash.clone();
            async move {
                let client = self.pool.get().await?;
                let updated = client
                    .execute(
                        "UPDATE opportunities SET
                             captured = TRUE,
                             captured_by = $1,
                             capture_tx_hash = $2
                         WHERE chain_id = $3
                           AND NOT captured
                           AND pool_address = ANY($4)
                           AND block_number >= $5",
                        &[&captured_by, &capture_tx_hash, &chain_id, &pools, &min_block],
                    )
                    .await?;
                Ok(updated)
            }
        })
        .await
    }

    async fn update_chain_sync(
        &self,
        chain_id: u64,
        last_synced_block: u64,
        blocks_behind: i64,
    ) -> Result<(), PersistenceError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE chains SET
                     last_synced_block = $1,
                     blocks_behind = $2,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE chain_id = $3",
                &[
                    &(last_synced_block as i64),
                    &blocks_behind,
                    &(chain_id as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn hourly_opportunity_counts(
        &self,
        chain_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        small_min: Decimal,
        small_max: Decimal,
    ) -> Result<OpportunityCounts, PersistenceError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT
                     COUNT(*),
                     COUNT(*) FILTER (WHERE captured),
                     COUNT(*) FILTER (WHERE profit_usd >= $1 AND profit_usd <= $2),
                     COUNT(*) FILTER (WHERE captured AND profit_usd >= $1 AND profit_usd <= $2)
                 FROM opportunities
                 WHERE chain_id = $3 AND detected_at >= $4 AND detected_at < $5",
                &[&small_min, &small_max, &(chain_id as i64), &start, &end],
            )
            .await?;
        Ok(OpportunityCounts {
            total: row.get(0),
            captured: row.get(1),
            small: row.get(2),
            small_captured: row.get(3),
        })
    }

    async fn hourly_transaction_stats(
        &self,
        chain_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TransactionHourStats, PersistenceError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT
                     COUNT(*),
                     COUNT(DISTINCT from_address),
                     COALESCE(SUM(profit_net_usd), 0),
                     COALESCE(SUM(gas_cost_usd), 0),
                     AVG(profit_net_usd),
                     CAST(PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY profit_net_usd)
                          FILTER (WHERE profit_net_usd IS NOT NULL) AS NUMERIC),
                     MIN(profit_net_usd),
                     MAX(profit_net_usd),
                     CAST(PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY profit_net_usd)
                          FILTER (WHERE profit_net_usd IS NOT NULL) AS NUMERIC)
                 FROM transactions
                 WHERE chain_id = $1 AND detected_at >= $2 AND detected_at < $3",
                &[&(chain_id as i64), &start, &end],
            )
            .await?;
        Ok(TransactionHourStats {
            count: row.get(0),
            unique_arbitrageurs: row.get(1),
            total_profit_usd: row.get(2),
            total_gas_spent_usd: row.get(3),
            avg_profit_usd: row.get(4),
            median_profit_usd: row.get(5),
            min_profit_usd: row.get(6),
            max_profit_usd: row.get(7),
            p95_profit_usd: row.get(8),
        })
    }

    async fn upsert_chain_stat(&self, stat: &ChainStat) -> Result<(), PersistenceError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO chain_stats (
                     chain_id, hour_timestamp, opportunities_detected, opportunities_captured,
                     small_opportunities_count, small_opps_captured, transactions_detected,
                     unique_arbitrageurs, total_profit_usd, total_gas_spent_usd, avg_profit_usd,
                     median_profit_usd, min_profit_usd, max_profit_usd, p95_profit_usd,
                     capture_rate, small_opp_capture_rate, avg_competition_level
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                 ON CONFLICT (chain_id, hour_timestamp) DO UPDATE SET
                     opportunities_detected = EXCLUDED.opportunities_detected,
                     opportunities_captured = EXCLUDED.opportunities_captured,
                     small_opportunities_count = EXCLUDED.small_opportunities_count,
                     small_opps_captured = EXCLUDED.small_opps_captured,
                     transactions_detected = EXCLUDED.transactions_detected,
                     unique_arbitrageurs = EXCLUDED.unique_arbitrageurs,
                     total_profit_usd = EXCLUDED.total_profit_usd,
                     total_gas_spent_usd = EXCLUDED.total_gas_spent_usd,
                     avg_profit_usd = EXCLUDED.avg_profit_usd,
                     median_profit_usd = EXCLUDED.median_profit_usd,
                     min_profit_usd = EXCLUDED.min_profit_usd,
                     max_profit_usd = EXCLUDED.max_profit_usd,
                     p95_profit_usd = EXCLUDED.p95_profit_usd,
                     capture_rate = EXCLUDED.capture_rate,
                     small_opp_capture_rate = EXCLUDED.small_opp_capture_rate,
                     avg_competition_level = EXCLUDED.avg_competition_level",
                &[
                    &(stat.chain_id as i64),
                    &stat.hour_timestamp,
                    &stat.opportunities_detected,
                    &stat.opportunities_captured,
                    &stat.small_opportunities_count,
                    &stat.small_opps_captured,
                    &stat.transactions_detected,
                    &stat.unique_arbitrageurs,
                    &stat.total_profit_usd,
                    &stat.total_gas_spent_usd,
                    &stat.avg_profit_usd,
                    &stat.median_profit_usd,
                    &stat.min_profit_usd,
                    &stat.max_profit_usd,
                    &stat.p95_profit_usd,
                    &stat.capture_rate,
                    &stat.small_opp_capture_rate,
                    &stat.avg_competition_level,
                ],
            )
            .await?;
        Ok(())
    }
}
