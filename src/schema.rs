//! Idempotent database schema for the monitor.
//!
//! Executed in one batch at startup. Every statement is `IF NOT EXISTS`
//! so repeated boots (and crash-restart loops) are harmless.

pub const SCHEMA_SQL: &str = r#"
-- Chains registry: configuration echo plus sync bookkeeping
CREATE TABLE IF NOT EXISTS chains (
    id SERIAL PRIMARY KEY,
    name VARCHAR(50) NOT NULL UNIQUE,
    chain_id BIGINT NOT NULL UNIQUE,
    block_time_seconds DECIMAL(6, 2) NOT NULL,
    native_token VARCHAR(10) NOT NULL,
    native_token_usd DECIMAL(18, 8) NOT NULL,
    last_synced_block BIGINT DEFAULT 0,
    blocks_behind BIGINT DEFAULT 0,
    status VARCHAR(20) DEFAULT 'active',
    created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
    CONSTRAINT chains_status_check CHECK (status IN ('active', 'inactive', 'error'))
);

-- Detected pool imbalances
CREATE TABLE IF NOT EXISTS opportunities (
    id BIGSERIAL PRIMARY KEY,
    chain_id BIGINT NOT NULL REFERENCES chains(chain_id) ON DELETE CASCADE,
    pool_label VARCHAR(100) NOT NULL,
    pool_address VARCHAR(42) NOT NULL,
    imbalance_pct DECIMAL(18, 8) NOT NULL,
    profit_usd DECIMAL(24, 8) NOT NULL,
    profit_native DECIMAL(38, 8) NOT NULL,
    reserve0 DECIMAL(60, 0) NOT NULL,
    reserve1 DECIMAL(60, 0) NOT NULL,
    block_number BIGINT NOT NULL,
    detected_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
    captured BOOLEAN NOT NULL DEFAULT FALSE,
    captured_by VARCHAR(42),
    capture_tx_hash VARCHAR(66),
    CONSTRAINT opportunities_imbalance_check CHECK (imbalance_pct >= 0),
    CONSTRAINT opportunities_profit_check CHECK (profit_usd >= 0)
);

-- Confirmed multi-hop arbitrage transactions
CREATE TABLE IF NOT EXISTS transactions (
    id BIGSERIAL PRIMARY KEY,
    chain_id BIGINT NOT NULL REFERENCES chains(chain_id) ON DELETE CASCADE,
    tx_hash VARCHAR(66) NOT NULL,
    from_address VARCHAR(42) NOT NULL,
    block_number BIGINT NOT NULL,
    block_timestamp TIMESTAMP WITH TIME ZONE NOT NULL,
    gas_price_gwei DECIMAL(18, 8) NOT NULL,
    gas_used BIGINT NOT NULL,
    gas_cost_native DECIMAL(18, 8) NOT NULL,
    gas_cost_usd DECIMAL(18, 8) NOT NULL,
    swap_count INTEGER NOT NULL,
    strategy VARCHAR(20) NOT NULL,
    profit_gross_usd DECIMAL(38, 8),
    profit_net_usd DECIMAL(38, 8),
    pools_involved TEXT[] NOT NULL,
    tokens_involved TEXT[] NOT NULL,
    detected_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
    CONSTRAINT transactions_tx_hash_unique UNIQUE (chain_id, tx_hash),
    CONSTRAINT transactions_swap_count_check CHECK (swap_count >= 2),
    CONSTRAINT transactions_strategy_check CHECK (
        strategy IN ('2-hop', '3-hop', '4-hop', 'N-hop')
    )
);

-- Per-address cumulative statistics
CREATE TABLE IF NOT EXISTS arbitrageurs (
    id BIGSERIAL PRIMARY KEY,
    address VARCHAR(42) NOT NULL,
    chain_id BIGINT NOT NULL REFERENCES chains(chain_id) ON DELETE CASCADE,
    first_seen TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_seen TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
    total_transactions BIGINT NOT NULL DEFAULT 0,
    successful_transactions BIGINT NOT NULL DEFAULT 0,
    failed_transactions BIGINT NOT NULL DEFAULT 0,
    total_profit_usd DECIMAL(38, 8) NOT NULL DEFAULT 0,
    total_gas_spent_usd DECIMAL(38, 8) NOT NULL DEFAULT 0,
    avg_gas_price_gwei DECIMAL(18, 8) NOT NULL DEFAULT 0,
    preferred_strategy VARCHAR(20),
    strategy_counts JSONB NOT NULL DEFAULT '{}',
    CONSTRAINT arbitrageurs_address_chain_unique UNIQUE (address, chain_id),
    CONSTRAINT arbitrageurs_transactions_check CHECK (
        total_transactions = successful_transactions + failed_transactions
    ),
    CONSTRAINT arbitrageurs_profit_check CHECK (total_profit_usd >= 0),
    CONSTRAINT arbitrageurs_seen_check CHECK (first_seen <= last_seen)
);

-- Hourly aggregation buckets
CREATE TABLE IF NOT EXISTS chain_stats (
    id BIGSERIAL PRIMARY KEY,
    chain_id BIGINT NOT NULL REFERENCES chains(chain_id) ON DELETE CASCADE,
    hour_timestamp TIMESTAMP WITH TIME ZONE NOT NULL,
    opportunities_detected BIGINT NOT NULL DEFAULT 0,
    opportunities_captured BIGINT NOT NULL DEFAULT 0,
    small_opportunities_count BIGINT NOT NULL DEFAULT 0,
    small_opps_captured BIGINT NOT NULL DEFAULT 0,
    transactions_detected BIGINT NOT NULL DEFAULT 0,
    unique_arbitrageurs BIGINT NOT NULL DEFAULT 0,
    total_profit_usd DECIMAL(38, 8) NOT NULL DEFAULT 0,
    total_gas_spent_usd DECIMAL(38, 8) NOT NULL DEFAULT 0,
    avg_profit_usd DECIMAL(38, 8),
    median_profit_usd DECIMAL(38, 8),
    min_profit_usd DECIMAL(38, 8),
    max_profit_usd DECIMAL(38, 8),
    p95_profit_usd DECIMAL(38, 8),
    capture_rate DECIMAL(5, 2),
    small_opp_capture_rate DECIMAL(5, 2),
    avg_competition_level DECIMAL(18, 4),
    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
    CONSTRAINT chain_stats_hour_chain_unique UNIQUE (chain_id, hour_timestamp),
    CONSTRAINT chain_stats_rates_check CHECK (
        (capture_rate IS NULL OR (capture_rate >= 0 AND capture_rate <= 100)) AND
        (small_opp_capture_rate IS NULL OR (small_opp_capture_rate >= 0 AND small_opp_capture_rate <= 100))
    )
);

-- Co-located archive target for the external retention job
CREATE TABLE IF NOT EXISTS transactions_archive (
    LIKE transactions INCLUDING DEFAULTS,
    archived_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Index set for the expected query shapes

CREATE INDEX IF NOT EXISTS idx_opportunities_chain_block
    ON opportunities (chain_id, block_number DESC);
CREATE INDEX IF NOT EXISTS idx_opportunities_chain_detected
    ON opportunities (chain_id, detected_at DESC);
CREATE INDEX IF NOT EXISTS idx_opportunities_profit
    ON opportunities (profit_usd DESC);
CREATE INDEX IF NOT EXISTS idx_opportunities_open_pool
    ON opportunities (chain_id, pool_address) WHERE NOT captured;

CREATE INDEX IF NOT EXISTS idx_transactions_chain_block
    ON transactions (chain_id, block_number DESC);
CREATE INDEX IF NOT EXISTS idx_transactions_chain_detected
    ON transactions (chain_id, detected_at DESC);
CREATE INDEX IF NOT EXISTS idx_transactions_from_detected
    ON transactions (from_address, detected_at DESC);
CREATE INDEX IF NOT EXISTS idx_transactions_profit
    ON transactions (profit_net_usd DESC NULLS LAST);

CREATE INDEX IF NOT EXISTS idx_arbitrageurs_profit
    ON arbitrageurs (total_profit_usd DESC);
CREATE INDEX IF NOT EXISTS idx_arbitrageurs_last_seen
    ON arbitrageurs (last_seen DESC);

CREATE INDEX IF NOT EXISTS idx_chain_stats_chain_hour
    ON chain_stats (chain_id, hour_timestamp DESC);
"#;
