//! # Centralized Error Handling
//!
//! Hierarchical, typed errors for the whole monitor. Every component owns a
//! domain enum; `MonitorError` is the top-level type that `main` and the
//! task supervisors see. String-based errors are confined to the leaves
//! where the underlying library only offers strings.

use thiserror::Error;

/// The top-level error type, encapsulating all failures within the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Chain connector error: {0}")]
    Connector(#[from] ConnectorError),
    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Broadcast hub error: {0}")]
    Hub(#[from] HubError),
    #[error("Infrastructure setup error: {0}")]
    Infrastructure(String),
    #[error("System shut down")]
    Shutdown,
}

/// Errors surfaced by the chain connector (C1).
///
/// All of these are recoverable from the caller's point of view: the
/// connector never aborts the process, it reports and lets the monitor
/// loop decide whether to retry on the next tick.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Every configured endpoint is either circuit-open or exhausted its retries.
    #[error("all RPC endpoints unavailable for chain {chain}")]
    AllEndpointsUnavailable { chain: String },
    /// A single RPC attempt exceeded its deadline.
    #[error("RPC call timed out after {timeout_secs}s: {method}")]
    Timeout { method: String, timeout_secs: u64 },
    /// Protocol-level JSON-RPC error returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The node answered but the payload could not be decoded.
    #[error("failed to decode RPC response: {0}")]
    Decode(String),
    /// Transport-level provider failure (connection refused, 5xx, ...).
    #[error("provider error: {0}")]
    Provider(String),
}

/// Errors from transaction analysis and swap-log decoding (C2/C3).
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("malformed swap log at index {log_index}: {reason}")]
    MalformedLog { log_index: u64, reason: String },
    /// A swap sequence reached the profit calculator with fewer than two
    /// entries. This indicates a classification bug upstream, not bad
    /// chain data.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("numeric conversion overflow: {0}")]
    NumericOverflow(String),
}

/// Errors from the persistence gateway (C9).
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("schema bootstrap failed: {0}")]
    Schema(String),
    #[error("database operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("invalid database URL: {0}")]
    InvalidUrl(String),
}

impl From<tokio_postgres::Error> for PersistenceError {
    fn from(e: tokio_postgres::Error) -> Self {
        PersistenceError::Query(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for PersistenceError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        PersistenceError::Pool(e.to_string())
    }
}

/// Errors from the broadcast hub (C8).
#[derive(Error, Debug)]
pub enum HubError {
    #[error("subscriber capacity reached ({capacity})")]
    AtCapacity { capacity: usize },
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("duplicate chain_id {0}")]
    DuplicateChainId(u64),
    #[error("invalid address '{address}' for {what}")]
    InvalidAddress { what: String, address: String },
}
