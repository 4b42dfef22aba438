//! # Chain Connector
//!
//! A robust, failover-capable, read-only interface to an EVM-compatible
//! blockchain.
//!
//! ## Core Responsibility
//!
//! This module's sole responsibility is to provide a clean, low-level
//! abstraction over the chain's JSON-RPC API. It handles:
//! -   Per-endpoint HTTP providers with independent health state.
//! -   Retry with exponential backoff and jitter.
//! -   Failover across the ordered endpoint list.
//! -   Per-endpoint circuit breaking (see `circuit_breaker`).
//! -   Short-lived receipt caching.
//!
//! It does **not** interpret chain data. Classification, decoding and
//! profit math live in the analyzer and the profit calculator.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::{
    Address, Block, BlockId, Bytes, Transaction, TransactionReceipt, TransactionRequest, H256,
};
use moka::future::Cache;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::{mask_url, ChainConfig};
use crate::errors::ConnectorError;
use crate::metrics;

//================================================================================================//
//                                         CONSTANTS                                             //
//================================================================================================//

/// Attempts per endpoint before failing over.
const MAX_ATTEMPTS_PER_ENDPOINT: u32 = 3;
/// Backoff after the n-th failed attempt: 1s, 2s, 4s.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_JITTER_FACTOR: f64 = 0.1;

const RECEIPT_CACHE_CAPACITY: u64 = 10_000;
const RECEIPT_CACHE_TTL: Duration = Duration::from_secs(60);

//================================================================================================//
//                                            TRAIT                                              //
//================================================================================================//

/// Read-only RPC surface consumed by the chain monitor and pool scanner.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain_name(&self) -> &str;
    fn chain_id(&self) -> u64;

    async fn latest_height(&self) -> Result<u64, ConnectorError>;
    async fn block_with_txs(&self, height: u64)
        -> Result<Option<Block<Transaction>>, ConnectorError>;
    async fn receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ConnectorError>;
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ConnectorError>;

    /// Per-endpoint breaker snapshots for the health/metrics surface.
    async fn endpoint_health(&self) -> Vec<CircuitBreakerStats>;
}

//================================================================================================//
//                                        IMPLEMENTATION                                         //
//================================================================================================//

struct Endpoint {
    url: String,
    provider: Arc<Provider<Http>>,
    breaker: CircuitBreaker,
}

/// Production connector over an ordered list of HTTP endpoints.
pub struct RpcConnector {
    chain_name: String,
    chain_id: u64,
    endpoints: Vec<Endpoint>,
    /// Index of the endpoint that served the last successful call.
    current: AtomicUsize,
    call_timeout: Duration,
    receipt_cache: Cache<H256, TransactionReceipt>,
}

impl RpcConnector {
    pub fn new(config: &ChainConfig) -> Result<Self, ConnectorError> {
        let mut endpoints = Vec::with_capacity(config.rpc_urls.len());
        for url in &config.rpc_urls {
            let provider = Provider::<Http>::try_from(url.as_str()).map_err(|e| {
                ConnectorError::Provider(format!("invalid endpoint {}: {}", mask_url(url), e))
            })?;
            endpoints.push(Endpoint {
                url: url.clone(),
                provider: Arc::new(provider),
                breaker: CircuitBreaker::with_defaults(url.clone()),
            });
        }
        if endpoints.is_empty() {
            return Err(ConnectorError::Provider(format!(
                "chain {} has no endpoints",
                config.chain_name
            )));
        }

        Ok(Self {
            chain_name: config.chain_name.clone(),
            chain_id: config.chain_id,
            endpoints,
            current: AtomicUsize::new(0),
            call_timeout: Duration::from_secs(config.rpc_timeout_secs),
            receipt_cache: Cache::builder()
                .max_capacity(RECEIPT_CACHE_CAPACITY)
                .time_to_live(RECEIPT_CACHE_TTL)
                .build(),
        })
    }

    /// Run `op` against the healthiest available endpoint, retrying up to
    /// three times per endpoint with 1s/2s/4s backoff before failing over.
    ///
    /// Transport and timeout errors count against the endpoint's breaker;
    /// protocol-level JSON-RPC errors and decode failures are returned to
    /// the caller immediately, since the endpoint itself answered.
    async fn execute<T, F, Fut>(&self, method: &str, op: F) -> Result<T, ConnectorError>
    where
        F: Fn(Arc<Provider<Http>>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let count = self.endpoints.len();
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error: Option<ConnectorError> = None;

        for offset in 0..count {
            let idx = (start + offset) % count;
            let endpoint = &self.endpoints[idx];

            if !endpoint.breaker.can_attempt().await {
                debug!(
                    target: "connector",
                    chain = %self.chain_name,
                    endpoint = %mask_url(&endpoint.url),
                    method,
                    "Endpoint circuit open, skipping"
                );
                continue;
            }

            for attempt in 1..=MAX_ATTEMPTS_PER_ENDPOINT {
                let started = std::time::Instant::now();
                match timeout(self.call_timeout, op(endpoint.provider.clone())).await {
                    Ok(Ok(value)) => {
                        endpoint.breaker.record_success().await;
                        self.current.store(idx, Ordering::Relaxed);
                        metrics::RPC_LATENCY
                            .with_label_values(&[&self.chain_name, method])
                            .observe(started.elapsed().as_secs_f64());
                        return Ok(value);
                    }
                    Ok(Err(provider_err)) => {
                        match classify(provider_err) {
                            // The node answered; this is not an endpoint-health event.
                            protocol @ (ConnectorError::Rpc { .. } | ConnectorError::Decode(_)) => {
                                return Err(protocol);
                            }
                            transport => {
                                endpoint.breaker.record_failure().await;
                                metrics::RPC_ERRORS
                                    .with_label_values(&[&self.chain_name, "transport"])
                                    .inc();
                                warn!(
                                    target: "connector",
                                    chain = %self.chain_name,
                                    endpoint = %mask_url(&endpoint.url),
                                    method,
                                    attempt,
                                    err = %transport,
                                    "RPC attempt failed"
                                );
                                last_error = Some(transport);
                            }
                        }
                    }
                    Err(_) => {
                        endpoint.breaker.record_failure().await;
                        metrics::RPC_ERRORS
                            .with_label_values(&[&self.chain_name, "timeout"])
                            .inc();
                        warn!(
                            target: "connector",
                            chain = %self.chain_name,
                            endpoint = %mask_url(&endpoint.url),
                            method,
                            attempt,
                            timeout_secs = self.call_timeout.as_secs(),
                            "RPC attempt timed out"
                        );
                        last_error = Some(ConnectorError::Timeout {
                            method: method.to_string(),
                            timeout_secs: self.call_timeout.as_secs(),
                        });
                    }
                }

                sleep(backoff_with_jitter(attempt)).await;

                // The breaker may have tripped mid-retry; stop hammering it.
                if !endpoint.breaker.can_attempt().await {
                    break;
                }
            }

            debug!(
                target: "connector",
                chain = %self.chain_name,
                endpoint = %mask_url(&endpoint.url),
                method,
                "Endpoint exhausted, failing over"
            );
        }

        Err(last_error.unwrap_or(ConnectorError::AllEndpointsUnavailable {
            chain: self.chain_name.clone(),
        }))
    }
}

/// Backoff after the n-th failed attempt (1-based): 1s, 2s, 4s, plus jitter
/// so parallel chains do not retry in lockstep.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_ms =
        (base.as_millis() as f64 * BACKOFF_JITTER_FACTOR * rand::thread_rng().gen::<f64>()) as u64;
    base + Duration::from_millis(jitter_ms)
}

/// Map an ethers provider error onto the connector error contract.
fn classify(err: ProviderError) -> ConnectorError {
    if let Some(rpc_err) = err.as_error_response() {
        return ConnectorError::Rpc {
            code: rpc_err.code,
            message: rpc_err.message.clone(),
        };
    }
    match err {
        ProviderError::SerdeJson(e) => ConnectorError::Decode(e.to_string()),
        other => ConnectorError::Provider(other.to_string()),
    }
}

#[async_trait]
impl ChainRpc for RpcConnector {
    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_height(&self) -> Result<u64, ConnectorError> {
        let height = self
            .execute("eth_blockNumber", |provider| async move {
                provider.get_block_number().await
            })
            .await?;
        Ok(height.as_u64())
    }

    async fn block_with_txs(
        &self,
        height: u64,
    ) -> Result<Option<Block<Transaction>>, ConnectorError> {
        self.execute("eth_getBlockByNumber", |provider| async move {
            provider.get_block_with_txs(BlockId::from(height)).await
        })
        .await
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ConnectorError> {
        if let Some(cached) = self.receipt_cache.get(&tx_hash).await {
            return Ok(Some(cached));
        }
        let receipt = self
            .execute("eth_getTransactionReceipt", |provider| async move {
                provider.get_transaction_receipt(tx_hash).await
            })
            .await?;
        if let Some(ref r) = receipt {
            self.receipt_cache.insert(tx_hash, r.clone()).await;
        }
        Ok(receipt)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ConnectorError> {
        self.execute("eth_call", move |provider| {
            let data = data.clone();
            async move {
                let tx = TransactionRequest::new().to(to).data(data);
                provider.call(&tx.into(), None).await
            }
        })
        .await
    }

    async fn endpoint_health(&self) -> Vec<CircuitBreakerStats> {
        let mut stats = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            stats.push(endpoint.breaker.stats().await);
        }
        stats
    }
}

impl std::fmt::Debug for RpcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnector")
            .field("chain_name", &self.chain_name)
            .field("chain_id", &self.chain_id)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let first = backoff_with_jitter(1);
        let second = backoff_with_jitter(2);
        let third = backoff_with_jitter(3);
        assert!(first >= Duration::from_secs(1));
        assert!(second >= Duration::from_secs(2));
        assert!(third >= Duration::from_secs(4));
        // Jitter is bounded at 10%.
        assert!(third < Duration::from_millis(4_400 + 1));
    }
}
