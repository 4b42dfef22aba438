//! Per-endpoint circuit breaker for the chain connector.
//!
//! An endpoint trips open after a run of consecutive failures, rejects use
//! for a cooldown period without performing any I/O, then admits a single
//! half-open trial. A successful trial closes the breaker and resets the
//! counter; a failed trial re-opens it for another full cooldown.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failures exceeded the threshold; calls are rejected.
    Open,
    /// Cooldown elapsed; exactly one trial request is admitted.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial is outstanding.
    trial_in_flight: bool,
    trips: u64,
    total_failures: u64,
    total_successes: u64,
}

/// Circuit breaker guarding one RPC endpoint.
pub struct CircuitBreaker {
    endpoint: String,
    state: Mutex<BreakerState>,
    failure_threshold: u64,
    cooldown: Duration,
}

pub const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, failure_threshold: u64, cooldown: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                trips: 0,
                total_failures: 0,
                total_successes: 0,
            }),
            failure_threshold,
            cooldown,
        }
    }

    pub fn with_defaults(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    /// Whether a call may be attempted right now.
    ///
    /// Transitions `Open -> HalfOpen` once the cooldown has elapsed and
    /// admits exactly one trial in the half-open state; every other call is
    /// rejected without touching the network.
    pub async fn can_attempt(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    info!(
                        target: "circuit_breaker",
                        endpoint = %self.endpoint,
                        "Circuit breaker half-open, admitting trial request"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker and resets the counter.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.total_successes = state.total_successes.saturating_add(1);
        state.consecutive_failures = 0;
        state.trial_in_flight = false;
        if state.state != CircuitState::Closed {
            info!(
                target: "circuit_breaker",
                endpoint = %self.endpoint,
                "Circuit breaker closed after successful call"
            );
        }
        state.state = CircuitState::Closed;
        state.opened_at = None;
    }

    /// Record a failed call. Trips the breaker when the consecutive-failure
    /// threshold is reached; a failure during the half-open trial re-opens
    /// it immediately for another cooldown.
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.total_failures = state.total_failures.saturating_add(1);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                warn!(
                    target: "circuit_breaker",
                    endpoint = %self.endpoint,
                    "Half-open trial failed, re-opening circuit"
                );
            }
            CircuitState::Closed => {
                if state.consecutive_failures >= self.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    state.trips = state.trips.saturating_add(1);
                    warn!(
                        target: "circuit_breaker",
                        endpoint = %self.endpoint,
                        consecutive_failures = state.consecutive_failures,
                        trips = state.trips,
                        "Circuit breaker opened"
                    );
                } else {
                    debug!(
                        target: "circuit_breaker",
                        endpoint = %self.endpoint,
                        consecutive_failures = state.consecutive_failures,
                        threshold = self.failure_threshold,
                        "Recorded failure"
                    );
                }
            }
            CircuitState::Open => {
                // Failures recorded while already open keep the window fresh.
                state.opened_at = Some(Instant::now());
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        CircuitBreakerStats {
            endpoint: self.endpoint.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            trips: state.trips,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Point-in-time breaker snapshot for health/metrics adapters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub trips: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}
