// crates/quorum-engines/src/circuit_breaker.rs

//! Per-provider failure isolation.
//!
//! CLOSED allows calls and counts retryable failures; at the threshold the
//! breaker OPENs and rejects everything without touching the network. After
//! the recovery timeout a single HALF_OPEN probe is let through: success
//! closes the breaker, failure re-opens it and restarts the timer.
//! Non-retryable failures (bad credentials, malformed requests) never count;
//! the caller simply does not record them here.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Retryable failures before the breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker rejects before allowing a probe
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// In HALF_OPEN exactly one caller gets `true` until its outcome is
    /// recorded; an OPEN breaker past its recovery timeout transitions to
    /// HALF_OPEN and admits that single probe.
    pub fn allow_request(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    debug!("breaker {}: OPEN -> HALF_OPEN probe", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state != CircuitState::Closed {
                debug!("breaker {}: {:?} -> CLOSED", self.name, inner.state);
            }
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.probe_in_flight = false;
        }
    }

    /// Record a retryable failure. Callers must not report non-retryable
    /// errors here.
    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_failure_at = Some(Instant::now());
            match inner.state {
                CircuitState::HalfOpen => {
                    warn!("breaker {}: probe failed, reopening", self.name);
                    inner.state = CircuitState::Open;
                    inner.probe_in_flight = false;
                }
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        warn!(
                            "breaker {}: opening after {} failures",
                            self.name, inner.failure_count
                        );
                        inner.state = CircuitState::Open;
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(CircuitState::Open)
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().map(|inner| inner.failure_count).unwrap_or(0)
    }

    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.last_failure_at = None;
            inner.probe_in_flight = false;
        }
    }
}

/// Lazily constructed breakers keyed by provider id. Breakers live for the
/// process lifetime.
pub struct CircuitBreakerRegistry {
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, id: &str) -> Arc<CircuitBreaker> {
        let config = self.default_config.clone();
        self.get_or_create_with(id, config)
    }

    pub fn get_or_create_with(&self, id: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Ok(breakers) = self.breakers.read() {
            if let Some(breaker) = breakers.get(id) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = match self.breakers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            breakers
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(id, config))),
        )
    }

    /// Snapshot of every breaker's state.
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .map(|breakers| {
                breakers
                    .iter()
                    .map(|(id, breaker)| (id.clone(), breaker.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn reset_all(&self) {
        if let Ok(breakers) = self.breakers.read() {
            for breaker in breakers.values() {
                breaker.reset();
            }
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
