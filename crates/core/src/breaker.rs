use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing one trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(60) }
    }
}

/// Observability snapshot; serialized out through the admin surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub success_count: u64,
    pub failure_count: u64,
    pub transition_count: u64,
    pub last_transition_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("circuit breaker is open; inference backend calls are failing fast")]
pub struct BreakerOpen;

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    transition_count: u64,
    last_transition_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state breaker around the inference backend. Injected as a shared
/// component (wrap in `Arc`); internal state is kept consistent under a
/// single mutex so concurrent callers see one coherent counter set.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                success_count: 0,
                failure_count: 0,
                transition_count: 0,
                last_transition_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask permission to call the backend. While open, fails fast without
    /// touching the network; after the cooldown exactly one trial call is
    /// admitted (half-open).
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.lock();

        if inner.state == BreakerState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed >= self.config.cooldown {
                transition(&mut inner, BreakerState::HalfOpen);
                inner.probe_in_flight = false;
            } else {
                return Err(BreakerOpen);
            }
        }

        if inner.state == BreakerState::HalfOpen {
            if inner.probe_in_flight {
                return Err(BreakerOpen);
            }
            inner.probe_in_flight = true;
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count += 1;
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                transition(&mut inner, BreakerState::Closed);
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                transition(&mut inner, BreakerState::Open);
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        BreakerMetrics {
            state: inner.state,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            transition_count: inner.transition_count,
            last_transition_at: inner.last_transition_at,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn transition(inner: &mut BreakerInner, to: BreakerState) {
    inner.state = to;
    inner.transition_count += 1;
    inner.last_transition_at = Some(Utc::now());
}
