//! Per-worker circuit breakers.
//!
//! A worker slot that keeps failing stops receiving work for a while. Time
//! is measured in waves rather than wall clock since the scheduler only
//! hands out work at wave boundaries.

use crate::orchestration::worker::WorkerId;
use crate::{clog, clog_warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Waves a circuit stays open before a trial assignment.
    pub open_waves: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_waves: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    waves_open: u32,
    open_count: u32,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            waves_open: 0,
            open_count: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    /// Whether this worker may take an assignment.
    pub fn allows(&self) -> bool {
        self.state != CircuitState::Open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            self.state = CircuitState::Closed;
        }
    }

    pub fn record_failure(&mut self, config: &BreakerConfig) {
        self.consecutive_failures += 1;
        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.state = CircuitState::Open;
            self.waves_open = 0;
            self.open_count += 1;
        }
    }

    /// Advance one wave. An open circuit becomes half-open once it has sat
    /// out `open_waves` waves.
    pub fn tick(&mut self, config: &BreakerConfig) {
        if self.state == CircuitState::Open {
            if self.waves_open >= config.open_waves {
                self.state = CircuitState::HalfOpen;
            } else {
                self.waves_open += 1;
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Breakers for every worker slot seen this session.
#[derive(Debug, Clone, Default)]
pub struct BreakerBoard {
    config: BreakerConfig,
    breakers: HashMap<WorkerId, CircuitBreaker>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    pub fn allows(&self, worker: &WorkerId) -> bool {
        self.breakers.get(worker).map_or(true, CircuitBreaker::allows)
    }

    pub fn state(&self, worker: &WorkerId) -> CircuitState {
        self.breakers
            .get(worker)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    pub fn record_success(&mut self, worker: &WorkerId) {
        if let Some(breaker) = self.breakers.get_mut(worker) {
            if breaker.state() != CircuitState::Closed {
                clog!("Circuit for {} closed", worker);
            }
            breaker.record_success();
        }
    }

    pub fn record_failure(&mut self, worker: &WorkerId) {
        let breaker = self.breakers.entry(worker.clone()).or_default();
        let before = breaker.state();
        breaker.record_failure(&self.config);
        if before != CircuitState::Open && breaker.state() == CircuitState::Open {
            clog_warn!("Circuit for {} opened after repeated failures", worker);
        }
    }

    /// Called once at the start of every wave.
    pub fn tick(&mut self) {
        for breaker in self.breakers.values_mut() {
            breaker.tick(&self.config);
        }
    }
}
