use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive transient failures that trip the breaker.
    pub failure_threshold: u32,
    pub cooldown_ms: i64,
    /// Probe requests admitted at once while half-open.
    pub half_open_max_probes: u32,
    /// Probe successes needed to close again.
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_max_probes: 3,
            half_open_success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: i64,
    probes_in_flight: u32,
    probe_successes: u32,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(mut cfg: BreakerConfig) -> Self {
        cfg.failure_threshold = cfg.failure_threshold.max(1);
        cfg.cooldown_ms = cfg.cooldown_ms.max(0);
        cfg.half_open_max_probes = cfg.half_open_max_probes.max(1);
        cfg.half_open_success_threshold = cfg
            .half_open_success_threshold
            .clamp(1, cfg.half_open_max_probes.max(1).saturating_mul(16));
        Self {
            cfg,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at_ms: 0,
            probes_in_flight: 0,
            probe_successes: 0,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Admit a request or return how long until the next probe window.
    pub fn try_acquire(&mut self, now_ms: i64) -> Result<Permit, i64> {
        if self.state == CircuitState::Open {
            let elapsed = now_ms.saturating_sub(self.opened_at_ms);
            if elapsed < self.cfg.cooldown_ms {
                return Err(self.cfg.cooldown_ms - elapsed);
            }
            self.state = CircuitState::HalfOpen;
            self.probes_in_flight = 0;
            self.probe_successes = 0;
            tracing::info!("circuit half-open; admitting probes");
        }

        match self.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::HalfOpen => {
                if self.probes_in_flight >= self.cfg.half_open_max_probes {
                    return Err(0);
                }
                self.probes_in_flight += 1;
                Ok(Permit::Probe)
            }
            CircuitState::Open => Err(self.cfg.cooldown_ms),
        }
    }

    pub fn on_success(&mut self, permit: Permit) {
        match (self.state, permit) {
            (CircuitState::HalfOpen, Permit::Probe) => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                self.probe_successes += 1;
                if self.probe_successes >= self.cfg.half_open_success_threshold {
                    self.close();
                }
            }
            (CircuitState::Closed, _) => {
                self.consecutive_failures = 0;
            }
            // a late probe result after the breaker re-opened does not count
            _ => self.release(permit),
        }
    }

    pub fn on_failure(&mut self, permit: Permit, now_ms: i64) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.cfg.failure_threshold {
                    self.open(now_ms);
                }
            }
            CircuitState::HalfOpen => {
                self.release(permit);
                self.open(now_ms);
            }
            CircuitState::Open => self.release(permit),
        }
    }

    /// Give back a permit without judging the endpoint (e.g. a permanent request error).
    pub fn release(&mut self, permit: Permit) {
        if permit == Permit::Probe {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    fn open(&mut self, now_ms: i64) {
        self.state = CircuitState::Open;
        self.opened_at_ms = now_ms;
        self.probes_in_flight = 0;
        self.probe_successes = 0;
        self.times_opened = self.times_opened.saturating_add(1);
        tracing::warn!(
            failures = self.consecutive_failures,
            cooldown_ms = self.cfg.cooldown_ms,
            "circuit opened"
        );
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probes_in_flight = 0;
        self.probe_successes = 0;
        tracing::info!("circuit closed");
    }
}
