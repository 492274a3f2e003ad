// Circuit breaker
// One breaker per dependency (model, retriever, each tool). CLOSED trips to
// OPEN on consecutive failures or a rolling error ratio; OPEN cools down and
// admits a single HALF_OPEN probe; the probe result closes or re-opens with
// exponential cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally.
    Allow,
    /// Proceed as the single half-open probe; the next result decides the
    /// breaker's fate.
    Probe,
    /// Fail fast; the dependency is considered down.
    Reject,
}

#[derive(Debug)]
enum State {
    Closed {
        consecutive_failures: u32,
        // (ts_ms, ok) samples inside the rolling window.
        window: VecDeque<(u64, bool)>,
    },
    Open {
        until_ms: u64,
        cooldown_ms: u64,
    },
    HalfOpen {
        probe_in_flight: bool,
        cooldown_ms: u64,
    },
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
                window: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_kind(&self) -> BreakerStateKind {
        match *self.state.lock().expect("breaker poisoned") {
            State::Closed { .. } => BreakerStateKind::Closed,
            State::Open { .. } => BreakerStateKind::Open,
            State::HalfOpen { .. } => BreakerStateKind::HalfOpen,
        }
    }

    /// Ask to issue a call. Strictness only affects trip thresholds in
    /// `record_failure`, never admission itself.
    pub fn admit(&self) -> Admission {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().expect("breaker poisoned");
        match &mut *state {
            State::Closed { .. } => Admission::Allow,
            State::Open { until_ms, cooldown_ms } => {
                if now >= *until_ms {
                    let cooldown = *cooldown_ms;
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                        cooldown_ms: cooldown,
                    };
                    tracing::debug!(breaker = %self.name, "half-open probe admitted");
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            State::HalfOpen { probe_in_flight, .. } => {
                if *probe_in_flight {
                    Admission::Reject
                } else {
                    *probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().expect("breaker poisoned");
        match &mut *state {
            State::Closed {
                consecutive_failures,
                window,
            } => {
                *consecutive_failures = 0;
                window.push_back((now, true));
                Self::trim_window(window, now, self.config.window_secs);
            }
            State::HalfOpen { .. } => {
                tracing::info!(breaker = %self.name, "probe succeeded, closing");
                *state = State::Closed {
                    consecutive_failures: 0,
                    window: VecDeque::new(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self, strict: bool) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().expect("breaker poisoned");
        match &mut *state {
            State::Closed {
                consecutive_failures,
                window,
            } => {
                *consecutive_failures += 1;
                window.push_back((now, false));
                Self::trim_window(window, now, self.config.window_secs);

                let threshold = if strict {
                    (self.config.failure_threshold / 2).max(1)
                } else {
                    self.config.failure_threshold
                };
                let failures = window.iter().filter(|(_, ok)| !ok).count();
                let ratio = failures as f64 / window.len().max(1) as f64;
                let ratio_tripped =
                    window.len() >= threshold as usize && ratio >= self.config.error_ratio;

                if *consecutive_failures >= threshold || ratio_tripped {
                    let cooldown_ms = self.config.open_cooldown_secs * 1_000;
                    tracing::warn!(breaker = %self.name, failures = *consecutive_failures, "breaker opened");
                    *state = State::Open {
                        until_ms: now + cooldown_ms,
                        cooldown_ms,
                    };
                }
            }
            State::HalfOpen { cooldown_ms, .. } => {
                let next = (*cooldown_ms * 2).min(self.config.max_open_cooldown_secs * 1_000);
                tracing::warn!(breaker = %self.name, cooldown_ms = next, "probe failed, re-opening");
                *state = State::Open {
                    until_ms: now + next,
                    cooldown_ms: next,
                };
            }
            State::Open { .. } => {}
        }
    }

    fn trim_window(window: &mut VecDeque<(u64, bool)>, now: u64, window_secs: u64) {
        let cutoff = now.saturating_sub(window_secs * 1_000);
        while window.front().is_some_and(|(ts, _)| *ts < cutoff) {
            window.pop_front();
        }
    }
}

/// Shared registry handing out one breaker per dependency name.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn for_dependency(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            "model",
            BreakerConfig {
                failure_threshold: 5,
                error_ratio: 0.5,
                window_secs: 60,
                open_cooldown_secs: 10,
                max_open_cooldown_secs: 80,
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let clock = ManualClock::new(0);
        let breaker = breaker(&clock);
        for _ in 0..5 {
            assert_eq!(breaker.admit(), Admission::Allow);
            breaker.record_failure(false);
        }
        assert_eq!(breaker.state_kind(), BreakerStateKind::Open);
        assert_eq!(breaker.admit(), Admission::Reject);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let clock = ManualClock::new(0);
        let breaker = breaker(&clock);
        for _ in 0..5 {
            breaker.record_failure(false);
        }
        clock.advance(Duration::from_secs(11));
        assert_eq!(breaker.admit(), Admission::Probe);
        assert_eq!(breaker.admit(), Admission::Reject);
    }

    #[test]
    fn probe_success_closes() {
        let clock = ManualClock::new(0);
        let breaker = breaker(&clock);
        for _ in 0..5 {
            breaker.record_failure(false);
        }
        clock.advance(Duration::from_secs(11));
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_success();
        assert_eq!(breaker.state_kind(), BreakerStateKind::Closed);
        assert_eq!(breaker.admit(), Admission::Allow);
    }

    #[test]
    fn probe_failure_reopens_with_doubled_cooldown() {
        let clock = ManualClock::new(0);
        let breaker = breaker(&clock);
        for _ in 0..5 {
            breaker.record_failure(false);
        }
        clock.advance(Duration::from_secs(11));
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_failure(false);
        assert_eq!(breaker.state_kind(), BreakerStateKind::Open);

        // First cooldown was 10s; the re-open doubles it, so 11s is not enough.
        clock.advance(Duration::from_secs(11));
        assert_eq!(breaker.admit(), Admission::Reject);
        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.admit(), Admission::Probe);
    }

    #[test]
    fn strict_mode_halves_the_threshold() {
        let clock = ManualClock::new(0);
        let breaker = breaker(&clock);
        for _ in 0..2 {
            breaker.record_failure(true);
        }
        assert_eq!(breaker.state_kind(), BreakerStateKind::Open);
    }

    #[test]
    fn registry_reuses_breakers_per_name() {
        let clock = ManualClock::new(0);
        let registry = BreakerRegistry::new(BreakerConfig::default(), Arc::new(clock));
        let a = registry.for_dependency("tool:db_query");
        let b = registry.for_dependency("tool:db_query");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
