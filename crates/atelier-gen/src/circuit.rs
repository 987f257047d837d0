//! Per-service circuit breakers
//!
//! ```text
//! CLOSED --K consecutive failures inside the window--> OPEN
//! OPEN   --cooldown elapsed, next allow()-----------> HALF_OPEN (one trial)
//! HALF_OPEN --trial succeeds--> CLOSED
//! HALF_OPEN --trial fails-----> OPEN
//! ```
//!
//! Each upstream model/provider pair gets its own breaker from a shared
//! `CircuitRegistry`, so one model's outage never blocks another.

use crate::config::CircuitBreakerConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Result of a guarded call as far as service health is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// Start of the current failure streak
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A failure gate for one upstream service
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: &CircuitBreakerConfig) -> Self {
        Self::with_timings(
            service,
            config.failure_threshold,
            Duration::from_secs(config.window_secs),
            Duration::from_secs(config.cooldown_secs),
        )
    }

    pub fn with_timings(service: &str, failure_threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            service: service.to_string(),
            failure_threshold: failure_threshold.max(1),
            window,
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state as an observer would see it. An open breaker whose
    /// cooldown has elapsed reports HALF_OPEN without claiming the trial.
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) if now.duration_since(opened) >= self.cooldown => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// May a call be issued now? In HALF_OPEN exactly one caller gets `true`
    /// until that trial's outcome is recorded.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|opened| now.duration_since(opened) >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(service = %self.service, "circuit half-open, sending trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record(&self, outcome: Outcome) {
        self.record_at(outcome, Instant::now())
    }

    pub fn record_at(&self, outcome: Outcome, now: Instant) {
        let mut inner = self.lock();
        match (inner.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
            }
            (CircuitState::Closed, Outcome::Failure) => {
                let in_window = inner
                    .streak_started
                    .map(|start| now.duration_since(start) <= self.window)
                    .unwrap_or(false);
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.consecutive_failures = 1;
                    inner.streak_started = Some(now);
                }
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.streak_started = None;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!(service = %self.service, "circuit closed after successful trial");
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                tracing::warn!(service = %self.service, "trial failed, circuit re-opened");
            }
            // Late results from calls issued before the breaker opened
            (CircuitState::Open, _) => {}
        }
    }

    /// Hand back a HALF_OPEN trial slot whose call never reached the service
    pub fn abandon(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.streak_started = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

/// Lazily creates one breaker per service identifier
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, &self.config)))
            .clone()
    }

    /// Every known breaker and its state, sorted by service
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::with_timings(
            "replicate:flux",
            3,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker();
        let t0 = Instant::now();

        for i in 0..2 {
            assert!(cb.allow_at(t0));
            cb.record_at(Outcome::Failure, t0 + Duration::from_secs(i));
        }
        assert_eq!(cb.state_at(t0), CircuitState::Closed);

        cb.record_at(Outcome::Failure, t0 + Duration::from_secs(2));
        assert_eq!(cb.state_at(t0 + Duration::from_secs(3)), CircuitState::Open);
        assert!(!cb.allow_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_success_resets_streak() {
        let cb = breaker();
        let t0 = Instant::now();
        cb.record_at(Outcome::Failure, t0);
        cb.record_at(Outcome::Failure, t0);
        cb.record_at(Outcome::Success, t0);
        cb.record_at(Outcome::Failure, t0);
        cb.record_at(Outcome::Failure, t0);
        assert_eq!(cb.state_at(t0), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let cb = breaker();
        let t0 = Instant::now();
        cb.record_at(Outcome::Failure, t0);
        cb.record_at(Outcome::Failure, t0 + Duration::from_secs(10));
        // Streak restarts: the window since the first failure has passed
        cb.record_at(Outcome::Failure, t0 + Duration::from_secs(90));
        assert_eq!(cb.state_at(t0 + Duration::from_secs(90)), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_at(Outcome::Failure, t0);
        }
        let after_cooldown = t0 + Duration::from_secs(31);

        assert_eq!(cb.state_at(after_cooldown), CircuitState::HalfOpen);
        assert!(cb.allow_at(after_cooldown));
        assert!(!cb.allow_at(after_cooldown));
        assert!(!cb.allow_at(after_cooldown + Duration::from_secs(1)));

        cb.record_at(Outcome::Success, after_cooldown + Duration::from_secs(2));
        assert_eq!(cb.state_at(after_cooldown), CircuitState::Closed);
        assert!(cb.allow_at(after_cooldown + Duration::from_secs(2)));
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_at(Outcome::Failure, t0);
        }
        let trial_at = t0 + Duration::from_secs(30);
        assert!(cb.allow_at(trial_at));
        cb.record_at(Outcome::Failure, trial_at);

        assert_eq!(cb.state_at(trial_at), CircuitState::Open);
        assert!(!cb.allow_at(trial_at + Duration::from_secs(29)));
        assert!(cb.allow_at(trial_at + Duration::from_secs(30)));
    }

    #[test]
    fn test_abandoned_trial_can_be_retaken() {
        let cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_at(Outcome::Failure, t0);
        }
        let trial_at = t0 + Duration::from_secs(31);
        assert!(cb.allow_at(trial_at));
        cb.abandon();
        assert!(cb.allow_at(trial_at));
        assert!(!cb.allow_at(trial_at));
    }

    #[test]
    fn test_registry_scopes_breakers_per_service() {
        let registry = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            window_secs: 60,
            cooldown_secs: 60,
        });
        registry.get("replicate:flux-schnell").record(Outcome::Failure);

        assert!(!registry.get("replicate:flux-schnell").allow());
        assert!(registry.get("replicate:sdxl").allow());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0], ("replicate:flux-schnell".to_string(), CircuitState::Open));
    }
}
