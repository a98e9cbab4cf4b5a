//! Circuit Breaker Pattern
//!
//! Fails fast on providers that keep failing. A breaker opens after
//! `failure_threshold` consecutive failures, rejects every call with
//! `CIRCUIT_OPEN` until the cooldown elapses, then admits exactly one trial
//! call. The trial's outcome closes or re-opens the circuit.
//!
//! All state for one provider sits behind a single mutex, so transitions and
//! the failure counter are linearizable and only one half-open trial can be
//! in flight.

use crate::store::{SharedStore, key_for};
use crate::tools::{ErrorCode, ToolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit open - requests are rejected
    Open,
    /// Cooldown elapsed, a single trial request is allowed
    HalfOpen,
}

impl CircuitState {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the most recent half-open trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Success,
    Failure,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to wait in `open` before admitting a trial
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a sensitive config (opens quickly)
    pub fn sensitive() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(15),
        }
    }

    /// Create a tolerant config (takes more failures to open)
    pub fn tolerant() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(60),
        }
    }

    /// Builder: set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Builder: set cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    last_trial: Option<TrialOutcome>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            trial_in_flight: false,
            last_trial: None,
        }
    }

    fn cooldown_remaining(&self, cooldown: Duration) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(cooldown.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        }
    }
}

/// What is persisted per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerSnapshot {
    provider: String,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_trial: Option<TrialOutcome>,
    opened_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSummary {
    /// Provider ID
    pub provider: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted while closed
    pub consecutive_failures: u32,
    /// Configured threshold
    pub failure_threshold: u32,
    /// When the last failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent half-open trial
    pub last_trial: Option<TrialOutcome>,
    /// Time left before a trial is admitted
    #[serde(with = "humantime_serde")]
    pub cooldown_remaining: Option<Duration>,
}

/// Circuit breaker for one provider
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    store: Option<SharedStore>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
            store: None,
        }
    }

    /// Create with default config
    pub fn default_config(provider: impl Into<String>) -> Self {
        Self::new(provider, CircuitBreakerConfig::default())
    }

    /// Provider this breaker guards
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state.
    ///
    /// An open circuit reports `open` until the next acquire after the
    /// cooldown moves it to `half_open`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted while closed
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Summary for presentation
    pub fn summary(&self) -> BreakerSummary {
        let state = self.lock();
        BreakerSummary {
            provider: self.provider.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: state.last_failure_at,
            last_trial: state.last_trial,
            cooldown_remaining: state.cooldown_remaining(self.config.cooldown),
        }
    }

    /// Ask to make one call.
    ///
    /// Fails with `CIRCUIT_OPEN` while open (carrying the remaining cooldown
    /// as `retry_after`) and while a half-open trial is already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, ToolError> {
        let mut state = self.lock();

        if state.state == CircuitState::Open {
            let remaining = state
                .cooldown_remaining(self.config.cooldown)
                .unwrap_or_default();
            if !remaining.is_zero() {
                tracing::debug!(provider = %self.provider, "Circuit open, failing fast");
                return Err(self.open_error(Some(remaining)));
            }
            state.state = CircuitState::HalfOpen;
            state.trial_in_flight = false;
            tracing::info!(provider = %self.provider, "Circuit half-open, admitting trial");
            self.persist(&state);
        }

        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if state.trial_in_flight => {
                tracing::debug!(provider = %self.provider, "Half-open trial already in flight");
                return Err(self.open_error(None));
            }
            CircuitState::HalfOpen => {
                state.trial_in_flight = true;
                true
            }
            CircuitState::Open => return Err(self.open_error(None)),
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            done: false,
        })
    }

    /// Run `operation` under a permit, recording its outcome
    pub async fn call<F, Fut, T>(self: &Arc<Self>, operation: F) -> Result<T, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = BreakerState::closed();
        tracing::info!(provider = %self.provider, "Circuit reset");
        self.persist(&state);
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen if trial => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                state.trial_in_flight = false;
                state.last_trial = Some(TrialOutcome::Success);
                tracing::info!(provider = %self.provider, "Trial succeeded, circuit closed");
            }
            CircuitState::Closed => state.consecutive_failures = 0,
            // Late completions of calls admitted before the circuit opened
            _ => return,
        }
        self.persist(&state);
    }

    fn on_failure(&self, trial: bool) {
        let mut state = self.lock();
        state.last_failure_at = Some(Utc::now());
        match state.state {
            CircuitState::HalfOpen if trial => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                state.last_trial = Some(TrialOutcome::Failure);
                tracing::warn!(provider = %self.provider, "Trial failed, circuit re-opened");
            }
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    tracing::warn!(
                        provider = %self.provider,
                        failures = state.consecutive_failures,
                        cooldown = ?self.config.cooldown,
                        "Circuit opened"
                    );
                }
            }
            _ => {}
        }
        self.persist(&state);
    }

    fn release_trial(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen {
            state.trial_in_flight = false;
            tracing::debug!(provider = %self.provider, "Abandoned trial released");
        }
    }

    fn open_error(&self, retry_after: Option<Duration>) -> ToolError {
        let mut error = ToolError::new(
            ErrorCode::CircuitOpen,
            format!("Circuit for provider '{}' is open", self.provider),
        )
        .with_context(serde_json::json!({ "provider": self.provider }));
        if let Some(delay) = retry_after {
            error = error.with_retry_after(delay);
        }
        error
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &BreakerState) {
        let Some(store) = &self.store else {
            return;
        };
        let opened_at = state.opened_at.map(|at| {
            let elapsed = chrono::Duration::from_std(at.elapsed()).unwrap_or_default();
            Utc::now() - elapsed
        });
        let snapshot = BreakerSnapshot {
            provider: self.provider.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure_at: state.last_failure_at,
            last_trial: state.last_trial,
            opened_at,
        };
        let result = serde_json::to_value(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                store
                    .put(&key_for("breaker", &self.provider), &value)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            tracing::warn!(provider = %self.provider, error = %e, "Failed to persist breaker state");
        }
    }

    fn restore(&self, snapshot: BreakerSnapshot) {
        let mut state = self.lock();
        state.consecutive_failures = snapshot.consecutive_failures;
        state.last_failure_at = snapshot.last_failure_at;
        state.last_trial = snapshot.last_trial;
        // A half-open trial interrupted by a restart is simply retried
        state.state = snapshot.state;
        if state.state == CircuitState::Open {
            let elapsed = snapshot
                .opened_at
                .and_then(|at| (Utc::now() - at).to_std().ok())
                .unwrap_or_default();
            let now = Instant::now();
            state.opened_at = Some(now.checked_sub(elapsed).unwrap_or(now));
        }
    }
}

/// Permission to make one call through a breaker.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping a half-open trial permit without
/// reporting frees the trial slot and leaves the state unchanged.
#[must_use = "a permit must report its outcome"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    done: bool,
}

impl std::fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("provider", &self.breaker.provider)
            .field("trial", &self.trial)
            .finish()
    }
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.done = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed call
    pub fn failure(mut self) {
        self.done = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.done && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Breakers keyed by provider ID
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    store: Option<SharedStore>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl BreakerRegistry {
    /// Create a registry handing out breakers with `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Persist breaker state to a durable store
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `provider`, created (or restored) on first use
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(breaker) = breakers.get(provider) {
            return Arc::clone(breaker);
        }

        let mut breaker = CircuitBreaker::new(provider, self.config.clone());
        breaker.store = self.store.clone();
        if let Some(snapshot) = self.load(provider) {
            breaker.restore(snapshot);
        }
        let breaker = Arc::new(breaker);
        breakers.insert(provider.to_string(), Arc::clone(&breaker));
        breaker
    }

    fn load(&self, provider: &str) -> Option<BreakerSnapshot> {
        let store = self.store.as_ref()?;
        match store.get(&key_for("breaker", provider)) {
            Ok(Some(value)) => serde_json::from_value(value)
                .map_err(|e| {
                    tracing::warn!(provider, error = %e, "Ignoring unreadable breaker state");
                })
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(provider, error = %e, "Failed to load breaker state");
                None
            }
        }
    }

    /// Summaries for every known provider, sorted by provider
    pub fn summaries(&self) -> Vec<BreakerSummary> {
        if let Some(store) = &self.store {
            match store.scan_prefix("breaker/") {
                Ok(entries) => {
                    for (_, value) in entries {
                        if let Some(provider) = value.get("provider").and_then(|p| p.as_str()) {
                            self.breaker(provider);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to scan breaker state"),
            }
        }

        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut summaries: Vec<BreakerSummary> = breakers.iter().map(|b| b.summary()).collect();
        summaries.sort_by(|a, b| a.provider.cmp(&b.provider));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default().with_failure_threshold(threshold),
        ))
    }

    fn fail(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().failure();
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = breaker(5);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let cb = breaker(5);
        for _ in 0..4 {
            fail(&cb);
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        assert_eq!(err.code, ErrorCode::CircuitOpen);
        assert!(err.retry_after.is_some());
    }

    #[test]
    fn test_success_resets_count() {
        let cb = breaker(3);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.failure_count(), 2);

        cb.try_acquire().unwrap().success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = breaker(2);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_open_circuit_never_runs_operation() {
        let cb = breaker(5);
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let result: Result<(), ToolError> = cb
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ToolError::execution("provider down"))
                })
                .await;
            assert_eq!(result.unwrap_err().code, ErrorCode::ToolExecutionFailed);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result: Result<(), ToolError> = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().code, ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let cb = breaker(1);
        fail(&cb);
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        let first = cb.try_acquire().unwrap();
        assert!(first.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        for _ in 0..10 {
            assert_eq!(cb.try_acquire().unwrap_err().code, ErrorCode::CircuitOpen);
        }

        first.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.summary().last_trial, Some(TrialOutcome::Success));
        assert!(!cb.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_one_trial() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        // Every task keeps whatever permit it got, so the trial stays held
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = Arc::clone(&cb);
                tokio::spawn(async move { cb.try_acquire().ok() })
            })
            .collect();

        let mut permits = Vec::new();
        for handle in handles {
            permits.extend(handle.await.unwrap());
        }
        assert_eq!(permits.len(), 1);
        assert!(permits[0].is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        permits.remove(0).failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.summary().last_trial, Some(TrialOutcome::Failure));

        // Cooldown clock restarted
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_late_success_does_not_close_open_circuit() {
        let cb = breaker(1);
        let slow = cb.try_acquire().unwrap();
        fail(&cb);
        slow.success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_config_builders() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(0)
            .with_cooldown(Duration::from_secs(120));
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.cooldown, Duration::from_secs(120));

        assert_eq!(CircuitBreakerConfig::sensitive().failure_threshold, 3);
        assert_eq!(CircuitBreakerConfig::tolerant().failure_threshold, 10);
    }

    #[test]
    fn test_registry_persists_state() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = CircuitBreakerConfig::default().with_failure_threshold(2);

        let registry = BreakerRegistry::new(config.clone()).with_store(Arc::clone(&store));
        let cb = registry.breaker("openai");
        assert!(Arc::ptr_eq(&cb, &registry.breaker("openai")));
        fail(&cb);
        fail(&cb);

        let restored = BreakerRegistry::new(config).with_store(store);
        let summaries = restored.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].provider, "openai");
        assert_eq!(summaries[0].state, CircuitState::Open);
        assert!(restored.breaker("openai").try_acquire().is_err());
    }
}
