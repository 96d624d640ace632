use std::time::Instant;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::types::ProviderId;

/// Per-provider circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-fail without calling the provider.
    Open,
    /// One trial request allowed.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_rate_limits: u32,
    opened_at: Option<Instant>,
    /// Set on credential rejection: no timed recovery, only `reset`.
    auth_locked: bool,
    /// True while the half-open trial request is in flight.
    probe_taken: bool,
    /// When the current trial was granted. The permit is a lease: a
    /// caller cancelled before recording an outcome would otherwise hold
    /// it forever, so it can be reclaimed after another recovery window.
    probe_started_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_rate_limits: 0,
            opened_at: None,
            auth_locked: false,
            probe_taken: false,
            probe_started_at: None,
        }
    }
}

impl BreakerEntry {
    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_taken = false;
        self.probe_started_at = None;
    }

    fn take_probe(&mut self) {
        self.probe_taken = true;
        self.probe_started_at = Some(Instant::now());
    }
}

/// Failure-isolation state machine, one entry per provider.
///
/// Transitions run under the dashmap entry lock, so read-modify-write is
/// serialized per provider identity and never held across network calls.
pub struct CircuitBreaker {
    failure_threshold: u32,
    rate_limit_escalation_threshold: u32,
    recovery_timeout: std::time::Duration,
    entries: DashMap<ProviderId, BreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            rate_limit_escalation_threshold: config.rate_limit_escalation_threshold,
            recovery_timeout: config.recovery_timeout(),
            entries: DashMap::new(),
        }
    }

    /// Override the recovery timeout with sub-second precision.
    pub fn with_recovery_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Whether a request may proceed right now. Consumes the half-open
    /// trial permit when the recovery timeout has elapsed.
    pub fn allow_request(&self, id: ProviderId) -> bool {
        let mut entry = self.entries.entry(id).or_default();
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if entry.auth_locked {
                    return false;
                }
                let elapsed = entry
                    .opened_at
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!("circuit for {} half-open, allowing trial request", id);
                    entry.state = CircuitState::HalfOpen;
                    entry.take_probe();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_taken && !self.probe_expired(&entry) {
                    false
                } else {
                    entry.take_probe();
                    true
                }
            }
        }
    }

    /// An outstanding trial older than the recovery timeout is treated as
    /// abandoned (the caller was cancelled) and its permit reclaimed.
    fn probe_expired(&self, entry: &BreakerEntry) -> bool {
        entry
            .probe_started_at
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    /// Non-mutating view of `allow_request`, used by the router to rank
    /// candidates without consuming the trial permit.
    pub fn available(&self, id: ProviderId) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return true;
        };
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                !entry.auth_locked
                    && entry
                        .opened_at
                        .map(|t| t.elapsed() >= self.recovery_timeout)
                        .unwrap_or(true)
            }
            CircuitState::HalfOpen => !entry.probe_taken || self.probe_expired(&entry),
        }
    }

    pub fn record_success(&self, id: ProviderId) {
        let mut entry = self.entries.entry(id).or_default();
        if entry.state == CircuitState::HalfOpen {
            info!("circuit for {} closed after successful trial", id);
        }
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.consecutive_rate_limits = 0;
        entry.opened_at = None;
        entry.probe_taken = false;
        entry.probe_started_at = None;
    }

    pub fn record_failure(&self, id: ProviderId) {
        let mut entry = self.entries.entry(id).or_default();
        Self::apply_failure(&mut entry, id, self.failure_threshold);
    }

    /// Rate limits are not provider malfunctions and never touch the
    /// failure counter directly; a sustained run of them escalates to a
    /// single recorded failure.
    pub fn record_rate_limited(&self, id: ProviderId) {
        let mut entry = self.entries.entry(id).or_default();
        entry.consecutive_rate_limits += 1;
        if entry.consecutive_rate_limits >= self.rate_limit_escalation_threshold {
            warn!(
                "{} rate-limited {} times in a row, counting as a failure",
                id, entry.consecutive_rate_limits
            );
            entry.consecutive_rate_limits = 0;
            Self::apply_failure(&mut entry, id, self.failure_threshold);
        }
    }

    /// Credential rejection: open immediately with no timed recovery.
    /// Only `reset` (re-initialization) clears the lock.
    pub fn record_auth_failure(&self, id: ProviderId) {
        let mut entry = self.entries.entry(id).or_default();
        warn!("{} rejected its credential, locking circuit open", id);
        entry.trip();
        entry.auth_locked = true;
    }

    /// Clear all state for a provider, used when it is re-initialized
    /// with fresh configuration.
    pub fn reset(&self, id: ProviderId) {
        self.entries.remove(&id);
    }

    pub fn state(&self, id: ProviderId) -> CircuitState {
        self.entries
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn apply_failure(entry: &mut BreakerEntry, id: ProviderId, failure_threshold: u32) {
        entry.consecutive_rate_limits = 0;
        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= failure_threshold {
                    warn!(
                        "circuit for {} opened after {} consecutive failures",
                        id, entry.consecutive_failures
                    );
                    entry.trip();
                }
            }
            CircuitState::HalfOpen => {
                warn!("trial request for {} failed, reopening circuit", id);
                entry.consecutive_failures += 1;
                entry.trip();
            }
            CircuitState::Open => {
                entry.consecutive_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // recovery_secs 0 means the circuit recovers immediately; a large
    // value means it never recovers within the test.
    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            rate_limit_escalation_threshold: 3,
        })
    }

    const P: ProviderId = ProviderId::OpenAi;

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(3, 10_000);
        for _ in 0..2 {
            b.record_failure(P);
        }
        assert_eq!(b.state(P), CircuitState::Closed);
        assert!(b.allow_request(P));

        b.record_failure(P);
        assert_eq!(b.state(P), CircuitState::Open);
        assert!(!b.allow_request(P));
        assert!(!b.available(P));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3, 10_000);
        b.record_failure(P);
        b.record_failure(P);
        b.record_success(P);
        b.record_failure(P);
        b.record_failure(P);
        assert_eq!(b.state(P), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_trial_then_close() {
        let b = breaker(1, 10_000).with_recovery_timeout(Duration::from_millis(20));
        b.record_failure(P);
        assert_eq!(b.state(P), CircuitState::Open);
        assert!(!b.allow_request(P));

        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow_request(P));
        assert_eq!(b.state(P), CircuitState::HalfOpen);
        // Only one trial permitted while the probe is outstanding.
        assert!(!b.allow_request(P));

        b.record_success(P);
        assert_eq!(b.state(P), CircuitState::Closed);
        assert!(b.allow_request(P));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(1, 10_000).with_recovery_timeout(Duration::from_millis(20));
        b.record_failure(P);
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow_request(P));

        b.record_failure(P);
        assert_eq!(b.state(P), CircuitState::Open);
        assert!(!b.allow_request(P));
    }

    #[test]
    fn test_abandoned_trial_permit_is_reclaimed() {
        let b = breaker(1, 10_000).with_recovery_timeout(Duration::from_millis(20));
        b.record_failure(P);
        std::thread::sleep(Duration::from_millis(30));

        // The trial is granted but its caller vanishes without ever
        // recording an outcome.
        assert!(b.allow_request(P));
        assert!(!b.allow_request(P));
        assert!(!b.available(P));

        // After another recovery window the permit comes back instead of
        // excluding the provider forever.
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.available(P));
        assert!(b.allow_request(P));
        b.record_success(P);
        assert_eq!(b.state(P), CircuitState::Closed);
    }

    #[test]
    fn test_rate_limits_do_not_count_as_failures() {
        let b = breaker(2, 10_000);
        b.record_rate_limited(P);
        b.record_rate_limited(P);
        assert_eq!(b.state(P), CircuitState::Closed);
        // The third consecutive 429 escalates to one failure, still
        // below the threshold of two.
        b.record_rate_limited(P);
        assert_eq!(b.state(P), CircuitState::Closed);
        assert!(b.allow_request(P));
    }

    #[test]
    fn test_sustained_rate_limits_escalate() {
        let b = breaker(1, 10_000);
        b.record_rate_limited(P);
        b.record_rate_limited(P);
        assert_eq!(b.state(P), CircuitState::Closed);
        b.record_rate_limited(P);
        assert_eq!(b.state(P), CircuitState::Open);
    }

    #[test]
    fn test_auth_failure_locks_open_until_reset() {
        let b = breaker(5, 0);
        b.record_auth_failure(P);
        assert_eq!(b.state(P), CircuitState::Open);
        // Zero recovery timeout, but the auth lock ignores it.
        assert!(!b.allow_request(P));
        assert!(!b.available(P));

        b.reset(P);
        assert_eq!(b.state(P), CircuitState::Closed);
        assert!(b.allow_request(P));
    }
}
