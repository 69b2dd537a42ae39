//! Circuit breaker, one per origin.
//!
//! Three states:
//! - Closed: normal operation, requests are allowed
//! - Open: the origin keeps failing, requests are rejected without any
//!   network attempt until a cooldown elapses
//! - HalfOpen: probing recovery with exactly one trial call in flight
//!
//! A failed trial reopens the circuit with a doubled cooldown (capped), so a
//! persistently dead origin is probed less and less often. A successful trial
//! closes the circuit and resets the cooldown to its base value.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive terminal failures before opening the circuit.
    pub failure_threshold: u32,

    /// Base cooldown before an open circuit admits a trial.
    pub cooldown: Duration,

    /// Cap on the exponentially grown cooldown after repeated failed trials.
    pub max_cooldown: Duration,

    /// When true, retried (non-final) attempt failures also count toward the
    /// trip threshold while the circuit is closed. Off by default: only the
    /// terminal outcome of a logical request is judged.
    pub count_transient_failures: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            count_transient_failures: false,
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// How an admitted call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal closed-state traffic.
    Normal,

    /// The single half-open trial. The caller must resolve it with a
    /// terminal outcome or abandon it on cancellation.
    Trial,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Circuit is open; retry once the remaining cooldown elapses.
    Open { retry_in: Duration },

    /// A half-open trial is already in flight; fail fast.
    TrialInFlight,
}

impl Rejection {
    pub fn retry_in(&self) -> Duration {
        match self {
            Rejection::Open { retry_in } => *retry_in,
            Rejection::TrialInFlight => Duration::ZERO,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    trial_in_flight: bool,
    open_count: u64,
}

/// Point-in-time view of a breaker, for stats and logs.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_count: u64,
    pub current_cooldown: Duration,
}

/// Per-origin failure isolation state machine.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                current_cooldown: cooldown,
                trial_in_flight: false,
                open_count: 0,
            }),
        }
    }

    /// Gate a logical request. An admission must be resolved: the caller
    /// reports the terminal outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure), and an
    /// [`Admission::Trial`] that is cancelled before either must be handed
    /// back through [`abandon_trial`](Self::abandon_trial).
    ///
    /// The first admission after an open circuit's cooldown becomes the
    /// half-open trial; until that trial resolves every other caller is
    /// rejected without touching the network.
    pub fn try_admit(&self) -> Result<Admission, Rejection> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),

            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= inner.current_cooldown {
                    info!(
                        cooldown_ms = inner.current_cooldown.as_millis() as u64,
                        "circuit transitioning Open -> HalfOpen, admitting trial"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(Rejection::Open {
                        retry_in: inner.current_cooldown - elapsed,
                    })
                }
            }

            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!("rejecting call while half-open trial is in flight");
                    Err(Rejection::TrialInFlight)
                } else {
                    // Previous trial resolved but the state change raced us;
                    // admit as a fresh trial.
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Report a successful terminal outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                info!("trial succeeded, circuit transitioning HalfOpen -> Closed");
                inner.state = CircuitState::Closed;
                inner.trial_in_flight = false;
                inner.opened_at = None;
                inner.current_cooldown = self.config.cooldown;
            }
            CircuitState::Open => {
                // A success can only arrive here if the caller was admitted
                // before the circuit opened; leave the cooldown running.
                warn!("success recorded while circuit is open");
            }
        }
    }

    /// Report a failed terminal outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "failure threshold reached, circuit transitioning Closed -> Open"
                    );
                    Self::open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                let next = (inner.current_cooldown * 2).min(self.config.max_cooldown);
                warn!(
                    next_cooldown_ms = next.as_millis() as u64,
                    "trial failed, circuit transitioning HalfOpen -> Open"
                );
                inner.current_cooldown = next;
                Self::open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Report a retried (non-final) attempt failure. Counts toward the trip
    /// threshold only when `count_transient_failures` is set, and only from
    /// the closed state; half-open trials are judged solely by their terminal
    /// outcome.
    pub fn record_transient_failure(&self) {
        if !self.config.count_transient_failures {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                "transient failures reached threshold, circuit transitioning Closed -> Open"
            );
            Self::open(&mut inner);
        }
    }

    /// Report that an admitted trial was cancelled before reaching a
    /// terminal outcome. The circuit reverts to Open with the current
    /// cooldown restarted, so a later caller is admitted as a fresh trial.
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            debug!("trial abandoned, circuit reverting HalfOpen -> Open");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
    }

    fn open(inner: &mut CircuitInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.open_count += 1;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_count: inner.open_count,
            current_cooldown: inner.current_cooldown,
        }
    }

    /// Force the circuit back to closed. Operational escape hatch.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        info!("manually resetting circuit to Closed");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.current_cooldown = self.config.cooldown;
    }
}
