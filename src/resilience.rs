//! Resilience supervisor for the radio stack.
//!
//! Wraps every call to the driver in retry-with-backoff, classifies
//! failures, recovers from NCP faults, and keeps an eye on the stack
//! watchdog. Recovery strategy: back off, let the stack reconnect, verify
//! health with a networkState probe, reset counters on success.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::RadioError;
use crate::events::{EventBus, GatewayEvent};
use crate::radio::{NetworkState, RadioDriver};

pub const ERROR_WINDOW: Duration = Duration::from_secs(300);
pub const MAX_ERRORS_PER_WINDOW: u32 = 10;
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);
pub const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recovering => "recovering",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResilienceStats {
    pub total_errors: u64,
    pub ncp_failures: u64,
    pub watchdog_failures: u64,
    pub recoveries_attempted: u64,
    pub recoveries_successful: u64,
}

#[derive(Debug)]
struct SupervisorState {
    state: ConnectionState,
    error_count: u32,
    last_error: Option<Instant>,
    last_watchdog_feed: Instant,
    recovery_in_progress: bool,
    recovery_attempts: u32,
    stats: ResilienceStats,
}

/// Supervises one radio stack. Shared by the gateway and the watchdog
/// monitor task.
pub struct Supervisor {
    radio: Arc<dyn RadioDriver>,
    events: EventBus,
    inner: Mutex<SupervisorState>,
    /// Base delay between recovery attempts; shrunk in tests.
    pub recovery_backoff: Duration,
    /// Settle time before the health probe after backing off.
    pub recovery_settle: Duration,
}

impl Supervisor {
    pub fn new(radio: Arc<dyn RadioDriver>, events: EventBus) -> Self {
        Self {
            radio,
            events,
            inner: Mutex::new(SupervisorState {
                state: ConnectionState::Connected,
                error_count: 0,
                last_error: None,
                last_watchdog_feed: Instant::now(),
                recovery_in_progress: false,
                recovery_attempts: 0,
                stats: ResilienceStats::default(),
            }),
            recovery_backoff: Duration::from_secs(5),
            recovery_settle: Duration::from_secs(10),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().expect("supervisor lock").state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> ResilienceStats {
        self.inner.lock().expect("supervisor lock").stats.clone()
    }

    fn set_state(&self, new_state: ConnectionState, reason: Option<&str>) {
        let previous = {
            let mut inner = self.inner.lock().expect("supervisor lock");
            if inner.state == new_state {
                return;
            }
            let previous = inner.state;
            inner.state = new_state;
            previous
        };
        match reason {
            Some(r) => tracing::info!("State transition: {} -> {} ({})", previous, new_state, r),
            None => tracing::info!("State transition: {} -> {}", previous, new_state),
        }
        self.events.emit(GatewayEvent::CoordinatorState {
            state: new_state.to_string(),
            previous: previous.to_string(),
            reason: reason.map(|r| r.to_string()),
        });
    }

    pub fn feed_watchdog(&self) {
        let mut inner = self.inner.lock().expect("supervisor lock");
        inner.last_watchdog_feed = Instant::now();
    }

    pub fn watchdog_age(&self) -> Duration {
        self.inner.lock().expect("supervisor lock").last_watchdog_feed.elapsed()
    }

    /// Too many failures inside the window means retries won't help.
    fn is_error_storm(&self) -> bool {
        let inner = self.inner.lock().expect("supervisor lock");
        match inner.last_error {
            Some(at) if at.elapsed() <= ERROR_WINDOW => inner.error_count > MAX_ERRORS_PER_WINDOW,
            _ => false,
        }
    }

    fn record_error(&self) {
        let mut inner = self.inner.lock().expect("supervisor lock");
        if let Some(at) = inner.last_error {
            if at.elapsed() > ERROR_WINDOW {
                inner.error_count = 0;
            }
        }
        inner.error_count += 1;
        inner.last_error = Some(Instant::now());
        inner.stats.total_errors += 1;
    }

    /// Handle an NCP fault: track it, maybe recover. Returns true if
    /// recovery ran and the stack verified healthy.
    pub async fn handle_ncp_failure(&self, error: &RadioError) -> bool {
        self.record_error();
        {
            let mut inner = self.inner.lock().expect("supervisor lock");
            inner.stats.ncp_failures += 1;
        }
        tracing::error!("NCP failure detected: {}", error);

        if self.is_error_storm() {
            tracing::error!("Error storm: too many failures in {}s window", ERROR_WINDOW.as_secs());
            self.set_state(ConnectionState::Failed, Some("error_storm"));
            return false;
        }

        let already_recovering = {
            let inner = self.inner.lock().expect("supervisor lock");
            inner.recovery_in_progress
        };
        if already_recovering {
            tracing::warn!("Recovery already in progress, skipping");
            return false;
        }

        self.attempt_recovery(&format!("NCP failure: {error}")).await
    }

    pub async fn handle_watchdog_failure(&self, error: &RadioError) -> bool {
        self.record_error();
        {
            let mut inner = self.inner.lock().expect("supervisor lock");
            inner.stats.watchdog_failures += 1;
        }
        tracing::error!("Watchdog failure: {}", error);

        let already_recovering = {
            let inner = self.inner.lock().expect("supervisor lock");
            inner.recovery_in_progress
        };
        if already_recovering {
            return false;
        }
        self.attempt_recovery(&format!("Watchdog timeout: {error}")).await
    }

    async fn attempt_recovery(&self, reason: &str) -> bool {
        let attempt = {
            let mut inner = self.inner.lock().expect("supervisor lock");
            inner.recovery_attempts += 1;
            inner.stats.recoveries_attempted += 1;
            if inner.recovery_attempts > MAX_RECOVERY_ATTEMPTS {
                tracing::error!("Max recovery attempts ({}) exceeded", MAX_RECOVERY_ATTEMPTS);
                inner.state = ConnectionState::Failed;
                inner.recovery_in_progress = false;
                return false;
            }
            inner.recovery_in_progress = true;
            inner.recovery_attempts
        };

        self.set_state(ConnectionState::Recovering, Some(reason));
        tracing::info!("Recovery attempt {}/{}: {}", attempt, MAX_RECOVERY_ATTEMPTS, reason);

        let backoff = self.recovery_backoff * 2u32.pow(attempt - 1);
        tokio::time::sleep(backoff).await;
        tokio::time::sleep(self.recovery_settle).await;

        if self.verify_connection().await {
            tracing::info!("Recovery successful");
            let mut inner = self.inner.lock().expect("supervisor lock");
            inner.recovery_attempts = 0;
            inner.error_count = 0;
            inner.stats.recoveries_successful += 1;
            inner.recovery_in_progress = false;
            drop(inner);
            self.set_state(ConnectionState::Connected, Some("recovery_successful"));
            true
        } else {
            tracing::warn!("Recovery attempt failed: connection not restored");
            let mut inner = self.inner.lock().expect("supervisor lock");
            inner.recovery_in_progress = false;
            false
        }
    }

    async fn verify_connection(&self) -> bool {
        match tokio::time::timeout(Duration::from_secs(5), self.radio.network_state()).await {
            Ok(Ok(NetworkState::Joined)) => true,
            Ok(Ok(NetworkState::NoNetwork)) => false,
            Ok(Err(e)) => {
                tracing::debug!("Connection verification failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("supervisor lock");
        inner.recovery_attempts = 0;
        inner.error_count = 0;
    }
}

// ── Retry wrapper ───────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Run an operation with exponential backoff. Transient errors retry;
/// permanent errors fail immediately.
pub async fn retry_operation<T, F, Fut>(mut op: F, opts: RetryOptions) -> Result<T, RadioError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RadioError>>,
{
    let mut last: Option<RadioError> = None;

    for attempt in 0..=opts.max_retries {
        if attempt > 0 {
            let exp = opts.backoff_base * 2u32.pow(attempt - 1);
            let backoff = exp.min(opts.backoff_max);
            tracing::debug!("Retry #{} after {:?}", attempt, backoff);
            tokio::time::sleep(backoff).await;
        }

        let result = match opts.timeout {
            Some(t) => match tokio::time::timeout(t, op()).await {
                Ok(r) => r,
                Err(_) => Err(RadioError::Timeout(t)),
            },
            None => op().await,
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!("Attempt {} failed: {}", attempt + 1, e);
                if !e.is_transient() {
                    return Err(e);
                }
                last = Some(e);
            }
        }
    }

    let last = last.expect("at least one attempt ran");
    Err(RadioError::RetryExhausted { attempts: opts.max_retries, last: last.to_string() })
}

// ── Watchdog monitor ────────────────────────────────────

/// Independent task that samples "time since last watchdog feed" and warns
/// before the main watchdog would fire.
pub fn spawn_watchdog_monitor(
    supervisor: Arc<Supervisor>,
    events: EventBus,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WATCHDOG_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let age = supervisor.watchdog_age();
            if age > WATCHDOG_TIMEOUT {
                tracing::warn!(
                    "Watchdog stale: {:.1}s since last feed (timeout {}s)",
                    age.as_secs_f64(),
                    WATCHDOG_TIMEOUT.as_secs()
                );
                events.emit(GatewayEvent::WatchdogWarning {
                    age_secs: age.as_secs_f64(),
                    timeout_secs: WATCHDOG_TIMEOUT.as_secs_f64(),
                });
            } else if age.as_secs_f64() > WATCHDOG_TIMEOUT.as_secs_f64() * 0.75 {
                tracing::warn!("Watchdog approaching timeout: {:.1}s", age.as_secs_f64());
                events.emit(GatewayEvent::WatchdogWarning {
                    age_secs: age.as_secs_f64(),
                    timeout_secs: WATCHDOG_TIMEOUT.as_secs_f64(),
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::SimulatedRadio;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_supervisor() -> (Arc<Supervisor>, Arc<SimulatedRadio>) {
        let radio = Arc::new(SimulatedRadio::new());
        let mut supervisor = Supervisor::new(radio.clone(), EventBus::default());
        supervisor.recovery_backoff = Duration::from_millis(5);
        supervisor.recovery_settle = Duration::from_millis(5);
        (Arc::new(supervisor), radio)
    }

    #[tokio::test]
    async fn ncp_failure_walks_recovering_then_connected() {
        let (supervisor, _radio) = fast_supervisor();
        assert_eq!(supervisor.state(), ConnectionState::Connected);

        let recovered = supervisor
            .handle_ncp_failure(&RadioError::NcpFailure("DELIVERY_FAILED".into()))
            .await;

        assert!(recovered);
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        let stats = supervisor.stats();
        assert_eq!(stats.recoveries_attempted, 1);
        assert_eq!(stats.recoveries_successful, 1);
        assert_eq!(stats.ncp_failures, 1);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry_operation(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RadioError::Stack("MAC_NO_ACK".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            RetryOptions { backoff_base: Duration::from_millis(1), ..Default::default() },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_fails_fast_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_operation(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(RadioError::Stack("INVALID_PARAMETER".into())) }
            },
            RetryOptions { backoff_base: Duration::from_millis(1), ..Default::default() },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_is_reported() {
        let result: Result<(), _> = retry_operation(
            || async { Err(RadioError::Stack("NETWORK_BUSY".into())) },
            RetryOptions {
                max_retries: 2,
                backoff_base: Duration::from_millis(1),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(RadioError::RetryExhausted { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn watchdog_feed_resets_age() {
        let (supervisor, _radio) = fast_supervisor();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(supervisor.watchdog_age() >= Duration::from_millis(10));
        supervisor.feed_watchdog();
        assert!(supervisor.watchdog_age() < Duration::from_millis(10));
    }
}
