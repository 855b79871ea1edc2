//! Circuit breaker guarding calls into a single external service.
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │ <─────────┐
//! └─────────┘                         └────────┘           │
//!      ^                                   │               │
//!      │                                   │ reset timeout │ probe fails
//!      │                                   v               │
//!      │      probe succeeds       ┌─────────────┐         │
//!      └────────────────────────── │  HALF-OPEN  │ ────────┘
//!                                  └─────────────┘
//! ```
//!
//! While HALF-OPEN exactly one probe call is in flight; every other caller is
//! rejected until the probe settles.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without invoking the wrapped operation.
    Open,
    /// A single probe request is allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown before a probe is allowed once the circuit is open.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Error returned from [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit rejected the call without running it.
    #[error("circuit '{name}' is open")]
    Open { name: String },
    /// The wrapped operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// Map the rejection and the inner error into a single error type.
    pub fn into_inner_or(self, on_open: impl FnOnce(String) -> E) -> E {
        match self {
            CircuitError::Open { name } => on_open(name),
            CircuitError::Inner(err) => err,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    next_attempt: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Thread-safe circuit breaker. All state lives behind one mutex which is
/// never held across an `.await`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Run `operation` if the circuit admits it and record the outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().ok_or_else(|| CircuitError::Open {
            name: self.name.clone(),
        })?;

        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = operation().await;
        guard.settled = true;

        match &result {
            Ok(_) => self.record_success(admission),
            Err(_) => self.record_failure(admission),
        }

        result.map_err(CircuitError::Inner)
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.lock();
        Self::close(&mut inner);
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen => None,
            CircuitState::Open => {
                let ready = inner
                    .next_attempt
                    .is_none_or(|at| Instant::now() >= at);
                if !ready {
                    return None;
                }

                inner.state = CircuitState::HalfOpen;
                        tracing::info!(breaker = %self.name, "Circuit breaker HALF-OPEN (probing)");
                Some(Admission::Probe)
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                Self::close(&mut inner);
                tracing::info!(breaker = %self.name, "Circuit breaker CLOSED (recovered)");
            }
            (CircuitState::Closed, _) => {
                inner.failure_count = 0;
            }
            // Stragglers admitted before the circuit opened do not close it.
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                self.open(&mut inner);
            }
            (CircuitState::Closed, _) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        tracing::warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker OPENED"
        );
    }

    fn close(inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_attempt = None;
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Re-opens the circuit if a probe future is dropped before it settles, so a
/// cancelled probe cannot wedge the breaker in HALF-OPEN.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.record_failure(Admission::Probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_millis(reset_ms)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let breaker = breaker(3, 1000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = breaker(3, 60_000);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let breaker = breaker(1, 60_000);
        let _ = fail(&breaker).await;

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result = breaker
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 1000);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let breaker = breaker(1, 20);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let breaker = breaker(1, 20);
        let _ = fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = fail(&breaker).await;
        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rescheduled: an immediate call is rejected again.
        assert!(succeed(&breaker).await.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_probe() {
        let breaker = Arc::new(breaker(1, 20));
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
        });

        // Let the probe get admitted.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(succeed(&breaker).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_probe_reopens() {
        let breaker = breaker(1, 20);
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let pending = breaker.call(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = breaker(1, 60_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[test]
    fn test_error_display() {
        let err: CircuitError<String> = CircuitError::Open {
            name: "embedding".to_string(),
        };
        assert_eq!(err.to_string(), "circuit 'embedding' is open");

        let err: CircuitError<String> = CircuitError::Inner("bad gateway".to_string());
        assert_eq!(err.to_string(), "bad gateway");
    }

    #[test]
    fn test_error_boxes_as_std_error() {
        let err: Box<dyn std::error::Error + Send + Sync> =
            Box::new(CircuitError::<std::io::Error>::Open {
                name: "vector-index".to_string(),
            });
        assert_eq!(err.to_string(), "circuit 'vector-index' is open");
    }
}
