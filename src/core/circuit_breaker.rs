use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Three-state guard around calls to an unreliable dependency. Shared by every
/// caller of the same guarded site; cheap to clone behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `action` under the breaker. While the circuit is open the action is
    /// not invoked and `CircuitBreakerError::Open` is returned instead.
    pub async fn execute<T, F, Fut>(&self, action: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.try_acquire().await {
            return Err(CircuitBreakerError::Open(self.name.clone()));
        }

        match action().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Upstream(err))
            }
        }
    }

    /// Like [`execute`](Self::execute), but serves `fallback` instead of
    /// failing when the circuit is open (either before the call, or when this
    /// very failure tripped it open).
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        action: F,
        fallback: FB,
    ) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        FB: FnOnce() -> T,
    {
        if !self.try_acquire().await {
            warn!(breaker = %self.name, "circuit open, serving fallback");
            return Ok(fallback());
        }

        match action().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                if self.state().await == CircuitState::Open {
                    warn!(breaker = %self.name, error = %err, "circuit opened by failure, serving fallback");
                    return Ok(fallback());
                }
                Err(CircuitBreakerError::Upstream(err))
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    /// Returns whether the call may proceed, moving an expired open circuit to
    /// half-open for its single probe.
    async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() > self.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.failure_count >= self.failure_threshold && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "circuit opened"
            );
        }
    }
}
