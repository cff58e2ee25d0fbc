pub mod circuit_breaker;
pub mod config;
pub mod health;
pub mod logging;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::Config;
pub use health::HealthChecker;
