//! Collaborator isolation: circuit breaker and retrying invoker

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CallOutcome, CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use retry::{RetryPolicy, RetryingInvoker};

/// Collaborator names used for circuit accounting
pub mod collaborators {
    pub const FETCH: &str = "fetch";
    pub const ENRICH: &str = "enrich";
    pub const CLUSTER: &str = "cluster";
    pub const CLASSIFY: &str = "classify";
}
