//! Engine error types
//!
//! Every fallible boundary in the engine returns a tagged `EngineError`.
//! Hardware primitives never panic and never let an OS error escape raw:
//! they map into one of the variants here so callers (agents, executor,
//! health monitor) can branch on the kind.

use thiserror::Error;

/// Result alias used across the hardware access layer.
pub type HwResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Primitive not supported on this machine / driver absent.
    #[error("hardware unavailable: {0}")]
    HwUnavailable(String),

    /// Recoverable hardware failure (timeout, busy, transient I/O error).
    #[error("transient hardware failure: {0}")]
    HwTransient(String),

    /// Hardware returned data that cannot be right (e.g. 0 °C on all sensors).
    #[error("invalid hardware data: {0}")]
    HwInvalid(String),

    /// Planner dropped an action because a cooling period covers its control.
    #[error("override active for control {control}")]
    OverrideActive { control: String },

    /// Planner dropped a GPU transition inside the minimum dwell window.
    #[error("minimum dwell violated: {0}")]
    DwellViolation(String),

    /// Planner dropped an action because the same agent kept flipping the control.
    #[error("oscillation guard tripped: {0}")]
    OscillationGuard(String),

    /// Circuit breaker is open for this primitive; call short-circuited.
    #[error("circuit breaker open: {0}")]
    BackoffOpen(String),

    /// Operation cancelled by engine shutdown.
    #[error("cancelled")]
    Cancelled,

    /// Anything that does not fit the kinds above. Carries context.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl EngineError {
    /// True for failures worth retrying (transient I/O, open breakers).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::HwTransient(_) | EngineError::BackoffOpen(_)
        )
    }

    /// Short machine-readable kind tag used in journals and health events.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::HwUnavailable(_) => "hw_unavailable",
            EngineError::HwTransient(_) => "hw_transient",
            EngineError::HwInvalid(_) => "hw_invalid",
            EngineError::OverrideActive { .. } => "override_active",
            EngineError::DwellViolation(_) => "dwell_violation",
            EngineError::OscillationGuard(_) => "oscillation_guard",
            EngineError::BackoffOpen(_) => "backoff_open",
            EngineError::Cancelled => "cancelled",
            EngineError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                EngineError::HwUnavailable(e.to_string())
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                EngineError::HwTransient(e.to_string())
            }
            _ => EngineError::HwTransient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(EngineError::HwTransient("t".into()).is_transient());
        assert!(EngineError::BackoffOpen("b".into()).is_transient());
        assert!(!EngineError::HwUnavailable("u".into()).is_transient());
    }

    #[test]
    fn io_error_mapping() {
        let notfound = std::io::Error::new(std::io::ErrorKind::NotFound, "no driver");
        assert_eq!(EngineError::from(notfound).kind(), "hw_unavailable");
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "ec busy");
        assert_eq!(EngineError::from(timeout).kind(), "hw_transient");
    }
}
