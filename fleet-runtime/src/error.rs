use std::fmt;

/// Errors returned by control-plane operations.
#[derive(Debug)]
pub enum ControlPlaneError {
    /// Tenant has no placement yet.
    NotProvisioned(String),
    /// A worker could not be reached within its retry budget.
    Unreachable(String),
    /// The fleet cannot host the request and growing was forbidden or failed.
    NoCapacity(String),
    /// A generated shell argument failed the identifier allow-list, or
    /// another internal precondition was violated. Never fall through to
    /// composing a shell string after this.
    InvariantViolation(String),
    /// Tenant is frozen pending human action.
    RetryCeilingReached(String),
    /// The requested transition conflicts with work already in flight.
    Conflict(String),
    /// Malformed input caught before it becomes an `InvariantViolation`.
    Validation(String),
    /// Repository/SQL failure.
    Storage(String),
    /// Lower-level transport failure not yet classified as `Unreachable`.
    Transport(String),
    /// Startup-time misconfiguration.
    Configuration(String),
}

impl fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPlaneError::NotProvisioned(msg) => write!(f, "not provisioned: {msg}"),
            ControlPlaneError::Unreachable(msg) => write!(f, "unreachable: {msg}"),
            ControlPlaneError::NoCapacity(msg) => write!(f, "no capacity: {msg}"),
            ControlPlaneError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            ControlPlaneError::RetryCeilingReached(msg) => {
                write!(f, "retry ceiling reached: {msg}")
            }
            ControlPlaneError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ControlPlaneError::Validation(msg) => write!(f, "validation error: {msg}"),
            ControlPlaneError::Storage(msg) => write!(f, "storage error: {msg}"),
            ControlPlaneError::Transport(msg) => write!(f, "transport error: {msg}"),
            ControlPlaneError::Configuration(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for ControlPlaneError {}

impl From<ControlPlaneError> for String {
    fn from(err: ControlPlaneError) -> Self {
        err.to_string()
    }
}

impl From<sqlx::Error> for ControlPlaneError {
    fn from(err: sqlx::Error) -> Self {
        ControlPlaneError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(err: serde_json::Error) -> Self {
        ControlPlaneError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for ControlPlaneError {
    fn from(err: std::io::Error) -> Self {
        ControlPlaneError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Stable user-visible outcome for an error surfaced from a user-initiated
/// entry point (§7 propagation policy). Scheduler loops never call this —
/// they log the error and loop.
pub fn user_facing_message(err: &ControlPlaneError) -> &'static str {
    match err {
        ControlPlaneError::NotProvisioned(_) => "provisioning, retry",
        ControlPlaneError::NoCapacity(_) => "please retry shortly",
        ControlPlaneError::RetryCeilingReached(_) => "contact support",
        _ => "something went wrong",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_message_maps_known_kinds() {
        assert_eq!(
            user_facing_message(&ControlPlaneError::NotProvisioned("t1".into())),
            "provisioning, retry"
        );
        assert_eq!(
            user_facing_message(&ControlPlaneError::NoCapacity("fleet full".into())),
            "please retry shortly"
        );
        assert_eq!(
            user_facing_message(&ControlPlaneError::RetryCeilingReached("t1".into())),
            "contact support"
        );
        assert_eq!(
            user_facing_message(&ControlPlaneError::Unreachable("w1".into())),
            "something went wrong"
        );
    }

    #[test]
    fn display_includes_kind_prefix() {
        let err = ControlPlaneError::Conflict("provision in flight".into());
        assert_eq!(err.to_string(), "conflict: provision in flight");
    }
}
