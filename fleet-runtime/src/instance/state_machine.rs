//! Instance state machine (§4.6). States and the transitions the
//! provisioner/lifecycle controller are permitted to perform between them.

use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Provisioning,
    Starting,
    Active,
    Sleeping,
    GracePeriod,
    Paused,
    Cancelled,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Starting => "starting",
            InstanceState::Active => "active",
            InstanceState::Sleeping => "sleeping",
            InstanceState::GracePeriod => "grace_period",
            InstanceState::Paused => "paused",
            InstanceState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "pending" => InstanceState::Pending,
            "provisioning" => InstanceState::Provisioning,
            "starting" => InstanceState::Starting,
            "active" => InstanceState::Active,
            "sleeping" => InstanceState::Sleeping,
            "grace_period" => InstanceState::GracePeriod,
            "paused" => InstanceState::Paused,
            "cancelled" => InstanceState::Cancelled,
            other => {
                return Err(ControlPlaneError::InvariantViolation(format!(
                    "unknown instance state: {other}"
                )));
            }
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    #[test]
    fn round_trips_through_string_form() {
        for state in [
            Pending,
            Provisioning,
            Starting,
            Active,
            Sleeping,
            GracePeriod,
            Paused,
            Cancelled,
        ] {
            assert_eq!(InstanceState::parse(state.as_str()).unwrap(), state);
        }
    }
}
