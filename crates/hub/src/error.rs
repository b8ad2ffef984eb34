//! Domain error taxonomy. Plumbing (db, config, mqtt) keeps using `anyhow`;
//! everything a workflow action can refuse is one of these.

use crate::gate::GateRejection;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IrrigationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cannot {action} {entity} in state '{current}' (requires {required})")]
    InvalidTransition {
        entity: &'static str,
        action: &'static str,
        current: String,
        required: String,
    },

    #[error("execution conditions not met: {0}")]
    GateRejected(GateRejection),

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} was modified concurrently")]
    Conflict { entity: &'static str, key: String },
}

pub type DomainResult<T> = Result<T, IrrigationError>;

impl IrrigationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transition(
        entity: &'static str,
        action: &'static str,
        current: impl std::fmt::Display,
        required: &str,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            action,
            current: current.to_string(),
            required: required.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}
