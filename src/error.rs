//! Error taxonomy for ingestion and the alert lifecycle.
//!
//! Every failure is returned synchronously to the caller. Nothing here is
//! retried by the service; retry policy belongs to the device firmware or the
//! operator's client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::model::AlertState;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed or out-of-range input, rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no active animal assigned to device {device_id}")]
    UnassignedDevice { device_id: String },

    #[error("animal {0} not found")]
    UnknownAnimal(i64),

    #[error("alert {0} not found")]
    NotFound(i64),

    #[error("cannot {action} an alert that is {state}")]
    InvalidStateTransition {
        action: &'static str,
        state: AlertState,
    },

    /// A lifecycle timestamp precedes one already recorded on the alert.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Anything unclassified: storage failures, integrity faults.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Internal(e.into())
    }
}

impl CoreError {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::UnassignedDevice { .. } => "unassigned_device",
            CoreError::UnknownAnimal(_) => "unknown_animal",
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidStateTransition { .. } => "invalid_state_transition",
            CoreError::InvalidTimestamp(_) => "invalid_timestamp",
            CoreError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) | CoreError::InvalidTimestamp(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::UnassignedDevice { .. }
            | CoreError::UnknownAnimal(_)
            | CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs.
        let message = match &self {
            CoreError::Internal(e) => {
                error!(error = ?e, "Internal failure");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "error": self.kind(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            CoreError::Validation("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            CoreError::UnassignedDevice {
                device_id: "M5-001".into(),
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::InvalidStateTransition {
                action: "acknowledge",
                state: AlertState::Resolved,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::Internal(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transition_message_names_state() {
        let err = CoreError::InvalidStateTransition {
            action: "acknowledge",
            state: AlertState::Resolved,
        };
        assert_eq!(err.to_string(), "cannot acknowledge an alert that is resolved");
    }
}
