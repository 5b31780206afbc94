//! Service error taxonomy
//!
//! Every guard and service operation fails with a [`ServiceError`] variant
//! chosen at the throw site. The variant - not message text - decides the
//! wire code and HTTP status, and `Internal` details never cross the HTTP
//! boundary: they are logged server-side and replaced with a generic message.

use crate::context::InvalidActorId;
use crate::executor::RowError;
use crate::transaction::TransactionError;
use serde_json::{json, Value as JsonValue};
use std::fmt;
use uuid::Uuid;

/// Result alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Classified failure of a guard, service operation or the API wrapper.
#[derive(Debug)]
pub enum ServiceError {
    /// No verified actor on the request
    Unauthorized,
    /// Verified actor lacks permission for the target entity/action
    Forbidden(String),
    /// Structurally invalid input
    Validation(String),
    /// Target entity does not exist
    NotFound { entity: &'static str, id: String },
    /// A uniqueness/business invariant would be violated
    Conflict {
        /// Specific invariant, e.g. `ACTIVITY_ALREADY_REPORTED`, `PERIOD_OVERLAP`
        invariant: &'static str,
        message: String,
    },
    /// Mutation's effective date falls inside a closed accounting period
    PeriodClosed {
        period_id: Uuid,
        period_label: String,
        action: &'static str,
    },
    /// Attempted mutation of a system-generated record
    TransactionImmutable { entity_id: Uuid },
    /// A request with the same idempotency key is still in flight
    IdempotencyConflict,
    /// Anything unclassified; detail stays server-side
    Internal(String),
}

impl ServiceError {
    /// Wire code for the HTTP error body
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Unauthorized => "UNAUTHORIZED",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::NotFound { .. } => "NOT_FOUND",
            ServiceError::Conflict { .. } => "CONFLICT",
            ServiceError::PeriodClosed { .. } => "PERIOD_CLOSED",
            ServiceError::TransactionImmutable { .. } => "TRANSACTION_IMMUTABLE",
            ServiceError::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the API layer responds with
    ///
    /// Invariant conflicts (uniqueness, closed period, immutable record,
    /// in-flight idempotency key) all map to 409; permission failures to 403.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Unauthorized => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound { .. } => 404,
            ServiceError::Conflict { .. } => 409,
            ServiceError::PeriodClosed { .. } => 409,
            ServiceError::TransactionImmutable { .. } => 409,
            ServiceError::IdempotencyConflict => 409,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Message safe to return to the client
    ///
    /// `Internal` details are replaced with a generic message; callers log
    /// the original before mapping.
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::Unauthorized => "Authentication required".to_string(),
            ServiceError::Forbidden(msg) => msg.clone(),
            ServiceError::Validation(msg) => msg.clone(),
            ServiceError::NotFound { entity, id } => format!("{entity} {id} not found"),
            ServiceError::Conflict { invariant, message } => format!("{invariant}: {message}"),
            ServiceError::PeriodClosed {
                period_label,
                action,
                ..
            } => format!(
                "Accounting period {period_label} is closed; {action} is not allowed for dates inside it"
            ),
            ServiceError::TransactionImmutable { entity_id } => format!(
                "Transaction {entity_id} was generated by the system and cannot be modified or deleted"
            ),
            ServiceError::IdempotencyConflict => {
                "A request with this idempotency key is already in progress".to_string()
            }
            ServiceError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// JSON error body: `{"error": message, "code": CODE}`
    pub fn to_body(&self) -> JsonValue {
        json!({ "error": self.client_message(), "code": self.code() })
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Internal(detail) => write!(f, "{}: {detail}", self.code()),
            _ => write!(f, "{}: {}", self.code(), self.client_message()),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<RowError> for ServiceError {
    fn from(err: RowError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<TransactionError> for ServiceError {
    fn from(err: TransactionError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<InvalidActorId> for ServiceError {
    fn from(err: InvalidActorId) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let cases: Vec<(ServiceError, &str, u16)> = vec![
            (ServiceError::Unauthorized, "UNAUTHORIZED", 401),
            (
                ServiceError::Forbidden("not yours".to_string()),
                "FORBIDDEN",
                403,
            ),
            (
                ServiceError::Validation("missing field".to_string()),
                "VALIDATION_ERROR",
                400,
            ),
            (
                ServiceError::NotFound {
                    entity: "report",
                    id: "r-1".to_string(),
                },
                "NOT_FOUND",
                404,
            ),
            (
                ServiceError::Conflict {
                    invariant: "ACTIVITY_ALREADY_REPORTED",
                    message: "a report already exists".to_string(),
                },
                "CONFLICT",
                409,
            ),
            (ServiceError::IdempotencyConflict, "IDEMPOTENCY_CONFLICT", 409),
            (
                ServiceError::Internal("db exploded".to_string()),
                "INTERNAL_ERROR",
                500,
            ),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn test_internal_detail_never_reaches_client() {
        let err = ServiceError::Internal("password=hunter2 connection refused".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
        let body = err.to_body();
        assert!(!body.to_string().contains("hunter2"));
    }

    #[test]
    fn test_period_closed_names_period_and_action() {
        let err = ServiceError::PeriodClosed {
            period_id: Uuid::nil(),
            period_label: "2026-05 (month)".to_string(),
            action: "update_transaction",
        };
        let msg = err.client_message();
        assert!(msg.contains("2026-05 (month)"));
        assert!(msg.contains("update_transaction"));
        assert_eq!(err.code(), "PERIOD_CLOSED");
    }

    #[test]
    fn test_error_body_shape() {
        let body = ServiceError::IdempotencyConflict.to_body();
        assert_eq!(body["code"], "IDEMPOTENCY_CONFLICT");
        assert!(body["error"].is_string());
    }
}
