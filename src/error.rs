//! Error types for the case lifecycle engine.
//!
//! Errors are classified by recoverability:
//! - Retryable: a concurrent write lost a race at the store (`StoreConflict`)
//! - Queued: the classifier was unavailable; the message waits in the retry queue
//! - RequiresUserAction: unresolved broker, illegal transition, missing field
//!
//! Every operation returns these as values. Nothing is swallowed.

use serde::Serialize;
use thiserror::Error;

use crate::db::DbError;
use crate::types::CaseStatus;

/// Error types for pipeline and lifecycle operations.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("No broker identity matched sender {from} (cc: {cc})")]
    UnresolvedBroker { from: String, cc: String },

    #[error("Classifier unavailable: {0}")]
    ClassificationUnavailable(String),

    #[error("Classification rejected: {0}")]
    InvalidClassification(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: CaseStatus, to: CaseStatus },

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("Case {case_id} already has ticket {ticket}")]
    TicketAlreadyIssued { case_id: String, ticket: String },

    #[error("Concurrent write conflict: {0}")]
    StoreConflict(String),

    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("Deadline exceeded during {0}")]
    Timeout(&'static str),

    #[error("Store error: {0}")]
    Store(String),
}

/// Machine-readable error kind, serialized with its wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UnresolvedBroker,
    ClassificationUnavailable,
    InvalidClassification,
    InvalidTransition,
    MissingRequiredField,
    TicketAlreadyIssued,
    StoreConflict,
    NotFound,
    Timeout,
    StoreError,
}

impl CaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaseError::UnresolvedBroker { .. } => ErrorKind::UnresolvedBroker,
            CaseError::ClassificationUnavailable(_) => ErrorKind::ClassificationUnavailable,
            CaseError::InvalidClassification(_) => ErrorKind::InvalidClassification,
            CaseError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            CaseError::MissingRequiredField(_) => ErrorKind::MissingRequiredField,
            CaseError::TicketAlreadyIssued { .. } => ErrorKind::TicketAlreadyIssued,
            CaseError::StoreConflict(_) => ErrorKind::StoreConflict,
            CaseError::NotFound(_) => ErrorKind::NotFound,
            CaseError::Timeout(_) => ErrorKind::Timeout,
            CaseError::Store(_) => ErrorKind::StoreError,
        }
    }

    /// Returns true if the operation may be blindly retried.
    ///
    /// Only lost races qualify; everything else needs new input or a human.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaseError::StoreConflict(_))
    }

    /// Returns true if this error requires a person to resolve it
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            CaseError::UnresolvedBroker { .. }
                | CaseError::InvalidClassification(_)
                | CaseError::InvalidTransition { .. }
                | CaseError::MissingRequiredField(_)
                | CaseError::TicketAlreadyIssued { .. }
        )
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            CaseError::UnresolvedBroker { .. } => {
                "The message was sent to manual triage. Assign a broker by hand."
            }
            CaseError::ClassificationUnavailable(_) => {
                "The message was queued and will be classified on the next retry."
            }
            CaseError::InvalidClassification(_) => {
                "Review the classifier output; the message was not turned into a case."
            }
            CaseError::InvalidTransition { .. } => {
                "Pick one of the statuses allowed from the current status."
            }
            CaseError::MissingRequiredField(_) => "Fill in the required field and try again.",
            CaseError::TicketAlreadyIssued { .. } => {
                "Tickets are permanent. Open a new case if the classification changed."
            }
            CaseError::StoreConflict(_) => "Someone else changed the case. Reload and try again.",
            CaseError::NotFound(_) => "Check the case id.",
            CaseError::Timeout(_) => "Nothing was saved. Try again.",
            CaseError::Store(_) => "Check the database file and disk space.",
        }
    }
}

impl From<DbError> for CaseError {
    fn from(err: DbError) -> Self {
        if err.is_busy() {
            CaseError::StoreConflict(err.to_string())
        } else {
            CaseError::Store(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for CaseError {
    fn from(err: rusqlite::Error) -> Self {
        CaseError::from(DbError::from(err))
    }
}

/// Serializable error representation handed to callers of the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseFailure {
    pub message: String,
    pub kind: ErrorKind,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

impl From<&CaseError> for CaseFailure {
    fn from(err: &CaseError) -> Self {
        CaseFailure {
            message: err.to_string(),
            kind: err.kind(),
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
