//! Error types shared across the engine
//!
//! Input errors only: a malformed record or event is local to itself and
//! is skipped by the caller. Dependency and logical errors live with the
//! component that owns the dependency.

use thiserror::Error;

/// Why a raw collection line could not become a quantity event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("malformed line: {reason}")]
    MalformedLine { reason: MalformedReason },
}

/// Detail for [`NormalizationError::MalformedLine`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    #[error("missing quantity")]
    MissingQuantity,

    #[error("quantity must be a positive integer")]
    NonPositiveQuantity,

    #[error("quantity out of range")]
    QuantityOverflow,

    #[error("empty item name")]
    EmptyName,
}

impl NormalizationError {
    pub fn malformed(reason: MalformedReason) -> Self {
        Self::MalformedLine { reason }
    }
}

/// A decoded event that cannot be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event has no collection id")]
    MissingCollectionId,

    #[error("event has no item identity")]
    MissingItemIdentity,

    #[error("event quantity must be positive")]
    InvalidQuantity,

    #[error("unexpected event type: expected {expected}, got {actual}")]
    UnexpectedType { expected: String, actual: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),
}
