//! Errors that escape the service boundary.
//!
//! Invalid input and uniqueness conflicts are reported through
//! [`crate::outcome::OperationResult`] instead; what remains here is either a
//! caller bug ([`VariantError::PreconditionFailed`], eager bulk input errors)
//! or a store failure the caller's retry policy owns.

use crate::ids::IdError;
use crate::store::StoreError;
use std::fmt;

#[derive(Debug)]
pub enum VariantError {
    /// Operation called in a state it does not support (e.g. lock outside a transaction)
    PreconditionFailed(String),
    /// Malformed identifier in eagerly validated input
    InvalidId(IdError),
    /// Malformed or out-of-range value in eagerly validated input
    InvalidValue { key: String, reason: String },
    /// Store failure not classified by the service
    Store(StoreError),
}

impl fmt::Display for VariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantError::PreconditionFailed(msg) => write!(f, "Precondition failed: {msg}"),
            VariantError::InvalidId(e) => write!(f, "{e}"),
            VariantError::InvalidValue { key, reason } => {
                write!(f, "Invalid value for {key}: {reason}")
            }
            VariantError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for VariantError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VariantError::InvalidId(e) => Some(e),
            VariantError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for VariantError {
    fn from(err: StoreError) -> Self {
        VariantError::Store(err)
    }
}

impl From<IdError> for VariantError {
    fn from(err: IdError) -> Self {
        VariantError::InvalidId(err)
    }
}

impl VariantError {
    /// The store error inside, when this came from the store.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            VariantError::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ConflictKind;

    #[test]
    fn test_variant_error_display() {
        let err = VariantError::PreconditionFailed("no transaction".to_string());
        assert!(err.to_string().contains("Precondition failed"));

        let err: VariantError = IdError::NonPositiveId(0).into();
        assert!(err.to_string().contains("positive"));

        let err = VariantError::InvalidValue {
            key: "7".to_string(),
            reason: "not a number".to_string(),
        };
        assert!(err.to_string().contains("Invalid value for 7"));
    }

    #[test]
    fn test_as_store() {
        let err: VariantError = StoreError::Validation(ConflictKind::DuplicateSku).into();
        assert!(err.as_store().is_some());
        assert!(VariantError::PreconditionFailed(String::new()).as_store().is_none());
    }
}
