//! Tagged results returned by every mutating operation.
//!
//! Callers branch on [`Action`] (or `success`), never on the error text.

use crate::schema;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Reactivated,
    Updated,
    Linked,
    Invalid,
    Conflict,
    AlreadyLinked,
    Unlinked,
    NotFound,
    Archived,
    Unchanged,
}

impl Action {
    pub fn is_success(self) -> bool {
        !matches!(self, Action::Invalid | Action::Conflict | Action::NotFound)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Reactivated => "reactivated",
            Action::Updated => "updated",
            Action::Linked => "linked",
            Action::Invalid => "invalid",
            Action::Conflict => "conflict",
            Action::AlreadyLinked => "already_linked",
            Action::Unlinked => "unlinked",
            Action::NotFound => "not_found",
            Action::Archived => "archived",
            Action::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which uniqueness rule a lost race or pre-insert check ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DuplicateSku,
    DuplicateDefaultVariant,
    DuplicateOptionCombination,
    DuplicateExternalId,
    DuplicateExternalSku,
    Unknown,
}

impl ConflictKind {
    /// Classify by constraint identity. Unnamed or unrecognised constraints
    /// fall back to [`ConflictKind::Unknown`].
    pub fn from_constraint(constraint: Option<&str>) -> Self {
        match constraint {
            Some(schema::VARIANTS_SKU_UNIQUE) => ConflictKind::DuplicateSku,
            Some(schema::VARIANTS_DEFAULT_ACTIVE_UNIQUE) => ConflictKind::DuplicateDefaultVariant,
            Some(schema::VARIANTS_DIGEST_ACTIVE_UNIQUE) => ConflictKind::DuplicateOptionCombination,
            Some(schema::EXTERNAL_IDS_IDENTITY_UNIQUE) => ConflictKind::DuplicateExternalId,
            Some(schema::VARIANTS_EXTERNAL_SKU_UNIQUE) => ConflictKind::DuplicateExternalSku,
            _ => ConflictKind::Unknown,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ConflictKind::DuplicateSku => "SKU is already taken for this product",
            ConflictKind::DuplicateDefaultVariant => "Product already has an active default variant",
            ConflictKind::DuplicateOptionCombination => {
                "An active variant with this option combination already exists"
            }
            ConflictKind::DuplicateExternalId => "External ID is already mapped to a variant",
            ConflictKind::DuplicateExternalSku => "External SKU is already in use",
            ConflictKind::Unknown => "Variant conflicts with an existing record",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::DuplicateSku => "duplicate_sku",
            ConflictKind::DuplicateDefaultVariant => "duplicate_default_variant",
            ConflictKind::DuplicateOptionCombination => "duplicate_option_combination",
            ConflictKind::DuplicateExternalId => "duplicate_external_id",
            ConflictKind::DuplicateExternalSku => "duplicate_external_sku",
            ConflictKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// `{success, entity, action, error}` result of a service call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub entity: Option<T>,
    pub action: Action,
    pub error: Option<String>,
}

impl<T> OperationResult<T> {
    pub fn ok(action: Action, entity: T) -> Self {
        Self {
            success: action.is_success(),
            entity: Some(entity),
            action,
            error: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::failed(Action::Invalid, message)
    }

    pub fn conflict(kind: ConflictKind) -> Self {
        Self::failed(Action::Conflict, kind.message())
    }

    pub fn conflict_with(message: impl Into<String>) -> Self {
        Self::failed(Action::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::failed(Action::NotFound, message)
    }

    fn failed(action: Action, message: impl Into<String>) -> Self {
        Self {
            success: false,
            entity: None,
            action,
            error: Some(message.into()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            entity: self.entity.map(f),
            action: self.action,
            error: self.error,
        }
    }

    /// Re-tag a failure for a different entity type.
    pub fn cast<U>(self) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            entity: None,
            action: self.action,
            error: self.error,
        }
    }
}
