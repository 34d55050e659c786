//! Option-selection rules shared by the resolver and the options updater.

use crate::store::{CatalogStore, StoreError};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Why an option selection cannot identify a variant of a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionViolation {
    /// Ids with no option value row
    UnknownOptionValues(Vec<i64>),
    /// Two or more values share this option type
    DuplicateOptionType(i64),
    /// The option type is not enabled for the product
    OptionTypeNotEnabled(i64),
}

impl fmt::Display for SelectionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionViolation::UnknownOptionValues(ids) => {
                let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
                write!(f, "unknown option values: {}", ids.join(", "))
            }
            SelectionViolation::DuplicateOptionType(id) => {
                write!(f, "more than one value selected for option type {id}")
            }
            SelectionViolation::OptionTypeNotEnabled(id) => {
                write!(f, "option type {id} is not enabled for this product")
            }
        }
    }
}

/// Every rule `option_value_ids` (already normalized) breaks for `product_id`.
/// An empty selection always passes: it names the default variant.
pub fn violations<S: CatalogStore + ?Sized>(
    store: &mut S,
    product_id: i64,
    option_value_ids: &[i64],
) -> Result<Vec<SelectionViolation>, StoreError> {
    if option_value_ids.is_empty() {
        return Ok(Vec::new());
    }

    let values = store.find_option_values(option_value_ids)?;
    let mut found = HashMap::with_capacity(values.len());
    for value in &values {
        found.insert(value.id, value.option_type_id);
    }

    let mut problems = Vec::new();
    let unknown: Vec<i64> = option_value_ids
        .iter()
        .copied()
        .filter(|id| !found.contains_key(id))
        .collect();
    if !unknown.is_empty() {
        problems.push(SelectionViolation::UnknownOptionValues(unknown));
    }

    let mut per_type: HashMap<i64, usize> = HashMap::new();
    for type_id in found.values() {
        *per_type.entry(*type_id).or_default() += 1;
    }
    let mut duplicated: Vec<i64> = per_type
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(type_id, _)| *type_id)
        .collect();
    duplicated.sort_unstable();
    problems.extend(duplicated.into_iter().map(SelectionViolation::DuplicateOptionType));

    let enabled: BTreeSet<i64> = store.enabled_option_type_ids(product_id)?.into_iter().collect();
    let referenced: BTreeSet<i64> = found.values().copied().collect();
    problems.extend(
        referenced
            .difference(&enabled)
            .copied()
            .map(SelectionViolation::OptionTypeNotEnabled),
    );

    Ok(problems)
}

pub fn is_valid<S: CatalogStore + ?Sized>(
    store: &mut S,
    product_id: i64,
    option_value_ids: &[i64],
) -> Result<bool, StoreError> {
    Ok(violations(store, product_id, option_value_ids)?.is_empty())
}

/// One-line message for an `invalid` result.
pub fn describe(violations: &[SelectionViolation]) -> String {
    let parts: Vec<String> = violations.iter().map(ToString::to_string).collect();
    format!("Invalid option selection: {}", parts.join("; "))
}
