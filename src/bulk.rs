//! Multi-variant mutations under the ascending-id lock discipline.
//!
//! Input is validated in full before the store is touched. Rows are then
//! locked in one `SELECT … ORDER BY id FOR UPDATE`, and only ids present in
//! the input are written.

use crate::error::VariantError;
use crate::ids::{normalize_ids, parse_id, parse_strict_integer, RawToken};
use crate::model::{price_error, Variant, VariantChanges};
use crate::store::{with_savepoint, CatalogStore};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

static STRICT_DECIMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?$").expect("static regex"));

/// Per-id outcome of a bulk update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub updated: Vec<i64>,
    /// Already at the requested value; not written
    pub unchanged: Vec<i64>,
    /// No such variant
    pub missing: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StockDecrement {
    Applied(Vec<Variant>),
    InsufficientStock {
        variant_id: i64,
        requested: i32,
        available: i32,
    },
    NotFound(i64),
}

fn invalid_value(key: i64, reason: impl Into<String>) -> VariantError {
    VariantError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_key(token: RawToken<'_>) -> Result<i64, VariantError> {
    match parse_id(&token)? {
        Some(id) => Ok(id),
        None => Err(VariantError::InvalidValue {
            key: String::new(),
            reason: "variant id must not be blank".to_string(),
        }),
    }
}

fn value_text(key: i64, token: &RawToken<'_>) -> Result<String, VariantError> {
    let text = token.as_text().trim().to_string();
    if text.is_empty() {
        return Err(invalid_value(key, "value must not be blank"));
    }
    Ok(text)
}

fn parse_count(key: i64, token: RawToken<'_>) -> Result<i32, VariantError> {
    let text = value_text(key, &token)?;
    let value = parse_strict_integer(&text).map_err(|e| invalid_value(key, e.to_string()))?;
    i32::try_from(value).map_err(|_| invalid_value(key, format!("{value} is out of range")))
}

fn parse_stock(key: i64, token: RawToken<'_>) -> Result<i32, VariantError> {
    let stock = parse_count(key, token)?;
    if stock < 0 {
        return Err(invalid_value(key, format!("stock must not be negative (got {stock})")));
    }
    Ok(stock)
}

fn parse_price(key: i64, token: RawToken<'_>) -> Result<Decimal, VariantError> {
    let text = value_text(key, &token)?;
    if !STRICT_DECIMAL.is_match(&text) {
        return Err(invalid_value(key, format!("{text:?} is not a decimal number")));
    }
    let price = Decimal::from_str(&text).map_err(|e| invalid_value(key, e.to_string()))?;
    if let Some(reason) = price_error(price) {
        return Err(invalid_value(key, reason));
    }
    Ok(price)
}

/// Parse every entry up front; a repeated id keeps its last value.
fn parse_entries<'k, 'v, I, K, V, T, P>(entries: I, parse: P) -> Result<BTreeMap<i64, T>, VariantError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<RawToken<'k>>,
    V: Into<RawToken<'v>>,
    P: Fn(i64, RawToken<'v>) -> Result<T, VariantError>,
{
    let mut parsed = BTreeMap::new();
    for (key, value) in entries {
        let id = parse_key(key.into())?;
        parsed.insert(id, parse(id, value.into())?);
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkMutationService;

impl BulkMutationService {
    pub fn new() -> Self {
        Self
    }

    /// Lock the variants named by `ids` in ascending id order and hand the
    /// locked rows to `f`, inside a savepoint.
    ///
    /// Ids that match no row are skipped. Malformed ids fail before any lock.
    pub fn lock_variants<'a, S, I, T, R, F>(&self, store: &mut S, ids: I, f: F) -> Result<R, VariantError>
    where
        S: CatalogStore + ?Sized,
        I: IntoIterator<Item = T>,
        T: Into<RawToken<'a>>,
        F: FnOnce(&mut S, Vec<Variant>) -> Result<R, VariantError>,
    {
        let ids = normalize_ids(ids)?;
        with_savepoint(store, |s| {
            let rows = s.lock_variants(&ids)?;
            log::debug!("locked {} of {} variants", rows.len(), ids.len());
            f(s, rows)
        })
    }

    /// Set stock per variant id.
    ///
    /// ```
    /// use variantguard::bulk::BulkMutationService;
    /// use variantguard::store::MemoryCatalogStore;
    ///
    /// let mut store = MemoryCatalogStore::new();
    /// let err = BulkMutationService::new()
    ///     .bulk_update_stock(&mut store, [("1", "ten")])
    ///     .unwrap_err();
    /// assert!(err.to_string().contains("Invalid value for 1"));
    /// assert!(store.lock_events().is_empty());
    /// ```
    pub fn bulk_update_stock<'k, 'v, S, I, K, V>(&self, store: &mut S, entries: I) -> Result<BulkReport, VariantError>
    where
        S: CatalogStore + ?Sized,
        I: IntoIterator<Item = (K, V)>,
        K: Into<RawToken<'k>>,
        V: Into<RawToken<'v>>,
    {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("variantguard.bulk_update_stock").entered();

        let targets = parse_entries(entries, parse_stock)?;
        apply(store, &targets, |variant, stock| {
            (variant.stock != *stock).then(|| VariantChanges {
                stock: Some(*stock),
                ..Default::default()
            })
        })
    }

    /// Set price per variant id. Values are strict decimals (`"12.50"`).
    pub fn bulk_update_price<'k, 'v, S, I, K, V>(&self, store: &mut S, entries: I) -> Result<BulkReport, VariantError>
    where
        S: CatalogStore + ?Sized,
        I: IntoIterator<Item = (K, V)>,
        K: Into<RawToken<'k>>,
        V: Into<RawToken<'v>>,
    {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("variantguard.bulk_update_price").entered();

        let targets = parse_entries(entries, parse_price)?;
        apply(store, &targets, |variant, price| {
            (variant.price != *price).then(|| VariantChanges {
                price: Some(*price),
                ..Default::default()
            })
        })
    }

    /// Take `quantity` units from each variant, all or nothing.
    pub fn decrement_stock<'k, 'v, S, I, K, V>(&self, store: &mut S, lines: I) -> Result<StockDecrement, VariantError>
    where
        S: CatalogStore + ?Sized,
        I: IntoIterator<Item = (K, V)>,
        K: Into<RawToken<'k>>,
        V: Into<RawToken<'v>>,
    {
        let quantities = parse_entries(lines, |key, token| {
            let quantity = parse_count(key, token)?;
            if quantity <= 0 {
                return Err(invalid_value(key, format!("quantity must be positive (got {quantity})")));
            }
            Ok(quantity)
        })?;
        let ids: Vec<i64> = quantities.keys().copied().collect();

        with_savepoint(store, |s| {
            let rows = s.lock_variants(&ids)?;
            if let Some(missing) = ids.iter().find(|id| !rows.iter().any(|v| v.id == **id)) {
                return Ok(StockDecrement::NotFound(*missing));
            }
            for variant in &rows {
                let requested = quantities[&variant.id];
                if variant.stock < requested {
                    log::debug!(
                        "variant {} has {} units, {} requested",
                        variant.id,
                        variant.stock,
                        requested
                    );
                    return Ok(StockDecrement::InsufficientStock {
                        variant_id: variant.id,
                        requested,
                        available: variant.stock,
                    });
                }
            }
            let mut updated = Vec::with_capacity(rows.len());
            for variant in rows {
                let changes = VariantChanges {
                    stock: Some(variant.stock - quantities[&variant.id]),
                    ..Default::default()
                };
                updated.push(s.update_variant(variant.id, &changes)?);
            }
            Ok(StockDecrement::Applied(updated))
        })
    }
}

fn apply<S, T, F>(store: &mut S, targets: &BTreeMap<i64, T>, diff: F) -> Result<BulkReport, VariantError>
where
    S: CatalogStore + ?Sized,
    F: Fn(&Variant, &T) -> Option<VariantChanges>,
{
    let ids: Vec<i64> = targets.keys().copied().collect();
    with_savepoint(store, |s| {
        let rows = s.lock_variants(&ids)?;
        let mut report = BulkReport::default();
        for variant in &rows {
            match diff(variant, &targets[&variant.id]) {
                Some(changes) => {
                    s.update_variant(variant.id, &changes)?;
                    report.updated.push(variant.id);
                }
                None => report.unchanged.push(variant.id),
            }
        }
        report.missing = ids
            .iter()
            .copied()
            .filter(|id| !rows.iter().any(|v| v.id == *id))
            .collect();
        log::debug!(
            "bulk update: {} written, {} unchanged, {} missing",
            report.updated.len(),
            report.unchanged.len(),
            report.missing.len()
        );
        Ok(report)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewVariant, VariantStatus};
    use crate::store::{LockEvent, MemoryCatalogStore};

    fn store_with_stock(stocks: &[i32]) -> (MemoryCatalogStore, Vec<i64>) {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Pen", None).id;
        let ids = stocks
            .iter()
            .enumerate()
            .map(|(i, stock)| {
                store
                    .insert_variant(
                        &NewVariant {
                            product_id: product,
                            sku: format!("PEN-{i}"),
                            external_sku: None,
                            price: Decimal::new(250, 2),
                            stock: *stock,
                            status: VariantStatus::Active,
                            options_digest: Some(format!("digest-{i}")),
                        },
                        &[],
                    )
                    .unwrap()
                    .id
            })
            .collect();
        store.clear_variant_writes();
        (store, ids)
    }

    #[test]
    fn test_equal_values_are_not_written() {
        let (mut store, ids) = store_with_stock(&[10, 5]);
        let report = BulkMutationService::new()
            .bulk_update_stock(&mut store, [(ids[0], "10"), (ids[1], "20")])
            .unwrap();
        assert_eq!(report.unchanged, vec![ids[0]]);
        assert_eq!(report.updated, vec![ids[1]]);
        assert_eq!(store.variant_writes(), &[ids[1]]);
        assert_eq!(store.find_variant(ids[1]).unwrap().unwrap().stock, 20);
    }

    #[test]
    fn test_non_numeric_value_fails_before_store_access() {
        let (mut store, ids) = store_with_stock(&[1, 1]);
        let err = BulkMutationService::new()
            .bulk_update_stock(&mut store, [(ids[0], "7"), (ids[1], "7.5")])
            .unwrap_err();
        assert!(matches!(err, VariantError::InvalidValue { .. }));
        assert!(store.lock_events().is_empty());
        assert!(store.variant_writes().is_empty());
    }

    #[test]
    fn test_blank_key_and_negative_value_are_rejected() {
        let (mut store, ids) = store_with_stock(&[1]);
        let service = BulkMutationService::new();
        assert!(service.bulk_update_stock(&mut store, [("  ", "3")]).is_err());
        assert!(service.bulk_update_stock(&mut store, [(ids[0], "-1")]).is_err());
        assert!(matches!(
            service.bulk_update_stock(&mut store, [("0x1", "3")]),
            Err(VariantError::InvalidId(_))
        ));
        assert!(store.lock_events().is_empty());
    }

    #[test]
    fn test_locks_ascending_regardless_of_input_order() {
        let (mut store, ids) = store_with_stock(&[1, 1, 1]);
        BulkMutationService::new()
            .bulk_update_stock(&mut store, [(ids[2], "4"), (ids[0], "4"), (ids[1], "4")])
            .unwrap();
        assert_eq!(store.lock_events(), &[LockEvent::Variants(ids.clone())]);
        assert_eq!(store.variant_writes(), ids.as_slice());
    }

    #[test]
    fn test_untouched_and_missing_ids() {
        let (mut store, ids) = store_with_stock(&[1, 2, 3]);
        let report = BulkMutationService::new()
            .bulk_update_price(&mut store, [(ids[1].to_string(), "3.10".to_string()), ("999".to_string(), "1".to_string())])
            .unwrap();
        assert_eq!(report.updated, vec![ids[1]]);
        assert_eq!(report.missing, vec![999]);
        assert_eq!(store.find_variant(ids[0]).unwrap().unwrap().price, Decimal::new(250, 2));
        assert_eq!(store.find_variant(ids[1]).unwrap().unwrap().price, Decimal::new(310, 2));
    }

    #[test]
    fn test_price_parsing_is_strict() {
        let (mut store, ids) = store_with_stock(&[1]);
        let service = BulkMutationService::new();
        for bad in ["1e3", "01.5", "1,5", " ", "-2.00", "0x10"] {
            assert!(
                service.bulk_update_price(&mut store, [(ids[0], bad)]).is_err(),
                "{bad:?} should be rejected"
            );
        }
        let report = service.bulk_update_price(&mut store, [(ids[0], "2.500")]).unwrap();
        assert_eq!(report.unchanged, vec![ids[0]]);
    }

    #[test]
    fn test_price_outside_numeric_column_fails_before_store_access() {
        let (mut store, ids) = store_with_stock(&[1, 1]);
        store.clear_lock_events();
        let service = BulkMutationService::new();
        for bad in ["1.005", "0.001", "10000000000", "12345678901.5"] {
            let err = service
                .bulk_update_price(&mut store, [(ids[0], "3.00"), (ids[1], bad)])
                .unwrap_err();
            assert!(
                matches!(&err, VariantError::InvalidValue { key, .. } if *key == ids[1].to_string()),
                "{bad:?}: {err:?}"
            );
        }
        assert!(store.lock_events().is_empty());
        assert!(store.variant_writes().is_empty());

        let report = service
            .bulk_update_price(&mut store, [(ids[0], "9999999999.99")])
            .unwrap();
        assert_eq!(report.updated, vec![ids[0]]);
    }

    #[test]
    fn test_lock_variants_hands_rows_to_callback() {
        let (mut store, ids) = store_with_stock(&[4, 6]);
        let raw = vec![ids[1].to_string(), String::new(), ids[0].to_string()];
        let total: i32 = BulkMutationService::new()
            .lock_variants(&mut store, raw, |_, rows| Ok(rows.iter().map(|v| v.stock).sum()))
            .unwrap();
        assert_eq!(total, 10);
        assert_eq!(store.lock_events(), &[LockEvent::Variants(ids)]);
    }

    #[test]
    fn test_decrement_is_all_or_nothing() {
        let (mut store, ids) = store_with_stock(&[5, 1]);
        let service = BulkMutationService::new();

        let short = service
            .decrement_stock(&mut store, [(ids[0], 2), (ids[1], 3)])
            .unwrap();
        assert_eq!(
            short,
            StockDecrement::InsufficientStock {
                variant_id: ids[1],
                requested: 3,
                available: 1,
            }
        );
        assert!(store.variant_writes().is_empty());

        match service.decrement_stock(&mut store, [(ids[0], 2), (ids[1], 1)]).unwrap() {
            StockDecrement::Applied(rows) => {
                assert_eq!(rows.iter().map(|v| v.stock).collect::<Vec<_>>(), vec![3, 0]);
            }
            other => panic!("expected applied, got {other:?}"),
        }

        assert_eq!(
            service.decrement_stock(&mut store, [(999_i64, 1)]).unwrap(),
            StockDecrement::NotFound(999)
        );
        assert!(service.decrement_stock(&mut store, [(ids[0], 0)]).is_err());
    }
}
