//! Catalog rows as seen by the identity and concurrency services.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Active,
    Inactive,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(ProductStatus { Active => "active", Archived => "archived" });
text_enum!(VariantStatus { Active => "active", Inactive => "inactive" });

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    /// Null only while the product sells through active variants.
    pub price: Option<Decimal>,
    pub status: ProductStatus,
}

/// An option axis such as "Color".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionType {
    pub id: i64,
    pub name: String,
    pub position: i32,
}

/// A value on an axis such as "Red".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionValue {
    pub id: i64,
    pub option_type_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub id: i64,
    pub product_id: i64,
    pub sku: String,
    pub external_sku: Option<String>,
    pub price: Decimal,
    pub stock: i32,
    pub status: VariantStatus,
    /// `None` marks the default, option-less variant.
    pub options_digest: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Variant {
    pub fn is_active(&self) -> bool {
        self.status == VariantStatus::Active
    }
}

/// Row to insert; option links are written in the same call.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVariant {
    pub product_id: i64,
    pub sku: String,
    pub external_sku: Option<String>,
    pub price: Decimal,
    pub stock: i32,
    pub status: VariantStatus,
    pub options_digest: Option<String>,
}

/// Decimal places a stored price may carry.
pub const PRICE_SCALE: u32 = 2;

/// Why `price` does not fit the `NUMERIC(12, 2)` price column, if it doesn't.
/// Trailing zeros beyond the scale are fine: `2.500` is stored as `2.50`.
pub fn price_error(price: Decimal) -> Option<String> {
    if price < Decimal::ZERO {
        return Some(format!("price must be greater than or equal to 0 (got {price})"));
    }
    if price.normalize().scale() > PRICE_SCALE {
        return Some(format!(
            "price must have at most {PRICE_SCALE} decimal places (got {price})"
        ));
    }
    if price >= Decimal::new(10_000_000_000, 0) {
        return Some(format!("price must be less than 10000000000 (got {price})"));
    }
    None
}

/// Caller-supplied variant attributes. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VariantAttributes {
    pub sku: Option<String>,
    pub external_sku: Option<String>,
    pub price: Option<Decimal>,
    pub stock: Option<i32>,
    pub status: Option<VariantStatus>,
}

impl VariantAttributes {
    pub fn desired_status(&self) -> VariantStatus {
        self.status.unwrap_or(VariantStatus::Active)
    }

    /// Column changes these attributes would make to `variant`. Status is
    /// excluded: it is decided by the identity state machine, not copied.
    pub fn changes_for(&self, variant: &Variant) -> VariantChanges {
        let sku = self
            .sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != variant.sku)
            .map(str::to_string);
        let external_sku = self
            .external_sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && variant.external_sku.as_deref() != Some(*s))
            .map(|s| Some(s.to_string()));
        VariantChanges {
            sku,
            external_sku,
            price: self.price.filter(|p| *p != variant.price),
            stock: self.stock.filter(|s| *s != variant.stock),
            status: None,
        }
    }

    /// First attribute that can never be stored, as a user-facing message.
    pub fn range_error(&self) -> Option<String> {
        if let Some(message) = self.price.and_then(price_error) {
            return Some(message);
        }
        if let Some(stock) = self.stock {
            if stock < 0 {
                return Some(format!("stock must be greater than or equal to 0 (got {stock})"));
            }
        }
        None
    }
}

/// Column-level update; only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantChanges {
    pub sku: Option<String>,
    pub external_sku: Option<Option<String>>,
    pub price: Option<Decimal>,
    pub stock: Option<i32>,
    pub status: Option<VariantStatus>,
}

impl VariantChanges {
    pub fn is_empty(&self) -> bool {
        self.sku.is_none()
            && self.external_sku.is_none()
            && self.price.is_none()
            && self.stock.is_none()
            && self.status.is_none()
    }

    pub fn apply_to(&self, variant: &mut Variant) {
        if let Some(sku) = &self.sku {
            variant.sku = sku.clone();
        }
        if let Some(external_sku) = &self.external_sku {
            variant.external_sku = external_sku.clone();
        }
        if let Some(price) = self.price {
            variant.price = price;
        }
        if let Some(stock) = self.stock {
            variant.stock = stock;
        }
        if let Some(status) = self.status {
            variant.status = status;
        }
    }
}

/// Normalized `(source, source_account, external_id)` idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExternalIdentity {
    source: String,
    source_account: String,
    external_id: String,
}

impl ExternalIdentity {
    /// Trims all parts and lower-cases source and account. Blank source or
    /// external id yields `None`; a blank account is the empty default account.
    pub fn normalize(source: &str, source_account: &str, external_id: &str) -> Option<Self> {
        let source = source.trim().to_lowercase();
        let external_id = external_id.trim();
        if source.is_empty() || external_id.is_empty() {
            return None;
        }
        Some(Self {
            source,
            source_account: source_account.trim().to_lowercase(),
            external_id: external_id.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_account(&self) -> &str {
        &self.source_account
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }
}

impl fmt::Display for ExternalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.source_account, self.external_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantExternalId {
    pub id: i64,
    pub variant_id: i64,
    pub source: String,
    pub source_account: String,
    pub external_id: String,
    pub external_sku: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn variant() -> Variant {
        Variant {
            id: 1,
            product_id: 1,
            sku: "TEE-RED-M".to_string(),
            external_sku: None,
            price: Decimal::new(1999, 2),
            stock: 4,
            status: VariantStatus::Active,
            options_digest: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip_text() {
        assert_eq!("inactive".parse::<VariantStatus>(), Ok(VariantStatus::Inactive));
        assert_eq!(ProductStatus::Archived.as_str(), "archived");
        assert!("deleted".parse::<VariantStatus>().is_err());
    }

    #[test]
    fn test_changes_skip_equal_and_null_values() {
        let attrs = VariantAttributes {
            sku: Some(" TEE-RED-M ".to_string()),
            price: Some(Decimal::new(1999, 2)),
            stock: Some(9),
            ..Default::default()
        };
        let changes = attrs.changes_for(&variant());
        assert_eq!(changes.sku, None);
        assert_eq!(changes.price, None);
        assert_eq!(changes.stock, Some(9));
        assert!(!changes.is_empty());

        assert!(VariantAttributes::default().changes_for(&variant()).is_empty());
    }

    #[test]
    fn test_range_error() {
        let attrs = VariantAttributes {
            stock: Some(-1),
            ..Default::default()
        };
        assert!(attrs.range_error().unwrap().contains("stock"));

        let attrs = VariantAttributes {
            price: Some(Decimal::new(-1, 0)),
            ..Default::default()
        };
        assert!(attrs.range_error().unwrap().contains("price"));
        assert!(VariantAttributes::default().range_error().is_none());
    }

    #[test]
    fn test_price_error_matches_numeric_12_2() {
        assert!(price_error(Decimal::new(1999, 2)).is_none());
        assert!(price_error(Decimal::new(2500, 3)).is_none());
        assert!(price_error(Decimal::new(999_999_999_999, 2)).is_none());

        assert!(price_error(Decimal::new(12345, 3)).unwrap().contains("decimal places"));
        assert!(price_error(Decimal::new(10_000_000_000, 0)).unwrap().contains("less than"));
        assert!(price_error(Decimal::new(-1, 2)).unwrap().contains("greater than or equal"));

        let attrs = VariantAttributes {
            price: Some(Decimal::new(1001, 3)),
            ..Default::default()
        };
        assert!(attrs.range_error().unwrap().contains("price"));
    }

    #[test]
    fn test_external_identity_normalization() {
        let identity = ExternalIdentity::normalize(" Shopify ", " ACME ", " gid-42 ").unwrap();
        assert_eq!(identity.source(), "shopify");
        assert_eq!(identity.source_account(), "acme");
        assert_eq!(identity.external_id(), "gid-42");

        assert!(ExternalIdentity::normalize("shopify", "acme", "   ").is_none());
        assert!(ExternalIdentity::normalize("", "acme", "1").is_none());
        assert_eq!(
            ExternalIdentity::normalize("shopify", "", "1").unwrap().source_account(),
            ""
        );
    }
}
