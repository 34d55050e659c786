//! Catalog schema and the constraint names the services classify on.
//!
//! Both [`crate::store::PgCatalogStore`] and [`crate::store::MemoryCatalogStore`]
//! report violations under these exact names.

use crate::executor::{ExecError, SqlExecutor};

pub const VARIANTS_SKU_UNIQUE: &str = "index_variants_on_product_id_and_sku";
pub const VARIANTS_DEFAULT_ACTIVE_UNIQUE: &str = "index_variants_on_product_id_default_active";
pub const VARIANTS_DIGEST_ACTIVE_UNIQUE: &str = "index_variants_on_product_id_and_options_digest_active";
pub const VARIANTS_EXTERNAL_SKU_UNIQUE: &str = "index_variants_on_external_sku";
pub const VARIANTS_PRICE_CHECK: &str = "variants_price_non_negative";
pub const VARIANTS_STOCK_CHECK: &str = "variants_stock_non_negative";
pub const OPTION_VALUE_VARIANTS_UNIQUE: &str = "index_option_value_variants_on_variant_and_value";
pub const EXTERNAL_IDS_IDENTITY_UNIQUE: &str = "index_variant_external_ids_on_identity";

/// Idempotent DDL, one statement per entry.
pub const CATALOG_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS products (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        price NUMERIC(12, 2),
        status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'archived')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS option_types (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        position INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS option_values (
        id BIGSERIAL PRIMARY KEY,
        option_type_id BIGINT NOT NULL REFERENCES option_types (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        UNIQUE (option_type_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS product_option_types (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL REFERENCES products (id) ON DELETE CASCADE,
        option_type_id BIGINT NOT NULL REFERENCES option_types (id) ON DELETE CASCADE,
        UNIQUE (product_id, option_type_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS variants (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL REFERENCES products (id) ON DELETE CASCADE,
        sku TEXT NOT NULL,
        external_sku TEXT,
        price NUMERIC(12, 2) NOT NULL,
        stock INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
        options_digest TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT variants_price_non_negative CHECK (price >= 0),
        CONSTRAINT variants_stock_non_negative CHECK (stock >= 0)
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS index_variants_on_product_id_and_sku
        ON variants (product_id, sku)"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS index_variants_on_product_id_default_active
        ON variants (product_id) WHERE options_digest IS NULL AND status = 'active'"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS index_variants_on_product_id_and_options_digest_active
        ON variants (product_id, options_digest) WHERE status = 'active'"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS index_variants_on_external_sku
        ON variants (external_sku) WHERE external_sku IS NOT NULL"#,
    r#"CREATE TABLE IF NOT EXISTS option_value_variants (
        id BIGSERIAL PRIMARY KEY,
        variant_id BIGINT NOT NULL REFERENCES variants (id) ON DELETE CASCADE,
        option_value_id BIGINT NOT NULL REFERENCES option_values (id) ON DELETE CASCADE
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS index_option_value_variants_on_variant_and_value
        ON option_value_variants (variant_id, option_value_id)"#,
    r#"CREATE TABLE IF NOT EXISTS variant_external_ids (
        id BIGSERIAL PRIMARY KEY,
        variant_id BIGINT NOT NULL REFERENCES variants (id) ON DELETE CASCADE,
        source TEXT NOT NULL,
        source_account TEXT NOT NULL DEFAULT '',
        external_id TEXT NOT NULL,
        external_sku TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS index_variant_external_ids_on_identity
        ON variant_external_ids (source, source_account, external_id)"#,
];

/// Create the catalog tables and indexes if they do not exist.
pub fn install<E: SqlExecutor + ?Sized>(executor: &E) -> Result<(), ExecError> {
    for statement in CATALOG_DDL {
        executor.execute(statement, &[])?;
    }
    log::info!("catalog schema installed ({} statements)", CATALOG_DDL.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_classified_constraint_is_declared() {
        let ddl = CATALOG_DDL.join("\n");
        for name in [
            VARIANTS_SKU_UNIQUE,
            VARIANTS_DEFAULT_ACTIVE_UNIQUE,
            VARIANTS_DIGEST_ACTIVE_UNIQUE,
            VARIANTS_EXTERNAL_SKU_UNIQUE,
            VARIANTS_PRICE_CHECK,
            VARIANTS_STOCK_CHECK,
            OPTION_VALUE_VARIANTS_UNIQUE,
            EXTERNAL_IDS_IDENTITY_UNIQUE,
        ] {
            assert!(ddl.contains(name), "constraint {name} missing from DDL");
        }
    }

    #[test]
    fn test_digest_indexes_only_bind_active_rows() {
        let default_index = CATALOG_DDL
            .iter()
            .find(|s| s.contains(VARIANTS_DEFAULT_ACTIVE_UNIQUE))
            .unwrap();
        assert!(default_index.contains("status = 'active'"));
        assert!(default_index.contains("options_digest IS NULL"));

        let digest_index = CATALOG_DDL
            .iter()
            .find(|s| s.contains(VARIANTS_DIGEST_ACTIVE_UNIQUE))
            .unwrap();
        assert!(digest_index.contains("WHERE status = 'active'"));
    }
}
