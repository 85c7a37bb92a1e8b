//! # Product Repository
//!
//! Products are matched across devices by `sku`; the surrogate `id` stays
//! local to the device that inserted the row.
//!
//! ## Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  insert / replace_by_sku (&self)        standalone write on the pool    │
//! │  insert_in / replace_by_sku_in (conn)   inside a caller's transaction   │
//! │                                         (entity + change record)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::Product;

const PRODUCT_COLUMNS: &str = "id, sku, barcode, name, description, price_cents, cost_cents, \
     tax_rate_bps, track_inventory, allow_negative_stock, current_stock, is_active, \
     created_at, updated_at, sync_version";

/// Repository for product database operations.
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    /// All products, active or not, ordered by sku.
    pub async fn list(&self) -> DbResult<Vec<Product>> {
        let sql = format!("SELECT {} FROM products ORDER BY sku", PRODUCT_COLUMNS);
        let products = sqlx::query_as::<_, Product>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(products)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLUMNS);
        let product = sqlx::query_as::<_, Product>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    /// Looks a product up by its natural key.
    pub async fn get_by_sku(&self, sku: &str) -> DbResult<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE sku = ?1", PRODUCT_COLUMNS);
        let product = sqlx::query_as::<_, Product>(&sql)
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    pub async fn insert(&self, product: &Product) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in(&mut conn, product).await
    }

    /// Inserts a product on an existing connection or transaction.
    pub async fn insert_in(conn: &mut SqliteConnection, product: &Product) -> DbResult<()> {
        debug!(sku = %product.sku, "Inserting product");

        sqlx::query(
            r#"
            INSERT INTO products (
                id, sku, barcode, name, description, price_cents, cost_cents,
                tax_rate_bps, track_inventory, allow_negative_stock, current_stock,
                is_active, created_at, updated_at, sync_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&product.id)
        .bind(&product.sku)
        .bind(&product.barcode)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price_cents)
        .bind(product.cost_cents)
        .bind(product.tax_rate_bps)
        .bind(product.track_inventory)
        .bind(product.allow_negative_stock)
        .bind(product.current_stock)
        .bind(product.is_active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .bind(product.sync_version)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, &product.sku),
            other => other,
        })?;

        Ok(())
    }

    pub async fn replace_by_sku(&self, product: &Product) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::replace_by_sku_in(&mut conn, product).await
    }

    /// Overwrites the row holding `product.sku`. The local `id` and
    /// `created_at` are preserved.
    pub async fn replace_by_sku_in(conn: &mut SqliteConnection, product: &Product) -> DbResult<()> {
        debug!(sku = %product.sku, version = product.sync_version, "Replacing product");

        let result = sqlx::query(
            r#"
            UPDATE products SET
                barcode = ?2,
                name = ?3,
                description = ?4,
                price_cents = ?5,
                cost_cents = ?6,
                tax_rate_bps = ?7,
                track_inventory = ?8,
                allow_negative_stock = ?9,
                current_stock = ?10,
                is_active = ?11,
                updated_at = ?12,
                sync_version = ?13
            WHERE sku = ?1
            "#,
        )
        .bind(&product.sku)
        .bind(&product.barcode)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price_cents)
        .bind(product.cost_cents)
        .bind(product.tax_rate_bps)
        .bind(product.track_inventory)
        .bind(product.allow_negative_stock)
        .bind(product.current_stock)
        .bind(product.is_active)
        .bind(product.updated_at)
        .bind(product.sync_version)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Product", &product.sku));
        }
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
