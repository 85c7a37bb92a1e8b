//! # Supplier Repository
//!
//! Vendors, matched across devices by `name`.

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{DbError, DbResult};
use tally_core::Supplier;

const SUPPLIER_COLUMNS: &str = "id, name, contact_email, phone, is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SupplierRepository {
    pool: SqlitePool,
}

impl SupplierRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SupplierRepository { pool }
    }

    pub async fn list(&self) -> DbResult<Vec<Supplier>> {
        let sql = format!("SELECT {} FROM suppliers ORDER BY name", SUPPLIER_COLUMNS);
        let suppliers = sqlx::query_as::<_, Supplier>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(suppliers)
    }

    pub async fn get_by_name(&self, name: &str) -> DbResult<Option<Supplier>> {
        let sql = format!("SELECT {} FROM suppliers WHERE name = ?1", SUPPLIER_COLUMNS);
        let supplier = sqlx::query_as::<_, Supplier>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(supplier)
    }

    pub async fn insert(&self, supplier: &Supplier) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in(&mut conn, supplier).await
    }

    pub async fn insert_in(conn: &mut SqliteConnection, supplier: &Supplier) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO suppliers (id, name, contact_email, phone, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&supplier.id)
        .bind(&supplier.name)
        .bind(&supplier.contact_email)
        .bind(&supplier.phone)
        .bind(supplier.is_active)
        .bind(supplier.created_at)
        .bind(supplier.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn replace_by_name(&self, supplier: &Supplier) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE suppliers SET contact_email = ?2, phone = ?3, is_active = ?4, updated_at = ?5
            WHERE name = ?1
            "#,
        )
        .bind(&supplier.name)
        .bind(&supplier.contact_email)
        .bind(&supplier.phone)
        .bind(supplier.is_active)
        .bind(supplier.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Supplier", &supplier.name));
        }
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM suppliers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
