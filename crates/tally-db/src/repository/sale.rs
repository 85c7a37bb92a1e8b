//! # Sale Repository
//!
//! Sales are matched across devices by `receipt_number`.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::Sale;

const SALE_COLUMNS: &str = "id, receipt_number, status, subtotal_cents, tax_cents, \
     discount_cents, total_cents, user_id, device_id, notes, created_at, updated_at, \
     completed_at, sync_version";

/// Repository for sale database operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// All sales, oldest first.
    pub async fn list(&self) -> DbResult<Vec<Sale>> {
        let sql = format!(
            "SELECT {} FROM sales ORDER BY created_at ASC, receipt_number ASC",
            SALE_COLUMNS
        );
        let sales = sqlx::query_as::<_, Sale>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(sales)
    }

    pub async fn get_by_receipt(&self, receipt_number: &str) -> DbResult<Option<Sale>> {
        let sql = format!("SELECT {} FROM sales WHERE receipt_number = ?1", SALE_COLUMNS);
        let sale = sqlx::query_as::<_, Sale>(&sql)
            .bind(receipt_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sale)
    }

    pub async fn insert(&self, sale: &Sale) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in(&mut conn, sale).await
    }

    pub async fn insert_in(conn: &mut SqliteConnection, sale: &Sale) -> DbResult<()> {
        debug!(receipt = %sale.receipt_number, "Inserting sale");

        sqlx::query(
            r#"
            INSERT INTO sales (
                id, receipt_number, status, subtotal_cents, tax_cents, discount_cents,
                total_cents, user_id, device_id, notes, created_at, updated_at,
                completed_at, sync_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&sale.id)
        .bind(&sale.receipt_number)
        .bind(sale.status)
        .bind(sale.subtotal_cents)
        .bind(sale.tax_cents)
        .bind(sale.discount_cents)
        .bind(sale.total_cents)
        .bind(&sale.user_id)
        .bind(&sale.device_id)
        .bind(&sale.notes)
        .bind(sale.created_at)
        .bind(sale.updated_at)
        .bind(sale.completed_at)
        .bind(sale.sync_version)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => {
                DbError::duplicate(field, &sale.receipt_number)
            }
            other => other,
        })?;

        Ok(())
    }

    pub async fn replace_by_receipt(&self, sale: &Sale) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::replace_by_receipt_in(&mut conn, sale).await
    }

    /// Overwrites the row holding `sale.receipt_number`, keeping the local id.
    pub async fn replace_by_receipt_in(conn: &mut SqliteConnection, sale: &Sale) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sales SET
                status = ?2,
                subtotal_cents = ?3,
                tax_cents = ?4,
                discount_cents = ?5,
                total_cents = ?6,
                user_id = ?7,
                device_id = ?8,
                notes = ?9,
                updated_at = ?10,
                completed_at = ?11,
                sync_version = ?12
            WHERE receipt_number = ?1
            "#,
        )
        .bind(&sale.receipt_number)
        .bind(sale.status)
        .bind(sale.subtotal_cents)
        .bind(sale.tax_cents)
        .bind(sale.discount_cents)
        .bind(sale.total_cents)
        .bind(&sale.user_id)
        .bind(&sale.device_id)
        .bind(&sale.notes)
        .bind(sale.updated_at)
        .bind(sale.completed_at)
        .bind(sale.sync_version)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Sale", &sale.receipt_number));
        }
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::{Database, DbConfig};
    use tally_core::{Sale, SaleStatus};

    fn sale(receipt: &str) -> Sale {
        let now = Utc::now();
        Sale {
            id: uuid::Uuid::new_v4().to_string(),
            receipt_number: receipt.to_string(),
            status: SaleStatus::Completed,
            subtotal_cents: 1000,
            tax_cents: 83,
            discount_cents: 0,
            total_cents: 1083,
            user_id: "cashier-1".into(),
            device_id: "device-a".into(),
            notes: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            sync_version: 1,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_sale() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sales();

        repo.insert(&sale("R-0001")).await.unwrap();

        let stored = repo.get_by_receipt("R-0001").await.unwrap().unwrap();
        assert_eq!(stored.status, SaleStatus::Completed);
        assert_eq!(stored.total_cents, 1083);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_replace_sale_status() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sales();

        let original = sale("R-0002");
        repo.insert(&original).await.unwrap();

        let mut voided = sale("R-0002");
        voided.status = SaleStatus::Voided;
        voided.sync_version = 2;
        repo.replace_by_receipt(&voided).await.unwrap();

        let stored = repo.get_by_receipt("R-0002").await.unwrap().unwrap();
        assert_eq!(stored.id, original.id);
        assert_eq!(stored.status, SaleStatus::Voided);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
