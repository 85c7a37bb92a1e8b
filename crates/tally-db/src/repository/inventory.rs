//! # Inventory Movement Repository
//!
//! Movements are append-only. Each references its product by sku, so a
//! movement can only be written once the product exists (foreign key).

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::DbResult;
use tally_core::InventoryMovement;

const MOVEMENT_COLUMNS: &str = "id, product_sku, delta, reason, device_id, created_at";

#[derive(Debug, Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InventoryRepository { pool }
    }

    pub async fn list(&self) -> DbResult<Vec<InventoryMovement>> {
        let sql = format!(
            "SELECT {} FROM inventory_movements ORDER BY created_at ASC, id ASC",
            MOVEMENT_COLUMNS
        );
        let movements = sqlx::query_as::<_, InventoryMovement>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(movements)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<InventoryMovement>> {
        let sql = format!("SELECT {} FROM inventory_movements WHERE id = ?1", MOVEMENT_COLUMNS);
        let movement = sqlx::query_as::<_, InventoryMovement>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(movement)
    }

    pub async fn insert(&self, movement: &InventoryMovement) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in(&mut conn, movement).await
    }

    pub async fn insert_in(conn: &mut SqliteConnection, movement: &InventoryMovement) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_movements (id, product_sku, delta, reason, device_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&movement.id)
        .bind(&movement.product_sku)
        .bind(movement.delta)
        .bind(&movement.reason)
        .bind(&movement.device_id)
        .bind(movement.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inventory_movements")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
