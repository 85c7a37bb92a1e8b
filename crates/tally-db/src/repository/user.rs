//! # User Repository
//!
//! Staff accounts, matched across devices by `username`. Users are backed up
//! and restored but never travel in sync snapshots.

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{DbError, DbResult};
use tally_core::User;

const USER_COLUMNS: &str = "id, username, display_name, role, is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        UserRepository { pool }
    }

    pub async fn list(&self) -> DbResult<Vec<User>> {
        let sql = format!("SELECT {} FROM users ORDER BY username", USER_COLUMNS);
        let users = sqlx::query_as::<_, User>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    pub async fn get_by_username(&self, username: &str) -> DbResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn insert(&self, user: &User) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in(&mut conn, user).await
    }

    pub async fn insert_in(conn: &mut SqliteConnection, user: &User) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, display_name, role, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(user.role)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn replace_by_username(&self, user: &User) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET display_name = ?2, role = ?3, is_active = ?4, updated_at = ?5
            WHERE username = ?1
            "#,
        )
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(user.role)
        .bind(user.is_active)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("User", &user.username));
        }
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
