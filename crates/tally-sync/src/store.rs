//! # Entity Store and Access Control
//!
//! The engines see entities as JSON records addressed by natural key. The
//! business layer's storage sits behind [`EntityStore`]; the principal acting
//! on a restore sits behind [`AccessControl`].
//!
//! ## Tracked Writes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DatabaseStore::insert(products, record)                               │
//! │                                                                         │
//! │   BEGIN                                                                 │
//! │     INSERT INTO products ...                      (entity write)       │
//! │     INSERT INTO change_log ... version = max + 1  (journal entry)      │
//! │   COMMIT                                                                │
//! │                                                                         │
//! │  Syncable kinds (products, sales) always journal; users, suppliers     │
//! │  and inventory are written directly.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::change_log::ChangeLog;
use crate::error::{SyncError, SyncResult};
use tally_core::merge::natural_key;
use tally_core::{
    Capability, ChangeOperation, CoreError, EntityKind, InventoryMovement, NewChange, Product,
    Sale, Supplier, User, UserRole,
};
use tally_db::{ChangeLogRepository, Database, ProductRepository, SaleRepository};

// =============================================================================
// Contracts
// =============================================================================

/// Entity storage as seen by the sync and backup engines.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn list(&self, kind: EntityKind) -> SyncResult<Vec<Value>>;

    async fn find_by_key(&self, kind: EntityKind, key: &str) -> SyncResult<Option<Value>>;

    async fn insert(&self, kind: EntityKind, record: &Value) -> SyncResult<()>;

    /// Overwrites the record stored under `key`.
    async fn replace(&self, kind: EntityKind, key: &str, record: &Value) -> SyncResult<()>;
}

/// Identity of the acting principal.
pub trait AccessControl: Send + Sync {
    /// Id of the signed-in user, if any.
    fn current_user(&self) -> Option<String>;

    fn has_permission(&self, capability: Capability) -> bool;
}

/// Fixed principal for the daemon and tests.
#[derive(Debug, Clone)]
pub struct StaticAccess {
    user_id: Option<String>,
    role: UserRole,
}

impl StaticAccess {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        StaticAccess {
            user_id: Some(user_id.into()),
            role,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self::new(user_id, UserRole::Admin)
    }

    /// No signed-in user; every capability check fails.
    pub fn anonymous() -> Self {
        StaticAccess {
            user_id: None,
            role: UserRole::Cashier,
        }
    }
}

impl AccessControl for StaticAccess {
    fn current_user(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn has_permission(&self, capability: Capability) -> bool {
        self.user_id.is_some() && self.role.has_capability(capability)
    }
}

// =============================================================================
// Database Store
// =============================================================================

/// [`EntityStore`] over the local SQLite database.
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    db: Database,
    change_log: ChangeLog,
}

fn decode<T: DeserializeOwned>(kind: EntityKind, record: &Value) -> SyncResult<T> {
    serde_json::from_value(record.clone()).map_err(|e| {
        SyncError::from(CoreError::InvalidRecord {
            table: kind.table_name().to_string(),
            reason: e.to_string(),
        })
    })
}

fn encode_all<T: Serialize>(items: Vec<T>) -> SyncResult<Vec<Value>> {
    items
        .into_iter()
        .map(|item| serde_json::to_value(item).map_err(SyncError::from))
        .collect()
}

fn encode_one<T: Serialize>(item: Option<T>) -> SyncResult<Option<Value>> {
    item.map(serde_json::to_value).transpose().map_err(SyncError::from)
}

impl DatabaseStore {
    pub fn new(db: Database, change_log: ChangeLog) -> Self {
        DatabaseStore { db, change_log }
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    // =========================================================================
    // Local Mutations (business layer)
    // =========================================================================

    pub async fn insert_product(&self, product: &Product) -> SyncResult<()> {
        product.validate().map_err(CoreError::from)?;
        let mut tx = self.db.pool().begin().await?;
        ProductRepository::insert_in(&mut tx, product).await?;
        self.journal_in(&mut tx, ChangeOperation::Create, EntityKind::Products, &product.sku, product)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Saves an edited product and bumps its `sync_version`.
    pub async fn update_product(&self, product: &Product) -> SyncResult<Product> {
        product.validate().map_err(CoreError::from)?;
        let mut updated = product.clone();
        updated.sync_version += 1;
        updated.updated_at = chrono::Utc::now();

        let mut tx = self.db.pool().begin().await?;
        ProductRepository::replace_by_sku_in(&mut tx, &updated).await?;
        self.journal_in(&mut tx, ChangeOperation::Update, EntityKind::Products, &updated.sku, &updated)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn insert_sale(&self, sale: &Sale) -> SyncResult<()> {
        sale.validate().map_err(CoreError::from)?;
        let mut tx = self.db.pool().begin().await?;
        SaleRepository::insert_in(&mut tx, sale).await?;
        self.journal_in(&mut tx, ChangeOperation::Create, EntityKind::Sales, &sale.receipt_number, sale)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Saves an edited sale (e.g. voided) and bumps its `sync_version`.
    pub async fn update_sale(&self, sale: &Sale) -> SyncResult<Sale> {
        sale.validate().map_err(CoreError::from)?;
        let mut updated = sale.clone();
        updated.sync_version += 1;
        updated.updated_at = chrono::Utc::now();

        let mut tx = self.db.pool().begin().await?;
        SaleRepository::replace_by_receipt_in(&mut tx, &updated).await?;
        self.journal_in(
            &mut tx,
            ChangeOperation::Update,
            EntityKind::Sales,
            &updated.receipt_number,
            &updated,
        )
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn journal_in<T: Serialize>(
        &self,
        conn: &mut SqliteConnection,
        operation: ChangeOperation,
        kind: EntityKind,
        key: &str,
        entity: &T,
    ) -> SyncResult<()> {
        let change = NewChange::new(
            operation,
            kind.table_name(),
            key,
            serde_json::to_string(entity)?,
            self.change_log.device_id(),
        );
        ChangeLogRepository::append_in(conn, &change).await?;
        Ok(())
    }

    fn check_key(kind: EntityKind, key: &str, record: &Value) -> SyncResult<()> {
        let record_key = natural_key(kind, record)?;
        if record_key != key {
            return Err(CoreError::InvalidRecord {
                table: kind.table_name().to_string(),
                reason: format!("record key '{}' does not match '{}'", record_key, key),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for DatabaseStore {
    async fn list(&self, kind: EntityKind) -> SyncResult<Vec<Value>> {
        match kind {
            EntityKind::Products => encode_all(self.db.products().list().await?),
            EntityKind::Sales => encode_all(self.db.sales().list().await?),
            EntityKind::Users => encode_all(self.db.users().list().await?),
            EntityKind::Suppliers => encode_all(self.db.suppliers().list().await?),
            EntityKind::Inventory => encode_all(self.db.inventory().list().await?),
        }
    }

    async fn find_by_key(&self, kind: EntityKind, key: &str) -> SyncResult<Option<Value>> {
        match kind {
            EntityKind::Products => encode_one(self.db.products().get_by_sku(key).await?),
            EntityKind::Sales => encode_one(self.db.sales().get_by_receipt(key).await?),
            EntityKind::Users => encode_one(self.db.users().get_by_username(key).await?),
            EntityKind::Suppliers => encode_one(self.db.suppliers().get_by_name(key).await?),
            EntityKind::Inventory => encode_one(self.db.inventory().get(key).await?),
        }
    }

    async fn insert(&self, kind: EntityKind, record: &Value) -> SyncResult<()> {
        debug!(table = %kind, "Inserting record");
        match kind {
            EntityKind::Products => {
                let product: Product = decode(kind, record)?;
                self.insert_product(&product).await
            }
            EntityKind::Sales => {
                let sale: Sale = decode(kind, record)?;
                self.insert_sale(&sale).await
            }
            EntityKind::Users => {
                let user: User = decode(kind, record)?;
                user.validate().map_err(CoreError::from)?;
                Ok(self.db.users().insert(&user).await?)
            }
            EntityKind::Suppliers => {
                let supplier: Supplier = decode(kind, record)?;
                supplier.validate().map_err(CoreError::from)?;
                Ok(self.db.suppliers().insert(&supplier).await?)
            }
            EntityKind::Inventory => {
                let movement: InventoryMovement = decode(kind, record)?;
                movement.validate().map_err(CoreError::from)?;
                Ok(self.db.inventory().insert(&movement).await?)
            }
        }
    }

    /// Replaces a record as given: the caller owns `sync_version`.
    async fn replace(&self, kind: EntityKind, key: &str, record: &Value) -> SyncResult<()> {
        Self::check_key(kind, key, record)?;
        debug!(table = %kind, key = %key, "Replacing record");

        match kind {
            EntityKind::Products => {
                let product: Product = decode(kind, record)?;
                product.validate().map_err(CoreError::from)?;
                let mut tx = self.db.pool().begin().await?;
                ProductRepository::replace_by_sku_in(&mut tx, &product).await?;
                self.journal_in(&mut tx, ChangeOperation::Update, kind, key, &product)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            EntityKind::Sales => {
                let sale: Sale = decode(kind, record)?;
                sale.validate().map_err(CoreError::from)?;
                let mut tx = self.db.pool().begin().await?;
                SaleRepository::replace_by_receipt_in(&mut tx, &sale).await?;
                self.journal_in(&mut tx, ChangeOperation::Update, kind, key, &sale)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            EntityKind::Users => {
                let user: User = decode(kind, record)?;
                user.validate().map_err(CoreError::from)?;
                Ok(self.db.users().replace_by_username(&user).await?)
            }
            EntityKind::Suppliers => {
                let supplier: Supplier = decode(kind, record)?;
                supplier.validate().map_err(CoreError::from)?;
                Ok(self.db.suppliers().replace_by_name(&supplier).await?)
            }
            EntityKind::Inventory => Err(SyncError::Unsupported(
                "inventory movements are append-only".into(),
            )),
        }
    }
}
