//! # Domain Types
//!
//! Entities owned by the business layer and carried opaquely by the sync and
//! backup engines.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Product      │   │      Sale       │   │      User       │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  id (UUID)      │   │  id (UUID)      │       │
//! │  │  sku (key)      │   │  receipt_number │   │  username (key) │       │
//! │  │  price_cents    │   │  total_cents    │   │  role           │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────────┐                         │
//! │  │    Supplier     │   │  InventoryMovement  │                         │
//! │  │  name (key)     │   │  id (key), sku,     │                         │
//! │  │  contact_email  │   │  delta, reason      │                         │
//! │  └─────────────────┘   └─────────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every entity has:
//! - `id`: UUID v4, local to the device that created the row
//! - Natural key: (sku, receipt_number, username, ...) used to match records
//!   across devices, see [`EntityKind::natural_key_field`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::validation::{
    validate_non_negative, validate_product_name, validate_required, validate_sku,
    ValidationResult,
};

// =============================================================================
// Entity Kind
// =============================================================================

/// The entity tables known to the sync and backup engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Products,
    Sales,
    Users,
    Suppliers,
    Inventory,
}

impl EntityKind {
    /// Every kind, in restore dependency order (products before sales).
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Products,
        EntityKind::Suppliers,
        EntityKind::Users,
        EntityKind::Sales,
        EntityKind::Inventory,
    ];

    /// Kinds that travel in sync snapshots.
    pub const SYNCABLE: [EntityKind; 2] = [EntityKind::Products, EntityKind::Sales];

    /// Table name, also the key inside snapshot and backup payloads.
    pub const fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Products => "products",
            EntityKind::Sales => "sales",
            EntityKind::Users => "users",
            EntityKind::Suppliers => "suppliers",
            EntityKind::Inventory => "inventory",
        }
    }

    /// Field used to match records across devices.
    pub const fn natural_key_field(&self) -> &'static str {
        match self {
            EntityKind::Products => "sku",
            EntityKind::Sales => "receipt_number",
            EntityKind::Users => "username",
            EntityKind::Suppliers => "name",
            EntityKind::Inventory => "id",
        }
    }

    pub const fn is_syncable(&self) -> bool {
        matches!(self, EntityKind::Products | EntityKind::Sales)
    }

    /// Looks up a kind by table name.
    pub fn from_table(table: &str) -> Option<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.table_name() == table)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

// =============================================================================
// Product
// =============================================================================

/// A product available for sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Product {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Stock Keeping Unit - business identifier and natural key.
    pub sku: String,

    /// Barcode (EAN-13, UPC-A, etc.).
    pub barcode: Option<String>,

    /// Display name shown to cashier and on receipt.
    pub name: String,

    pub description: Option<String>,

    /// Price in cents (smallest currency unit).
    pub price_cents: i64,

    /// Cost in cents (for profit margin calculations).
    pub cost_cents: Option<i64>,

    /// Tax rate in basis points (825 = 8.25%).
    pub tax_rate_bps: u32,

    pub track_inventory: bool,

    pub allow_negative_stock: bool,

    pub current_stock: Option<i64>,

    /// Whether product is active (soft delete).
    pub is_active: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    /// Bumped on every local write.
    pub sync_version: i64,
}

impl Product {
    /// Creates an active product with fresh timestamps and version 1.
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price_cents: i64) -> Self {
        let now = Utc::now();
        Product {
            id: uuid::Uuid::new_v4().to_string(),
            sku: sku.into(),
            barcode: None,
            name: name.into(),
            description: None,
            price_cents,
            cost_cents: None,
            tax_rate_bps: 0,
            track_inventory: true,
            allow_negative_stock: false,
            current_stock: Some(0),
            is_active: true,
            created_at: now,
            updated_at: now,
            sync_version: 1,
        }
    }

    pub fn validate(&self) -> ValidationResult<()> {
        validate_sku(&self.sku)?;
        validate_product_name(&self.name)?;
        validate_non_negative("price_cents", self.price_cents)?;
        if let Some(cost) = self.cost_cents {
            validate_non_negative("cost_cents", cost)?;
        }
        Ok(())
    }
}

// =============================================================================
// Sale Status
// =============================================================================

/// The status of a sale transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    /// Sale is in progress (items being added).
    #[default]
    Draft,
    /// Sale has been paid and finalized.
    Completed,
    /// Sale was cancelled/refunded.
    Voided,
}

// =============================================================================
// Sale
// =============================================================================

/// A completed or in-progress sale transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Sale {
    pub id: String,
    /// Receipt number, unique across devices (natural key).
    pub receipt_number: String,
    pub status: SaleStatus,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub user_id: String,
    pub device_id: String,
    pub notes: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
    pub sync_version: i64,
}

impl Sale {
    pub fn validate(&self) -> ValidationResult<()> {
        validate_required("receipt_number", &self.receipt_number)?;
        validate_non_negative("total_cents", self.total_cents)?;
        Ok(())
    }
}

// =============================================================================
// Users and Capabilities
// =============================================================================

/// Role of a staff account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Manager,
    #[default]
    Cashier,
}

/// Administrative capabilities checked by the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Create, edit and restore staff accounts.
    ManageUsers,
    /// Delete backups and restore from them.
    ManageBackups,
}

impl UserRole {
    pub fn has_capability(&self, capability: Capability) -> bool {
        match (self, capability) {
            (UserRole::Admin, _) => true,
            (UserRole::Manager, Capability::ManageBackups) => true,
            _ => false,
        }
    }
}

/// A staff account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: UserRole,
    pub is_active: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn validate(&self) -> ValidationResult<()> {
        validate_required("username", &self.username)
    }
}

// =============================================================================
// Supplier
// =============================================================================

/// A vendor the store buys stock from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Supplier {
    pub id: String,
    pub name: String,
    pub contact_email: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Supplier {
    pub fn validate(&self) -> ValidationResult<()> {
        validate_required("name", &self.name)
    }
}

// =============================================================================
// Inventory Movement
// =============================================================================

/// A stock adjustment (receiving, shrinkage, recount).
///
/// Movements are append-only; the id doubles as the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct InventoryMovement {
    pub id: String,
    pub product_sku: String,
    /// Signed change in stock units.
    pub delta: i64,
    pub reason: String,
    pub device_id: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl InventoryMovement {
    pub fn validate(&self) -> ValidationResult<()> {
        validate_sku(&self.product_sku)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_restore_order() {
        let products = EntityKind::ALL
            .iter()
            .position(|k| *k == EntityKind::Products);
        let sales = EntityKind::ALL.iter().position(|k| *k == EntityKind::Sales);
        assert!(products < sales);
    }

    #[test]
    fn test_entity_kind_from_table() {
        assert_eq!(EntityKind::from_table("sales"), Some(EntityKind::Sales));
        assert_eq!(EntityKind::from_table("payments"), None);
        assert!(EntityKind::Products.is_syncable());
        assert!(!EntityKind::Users.is_syncable());
    }

    #[test]
    fn test_product_validation() {
        let product = Product::new("COKE-330", "Coca-Cola 330ml", 199);
        assert!(product.validate().is_ok());

        let mut bad = product.clone();
        bad.price_cents = -5;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_role_capabilities() {
        assert!(UserRole::Admin.has_capability(Capability::ManageUsers));
        assert!(!UserRole::Manager.has_capability(Capability::ManageUsers));
        assert!(UserRole::Manager.has_capability(Capability::ManageBackups));
        assert!(!UserRole::Cashier.has_capability(Capability::ManageBackups));
    }

    #[test]
    fn test_sale_status_default() {
        assert_eq!(SaleStatus::default(), SaleStatus::Draft);
    }
}
