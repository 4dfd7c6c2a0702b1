// ============================================================================
// Menu Domain - vendors and the items they sell
// ============================================================================
//
// Line items copy the vendor id and price at checkout, so nothing here can
// change an order after it was placed. The availability flag is re-checked
// by the store when an order is inserted.
//
// ============================================================================

pub mod catalog;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::order::Money;
use crate::store::StoreError;

pub use catalog::MenuCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: Uuid,
    pub name: String,
}

impl Vendor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Money,
    pub available: bool,
}

impl MenuItem {
    /// New items start out available
    pub fn new(vendor_id: Uuid, name: impl Into<String>, price: Money) -> Self {
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            name: name.into(),
            description: None,
            price,
            available: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MenuError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Vendor not found: {0}")]
    VendorNotFound(Uuid),

    #[error("Menu item not found: {0}")]
    MenuItemNotFound(Uuid),

    #[error("Vendor {vendor_id} does not own menu item {menu_item_id}")]
    NotOwner { vendor_id: Uuid, menu_item_id: Uuid },

    #[error("Persistence error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for MenuError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VendorNotFound(id) => MenuError::VendorNotFound(id),
            StoreError::MenuItemNotFound(id) => MenuError::MenuItemNotFound(id),
            other => MenuError::Store(other),
        }
    }
}
