// ============================================================================
// Cart Domain
// ============================================================================
//
// A cart is an explicit per-customer context loaded from and saved back to
// the CartStore on every operation. Nothing is held in process between calls.
//
// ============================================================================

pub mod service;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::order::{Money, OrderError};
use crate::store::StoreError;

pub use service::CartService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartContext {
    pub customer_id: Uuid,
    /// Menu item id -> quantity, always > 0
    pub lines: BTreeMap<Uuid, i32>,
    pub updated_at: DateTime<Utc>,
}

impl CartContext {
    pub fn new(customer_id: Uuid) -> Self {
        Self {
            customer_id,
            lines: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Replace the quantity for one item; zero removes the line.
    pub fn set_quantity(&mut self, menu_item_id: Uuid, quantity: i32) -> Result<(), CartError> {
        if quantity < 0 {
            return Err(CartError::Validation(format!(
                "quantity must be non-negative, got {}",
                quantity
            )));
        }

        if quantity == 0 {
            self.lines.remove(&menu_item_id);
        } else {
            self.lines.insert(menu_item_id, quantity);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn add(&mut self, menu_item_id: Uuid, quantity: i32) -> Result<(), CartError> {
        if quantity <= 0 {
            return Err(CartError::Validation(format!(
                "quantity to add must be positive, got {}",
                quantity
            )));
        }

        let current = self.quantity(menu_item_id);
        let total = current
            .checked_add(quantity)
            .ok_or_else(|| CartError::Validation("quantity overflow".into()))?;
        self.set_quantity(menu_item_id, total)
    }

    pub fn quantity(&self, menu_item_id: Uuid) -> i32 {
        self.lines.get(&menu_item_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn item_count(&self) -> i32 {
        self.lines.values().sum()
    }

    pub fn menu_item_ids(&self) -> Vec<Uuid> {
        self.lines.keys().copied().collect()
    }
}

/// One cart line priced at the current menu price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub menu_item_id: Uuid,
    pub name: String,
    pub vendor_id: Uuid,
    pub quantity: i32,
    pub unit_price: Money,
    pub line_total: Money,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartSummary {
    pub customer_id: Uuid,
    pub lines: Vec<CartLine>,
    pub total: Money,
}

#[derive(Debug, thiserror::Error)]
pub enum CartError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Menu item not found: {0}")]
    MenuItemNotFound(Uuid),

    #[error("Menu item unavailable: {0}")]
    MenuItemUnavailable(Uuid),

    #[error("Checkout failed: {0}")]
    Order(#[from] OrderError),

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),
}
