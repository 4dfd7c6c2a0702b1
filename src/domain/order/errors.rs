use uuid::Uuid;

use crate::store::StoreError;
use crate::utils::IsTransient;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Menu item {menu_item_id} became unavailable before the order was committed")]
    InventoryConflict { menu_item_id: Uuid },

    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("Vendor {vendor_id} has no items in order {order_id}")]
    NotImplicated { order_id: Uuid, vendor_id: Uuid },

    #[error("Timed out waiting for the lock on order {order_id}")]
    LockTimeout { order_id: Uuid },

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Order {order_id} does not accept vendor updates while {status}")]
    OrderNotActive { order_id: Uuid, status: OrderStatus },

    #[error("Persistence error: {0}")]
    Store(StoreError),
}

impl OrderError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            OrderError::Validation(_) => "validation",
            OrderError::InventoryConflict { .. } => "inventory_conflict",
            OrderError::InvalidTransition { .. } => "invalid_transition",
            OrderError::NotImplicated { .. } => "not_implicated",
            OrderError::LockTimeout { .. } => "lock_timeout",
            OrderError::OrderNotFound(_) => "not_found",
            OrderError::OrderNotActive { .. } => "not_active",
            OrderError::Store(_) => "store",
        }
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout(order_id) => OrderError::LockTimeout { order_id },
            StoreError::OrderNotFound(order_id) => OrderError::OrderNotFound(order_id),
            StoreError::MenuItemUnavailable(menu_item_id) => {
                OrderError::InventoryConflict { menu_item_id }
            }
            StoreError::MenuItemNotFound(menu_item_id) => {
                OrderError::Validation(format!("menu item {} does not exist", menu_item_id))
            }
            other => OrderError::Store(other),
        }
    }
}

impl IsTransient for OrderError {
    fn is_transient(&self) -> bool {
        match self {
            OrderError::LockTimeout { .. } => true,
            OrderError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conditions_map_onto_taxonomy() {
        let id = Uuid::new_v4();

        assert!(matches!(
            OrderError::from(StoreError::LockTimeout(id)),
            OrderError::LockTimeout { order_id } if order_id == id
        ));
        assert!(matches!(
            OrderError::from(StoreError::MenuItemUnavailable(id)),
            OrderError::InventoryConflict { menu_item_id } if menu_item_id == id
        ));
        assert!(matches!(
            OrderError::from(StoreError::MenuItemNotFound(id)),
            OrderError::Validation(_)
        ));
        assert!(matches!(
            OrderError::from(StoreError::OrderNotFound(id)),
            OrderError::OrderNotFound(found) if found == id
        ));
    }

    #[test]
    fn test_only_lock_timeouts_are_transient() {
        let id = Uuid::new_v4();
        assert!(OrderError::LockTimeout { order_id: id }.is_transient());
        assert!(!OrderError::NotImplicated { order_id: id, vendor_id: id }.is_transient());
        assert!(!OrderError::Validation("empty".into()).is_transient());
    }
}
