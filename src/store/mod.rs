// ============================================================================
// Persistence Gateway
// ============================================================================
//
// Storage ports consumed by the domain layer, plus two backends:
// - MemoryStore: in-process tables with one tokio mutex per order
// - PostgresStore: sqlx transactions with `SELECT ... FOR UPDATE`
//
// Every mutation of an existing order goes through an OrderTransaction, which
// holds the order's exclusive lock until it is committed or dropped.
//
// ============================================================================

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use uuid::Uuid;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::domain::cart::{CartContext, CartError};
use crate::domain::menu::{MenuItem, Vendor};
use crate::domain::order::{
    OrderError, OrderEvent, OrderLineItem, OrderRecord, OrderSnapshot, OrderStatus, VendorStatus,
};
use crate::event_log::EventEnvelope;
use crate::utils::IsTransient;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Timed out acquiring lock on order {0}")]
    LockTimeout(Uuid),

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Menu item not found: {0}")]
    MenuItemNotFound(Uuid),

    #[error("Menu item unavailable: {0}")]
    MenuItemUnavailable(Uuid),

    #[error("Vendor not found: {0}")]
    VendorNotFound(Uuid),

    #[error("Order already exists: {0}")]
    DuplicateOrder(Uuid),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout(_) | StoreError::Database(sqlx::Error::PoolTimedOut)
        )
    }
}

/// Order plus everything that must be written with it in one atomic unit.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order: OrderRecord,
    pub line_items: Vec<OrderLineItem>,
    pub created: EventEnvelope<OrderEvent>,
}

/// Read/write access to one locked order. Dropping it without `commit`
/// discards staged writes and releases the lock.
#[async_trait]
pub trait OrderTransaction: Send {
    fn order_id(&self) -> Uuid;

    /// The order row as of lock acquisition, including staged writes
    async fn order(&mut self) -> Result<OrderRecord, StoreError>;

    /// Distinct vendors owning the order's line items
    async fn get_vendors_for_order(&mut self) -> Result<BTreeSet<Uuid>, StoreError>;

    async fn get_vendor_status(&mut self, vendor_id: Uuid) -> Result<Option<VendorStatus>, StoreError>;

    async fn upsert_vendor_status(&mut self, vendor_id: Uuid, status: VendorStatus) -> Result<(), StoreError>;

    async fn set_order_status(&mut self, status: OrderStatus) -> Result<(), StoreError>;

    async fn set_payment_reference(&mut self, reference: &str) -> Result<(), StoreError>;

    /// Journal an event; returns its sequence number
    async fn append_event(&mut self, event: &OrderEvent, correlation_id: Uuid) -> Result<i64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Acquire the exclusive lock on one order. Locks on different orders
    /// never wait on each other.
    async fn lock_order(&self, order_id: Uuid, timeout: Duration) -> Result<Box<dyn OrderTransaction>, StoreError>;

    /// Insert order, lines and creation event atomically, re-checking that
    /// every referenced menu item still exists and is available.
    async fn insert_order(&self, new_order: NewOrder) -> Result<(), StoreError>;

    async fn fetch_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, StoreError>;

    /// Newest first
    async fn customer_orders(&self, customer_id: Uuid) -> Result<Vec<OrderSnapshot>, StoreError>;

    /// Orders implicating the vendor whose overall status is `in_making` or `ready`, oldest first
    async fn active_vendor_orders(&self, vendor_id: Uuid) -> Result<Vec<OrderSnapshot>, StoreError>;

    async fn order_events(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, StoreError>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn save_vendor(&self, vendor: &Vendor) -> Result<(), StoreError>;

    async fn vendor(&self, vendor_id: Uuid) -> Result<Option<Vendor>, StoreError>;

    /// Sorted by name
    async fn vendors(&self) -> Result<Vec<Vendor>, StoreError>;

    async fn save_menu_item(&self, item: &MenuItem) -> Result<(), StoreError>;

    async fn menu_item(&self, menu_item_id: Uuid) -> Result<Option<MenuItem>, StoreError>;

    async fn menu_items(&self, menu_item_ids: &[Uuid]) -> Result<HashMap<Uuid, MenuItem>, StoreError>;

    /// Sorted by name
    async fn vendor_menu(&self, vendor_id: Uuid) -> Result<Vec<MenuItem>, StoreError>;

    async fn set_menu_item_available(&self, menu_item_id: Uuid, available: bool) -> Result<(), StoreError>;
}

/// In-place change to one customer's cart
pub type CartEdit = Box<dyn FnOnce(&mut CartContext) -> Result<(), CartError> + Send>;

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn load_cart(&self, customer_id: Uuid) -> Result<Option<CartContext>, StoreError>;

    /// Apply `edit` to the stored cart, or to a new empty one, and save the
    /// result. Edits of the same cart never interleave. Nothing is saved
    /// when `edit` fails.
    async fn update_cart(&self, customer_id: Uuid, edit: CartEdit) -> Result<CartContext, CartError>;

    async fn clear_cart(&self, customer_id: Uuid) -> Result<(), StoreError>;
}

/// Everything the application needs from one backend.
pub trait Persistence: OrderStore + CatalogStore + CartStore {}

impl<T: OrderStore + CatalogStore + CartStore> Persistence for T {}

/// Run `f` with the order's exclusive lock held. Commits when `f` returns
/// `Ok`; on `Err` the transaction is dropped, so nothing it staged is written.
pub async fn with_order_lock<S, T, F>(
    store: &S,
    order_id: Uuid,
    timeout: Duration,
    f: F,
) -> Result<T, OrderError>
where
    S: OrderStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn OrderTransaction) -> BoxFuture<'t, Result<T, OrderError>>,
{
    let mut tx = store.lock_order(order_id, timeout).await?;
    tracing::debug!(order_id = %order_id, "Order lock acquired");

    let value = f(&mut *tx).await?;
    tx.commit().await?;

    tracing::debug!(order_id = %order_id, "Order lock released after commit");
    Ok(value)
}
