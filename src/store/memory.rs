use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use crate::domain::cart::{CartContext, CartError};
use crate::domain::menu::{MenuItem, Vendor};
use crate::domain::order::{OrderEvent, OrderLineItem, OrderRecord, OrderSnapshot, OrderStatus, VendorStatus};
use crate::event_log::EventEnvelope;
use super::{CartEdit, CartStore, CatalogStore, NewOrder, OrderStore, OrderTransaction, StoreError};

// ============================================================================
// In-Memory Store
// ============================================================================
//
// Tables sit behind one RwLock that is only ever held for the duration of a
// synchronous read or a commit. Order-level exclusion comes from a separate
// mutex per order id, held by the MemoryTransaction until commit or drop.
// A per-order mutex leaves the registry once nobody holds or awaits it.
//
// ============================================================================

#[derive(Default)]
struct Tables {
    vendors: HashMap<Uuid, Vendor>,
    menu_items: HashMap<Uuid, MenuItem>,
    orders: HashMap<Uuid, OrderRecord>,
    line_items: HashMap<Uuid, Vec<OrderLineItem>>,
    vendor_statuses: HashMap<Uuid, BTreeMap<Uuid, VendorStatus>>,
    events: HashMap<Uuid, Vec<EventEnvelope<OrderEvent>>>,
    carts: HashMap<Uuid, CartContext>,
}

impl Tables {
    fn snapshot(&self, order_id: Uuid) -> Option<OrderSnapshot> {
        let order = self.orders.get(&order_id)?.clone();
        Some(OrderSnapshot {
            order,
            line_items: self.line_items.get(&order_id).cloned().unwrap_or_default(),
            vendor_statuses: self.vendor_statuses.get(&order_id).cloned().unwrap_or_default(),
        })
    }
}

type LockRegistry = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// Drop the registry entry for `order_id` if the registry holds the only
/// reference to it.
fn release_order_lock(locks: &LockRegistry, order_id: Uuid) {
    let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
    if locks
        .get(&order_id)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        locks.remove(&order_id);
    }
}

/// Held per-order mutex. Releases the mutex, then prunes its registry entry.
struct OrderLockGuard {
    order_id: Uuid,
    locks: LockRegistry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        release_order_lock(&self.locks, self.order_id);
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    order_locks: LockRegistry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn order_lock(&self, order_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.order_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(order_id).or_default().clone()
    }

    /// Orders with a live entry in the lock registry
    pub fn tracked_order_locks(&self) -> usize {
        self.order_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct MemoryTransaction {
    order_id: Uuid,
    tables: Arc<RwLock<Tables>>,
    _lock: OrderLockGuard,
    record: OrderRecord,
    staged_statuses: BTreeMap<Uuid, VendorStatus>,
    staged_events: Vec<EventEnvelope<OrderEvent>>,
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    fn order_id(&self) -> Uuid {
        self.order_id
    }

    async fn order(&mut self) -> Result<OrderRecord, StoreError> {
        Ok(self.record.clone())
    }

    async fn get_vendors_for_order(&mut self) -> Result<BTreeSet<Uuid>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .line_items
            .get(&self.order_id)
            .map(|items| items.iter().map(|item| item.vendor_id).collect())
            .unwrap_or_default())
    }

    async fn get_vendor_status(&mut self, vendor_id: Uuid) -> Result<Option<VendorStatus>, StoreError> {
        if let Some(status) = self.staged_statuses.get(&vendor_id) {
            return Ok(Some(*status));
        }

        let tables = self.tables.read().await;
        Ok(tables
            .vendor_statuses
            .get(&self.order_id)
            .and_then(|statuses| statuses.get(&vendor_id))
            .copied())
    }

    async fn upsert_vendor_status(&mut self, vendor_id: Uuid, status: VendorStatus) -> Result<(), StoreError> {
        self.staged_statuses.insert(vendor_id, status);
        Ok(())
    }

    async fn set_order_status(&mut self, status: OrderStatus) -> Result<(), StoreError> {
        self.record.status = status;
        Ok(())
    }

    async fn set_payment_reference(&mut self, reference: &str) -> Result<(), StoreError> {
        self.record.payment_reference = Some(reference.to_string());
        Ok(())
    }

    async fn append_event(&mut self, event: &OrderEvent, correlation_id: Uuid) -> Result<i64, StoreError> {
        let sequence_number = self.record.version + 1;
        self.staged_events.push(EventEnvelope::new(
            self.order_id,
            sequence_number,
            event.clone(),
            correlation_id,
        ));
        self.record.version = sequence_number;
        Ok(sequence_number)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut tables = this.tables.write().await;

        tables.orders.insert(this.order_id, this.record);
        tables
            .vendor_statuses
            .entry(this.order_id)
            .or_default()
            .extend(this.staged_statuses);
        tables
            .events
            .entry(this.order_id)
            .or_default()
            .extend(this.staged_events);

        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn lock_order(&self, order_id: Uuid, timeout: Duration) -> Result<Box<dyn OrderTransaction>, StoreError> {
        if !self.tables.read().await.orders.contains_key(&order_id) {
            return Err(StoreError::OrderNotFound(order_id));
        }

        let lock = self.order_lock(order_id);
        let acquired = tokio::time::timeout(timeout, lock.lock_owned()).await;
        let guard = match acquired {
            Ok(guard) => OrderLockGuard {
                order_id,
                locks: self.order_locks.clone(),
                guard: Some(guard),
            },
            Err(_) => {
                release_order_lock(&self.order_locks, order_id);
                return Err(StoreError::LockTimeout(order_id));
            }
        };

        // Re-read under the lock so the transaction starts from committed state
        let record = self
            .tables
            .read()
            .await
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(StoreError::OrderNotFound(order_id))?;

        Ok(Box::new(MemoryTransaction {
            order_id,
            tables: self.tables.clone(),
            _lock: guard,
            record,
            staged_statuses: BTreeMap::new(),
            staged_events: Vec::new(),
        }))
    }

    async fn insert_order(&self, new_order: NewOrder) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let order_id = new_order.order.id;

        if tables.orders.contains_key(&order_id) {
            return Err(StoreError::DuplicateOrder(order_id));
        }

        for line in &new_order.line_items {
            match tables.menu_items.get(&line.menu_item_id) {
                None => return Err(StoreError::MenuItemNotFound(line.menu_item_id)),
                Some(item) if !item.available => {
                    return Err(StoreError::MenuItemUnavailable(line.menu_item_id))
                }
                Some(_) => {}
            }
        }

        tables.orders.insert(order_id, new_order.order);
        tables.line_items.insert(order_id, new_order.line_items);
        tables.events.insert(order_id, vec![new_order.created]);
        Ok(())
    }

    async fn fetch_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, StoreError> {
        Ok(self.tables.read().await.snapshot(order_id))
    }

    async fn customer_orders(&self, customer_id: Uuid) -> Result<Vec<OrderSnapshot>, StoreError> {
        let tables = self.tables.read().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|order| order.customer_id == customer_id)
            .filter_map(|order| tables.snapshot(order.id))
            .collect();

        orders.sort_by(|a, b| b.order.created_at.cmp(&a.order.created_at));
        Ok(orders)
    }

    async fn active_vendor_orders(&self, vendor_id: Uuid) -> Result<Vec<OrderSnapshot>, StoreError> {
        let tables = self.tables.read().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|order| order.status.accepts_vendor_updates())
            .filter(|order| {
                tables
                    .line_items
                    .get(&order.id)
                    .is_some_and(|items| items.iter().any(|item| item.vendor_id == vendor_id))
            })
            .filter_map(|order| tables.snapshot(order.id))
            .collect();

        orders.sort_by(|a, b| a.order.created_at.cmp(&b.order.created_at));
        Ok(orders)
    }

    async fn order_events(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn save_vendor(&self, vendor: &Vendor) -> Result<(), StoreError> {
        self.tables.write().await.vendors.insert(vendor.id, vendor.clone());
        Ok(())
    }

    async fn vendor(&self, vendor_id: Uuid) -> Result<Option<Vendor>, StoreError> {
        Ok(self.tables.read().await.vendors.get(&vendor_id).cloned())
    }

    async fn vendors(&self) -> Result<Vec<Vendor>, StoreError> {
        let mut vendors: Vec<_> = self.tables.read().await.vendors.values().cloned().collect();
        vendors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vendors)
    }

    async fn save_menu_item(&self, item: &MenuItem) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.vendors.contains_key(&item.vendor_id) {
            return Err(StoreError::VendorNotFound(item.vendor_id));
        }
        tables.menu_items.insert(item.id, item.clone());
        Ok(())
    }

    async fn menu_item(&self, menu_item_id: Uuid) -> Result<Option<MenuItem>, StoreError> {
        Ok(self.tables.read().await.menu_items.get(&menu_item_id).cloned())
    }

    async fn menu_items(&self, menu_item_ids: &[Uuid]) -> Result<HashMap<Uuid, MenuItem>, StoreError> {
        let tables = self.tables.read().await;
        Ok(menu_item_ids
            .iter()
            .filter_map(|id| tables.menu_items.get(id).map(|item| (*id, item.clone())))
            .collect())
    }

    async fn vendor_menu(&self, vendor_id: Uuid) -> Result<Vec<MenuItem>, StoreError> {
        let mut items: Vec<_> = self
            .tables
            .read()
            .await
            .menu_items
            .values()
            .filter(|item| item.vendor_id == vendor_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn set_menu_item_available(&self, menu_item_id: Uuid, available: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let item = tables
            .menu_items
            .get_mut(&menu_item_id)
            .ok_or(StoreError::MenuItemNotFound(menu_item_id))?;
        item.available = available;
        Ok(())
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn load_cart(&self, customer_id: Uuid) -> Result<Option<CartContext>, StoreError> {
        Ok(self.tables.read().await.carts.get(&customer_id).cloned())
    }

    async fn update_cart(&self, customer_id: Uuid, edit: CartEdit) -> Result<CartContext, CartError> {
        let mut tables = self.tables.write().await;
        let mut cart = tables
            .carts
            .get(&customer_id)
            .cloned()
            .unwrap_or_else(|| CartContext::new(customer_id));

        edit(&mut cart)?;
        tables.carts.insert(customer_id, cart.clone());
        Ok(cart)
    }

    async fn clear_cart(&self, customer_id: Uuid) -> Result<(), StoreError> {
        self.tables.write().await.carts.remove(&customer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{Money, OrderCreated};
    use chrono::Utc;

    async fn seeded_order(store: &MemoryStore) -> (Uuid, Uuid) {
        let vendor = Vendor::new("Poornima Kitchen");
        store.save_vendor(&vendor).await.unwrap();
        let item = MenuItem::new(vendor.id, "Thali", Money(12000));
        store.save_menu_item(&item).await.unwrap();

        let order_id = Uuid::new_v4();
        let line = OrderLineItem {
            id: Uuid::new_v4(),
            order_id,
            menu_item_id: item.id,
            vendor_id: vendor.id,
            quantity: 1,
            unit_price: item.price,
        };
        let order = OrderRecord {
            id: order_id,
            customer_id: Uuid::new_v4(),
            total: Money(12000),
            status: OrderStatus::InMaking,
            payment_reference: None,
            version: 1,
            created_at: Utc::now(),
        };
        let created = EventEnvelope::new(
            order_id,
            1,
            OrderEvent::Created(OrderCreated {
                order_id,
                customer_id: order.customer_id,
                line_items: vec![line.clone()],
                total: order.total,
                initial_status: order.status,
            }),
            Uuid::new_v4(),
        );

        store
            .insert_order(NewOrder { order, line_items: vec![line], created })
            .await
            .unwrap();
        (order_id, vendor.id)
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_writes_nothing() {
        let store = MemoryStore::new();
        let (order_id, vendor_id) = seeded_order(&store).await;

        {
            let mut tx = store.lock_order(order_id, Duration::from_millis(100)).await.unwrap();
            tx.upsert_vendor_status(vendor_id, VendorStatus::Ready).await.unwrap();
            tx.set_order_status(OrderStatus::Ready).await.unwrap();
            assert_eq!(tx.get_vendor_status(vendor_id).await.unwrap(), Some(VendorStatus::Ready));
        }

        let snapshot = store.fetch_order(order_id).await.unwrap().unwrap();
        assert_eq!(snapshot.order.status, OrderStatus::InMaking);
        assert!(snapshot.vendor_statuses.is_empty());
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes_and_journal() {
        let store = MemoryStore::new();
        let (order_id, vendor_id) = seeded_order(&store).await;

        let mut tx = store.lock_order(order_id, Duration::from_millis(100)).await.unwrap();
        tx.upsert_vendor_status(vendor_id, VendorStatus::Ready).await.unwrap();
        let seq = tx
            .append_event(&OrderEvent::PaymentCaptured(crate::domain::order::PaymentCaptured {
                captured_at: Utc::now(),
            }), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(seq, 2);
        tx.commit().await.unwrap();

        let snapshot = store.fetch_order(order_id).await.unwrap().unwrap();
        assert_eq!(snapshot.vendor_statuses.get(&vendor_id), Some(&VendorStatus::Ready));
        assert_eq!(snapshot.order.version, 2);
        assert_eq!(store.order_events(order_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_locker_times_out_while_first_holds() {
        let store = MemoryStore::new();
        let (order_id, _) = seeded_order(&store).await;

        let held = store.lock_order(order_id, Duration::from_millis(100)).await.unwrap();
        let second = store.lock_order(order_id, Duration::from_millis(20)).await;
        assert!(matches!(second, Err(StoreError::LockTimeout(id)) if id == order_id));

        drop(held);
        assert!(store.lock_order(order_id, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_locks_are_per_order() {
        let store = MemoryStore::new();
        let (first, _) = seeded_order(&store).await;
        let (second, _) = seeded_order(&store).await;

        let _held = store.lock_order(first, Duration::from_millis(100)).await.unwrap();
        assert!(store.lock_order(second, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_registry_is_pruned_once_released() {
        let store = MemoryStore::new();
        let mut orders = Vec::new();
        for _ in 0..5 {
            orders.push(seeded_order(&store).await.0);
        }

        for order_id in &orders {
            let tx = store.lock_order(*order_id, Duration::from_millis(100)).await.unwrap();
            tx.commit().await.unwrap();
            drop(store.lock_order(*order_id, Duration::from_millis(100)).await.unwrap());
        }
        assert_eq!(store.tracked_order_locks(), 0);

        let held = store.lock_order(orders[0], Duration::from_millis(100)).await.unwrap();
        assert_eq!(store.tracked_order_locks(), 1);
        assert!(store.lock_order(orders[0], Duration::from_millis(20)).await.is_err());
        assert_eq!(store.tracked_order_locks(), 1);
        drop(held);
        assert_eq!(store.tracked_order_locks(), 0);
    }

    #[tokio::test]
    async fn test_waiter_keeps_lock_entry_alive() {
        let store = MemoryStore::new();
        let (order_id, _) = seeded_order(&store).await;

        let held = store.lock_order(order_id, Duration::from_millis(100)).await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.lock_order(order_id, Duration::from_secs(1)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        assert!(waiter.await.unwrap());
        assert_eq!(store.tracked_order_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_on_missing_order() {
        let store = MemoryStore::new();
        let missing = Uuid::new_v4();
        let result = store.lock_order(missing, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(StoreError::OrderNotFound(id)) if id == missing));
    }
}
