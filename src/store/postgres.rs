use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::domain::cart::{CartContext, CartError};
use crate::domain::menu::{MenuItem, Vendor};
use crate::domain::order::{
    Money, OrderEvent, OrderLineItem, OrderRecord, OrderSnapshot, OrderStatus, VendorStatus,
};
use crate::event_log::{deserialize_event, serialize_event, EventEnvelope};
use super::{CartEdit, CartStore, CatalogStore, NewOrder, OrderStore, OrderTransaction, StoreError};

// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// The order row is the lock: `SELECT ... FOR UPDATE` inside a transaction with
// a local `lock_timeout`. Postgres reports an expired lock wait as SQLSTATE
// 55P03, which is surfaced as StoreError::LockTimeout.
//
// ============================================================================

const SCHEMA: &str = include_str!("schema.sql");

const LOCK_NOT_AVAILABLE: &str = "55P03";

const ORDER_COLUMNS: &str =
    "id, customer_id, total, status, payment_reference, version, created_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if they do not exist yet
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Applying order schema");
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Read-only transaction whose queries all see one snapshot
    async fn begin_read(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

async fn snapshots(
    tx: &mut Transaction<'static, Postgres>,
    orders: Vec<OrderRecord>,
) -> Result<Vec<OrderSnapshot>, StoreError> {
    if orders.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<Uuid> = orders.iter().map(|order| order.id).collect();

    let mut line_items: HashMap<Uuid, Vec<OrderLineItem>> = HashMap::new();
    let rows = sqlx::query(
        "SELECT id, order_id, menu_item_id, vendor_id, quantity, unit_price
         FROM order_line_items WHERE order_id = ANY($1) ORDER BY order_id, id",
    )
    .bind(ids.clone())
    .fetch_all(&mut **tx)
    .await?;
    for row in &rows {
        let item = line_item_from_row(row)?;
        line_items.entry(item.order_id).or_default().push(item);
    }

    let mut statuses: HashMap<Uuid, BTreeMap<Uuid, VendorStatus>> = HashMap::new();
    let rows = sqlx::query(
        "SELECT order_id, vendor_id, status FROM vendor_order_status WHERE order_id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(&mut **tx)
    .await?;
    for row in &rows {
        let order_id: Uuid = row.try_get("order_id")?;
        let vendor_id: Uuid = row.try_get("vendor_id")?;
        let status = parse_vendor_status(row.try_get("status")?)?;
        statuses.entry(order_id).or_default().insert(vendor_id, status);
    }

    Ok(orders
        .into_iter()
        .map(|order| OrderSnapshot {
            line_items: line_items.remove(&order.id).unwrap_or_default(),
            vendor_statuses: statuses.remove(&order.id).unwrap_or_default(),
            order,
        })
        .collect())
}

fn parse_order_status(value: String) -> Result<OrderStatus, StoreError> {
    value.parse().map_err(StoreError::InvalidValue)
}

fn parse_vendor_status(value: String) -> Result<VendorStatus, StoreError> {
    value.parse().map_err(StoreError::InvalidValue)
}

fn order_from_row(row: &PgRow) -> Result<OrderRecord, StoreError> {
    Ok(OrderRecord {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        total: Money(row.try_get("total")?),
        status: parse_order_status(row.try_get("status")?)?,
        payment_reference: row.try_get("payment_reference")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
    })
}

fn line_item_from_row(row: &PgRow) -> Result<OrderLineItem, StoreError> {
    Ok(OrderLineItem {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        menu_item_id: row.try_get("menu_item_id")?,
        vendor_id: row.try_get("vendor_id")?,
        quantity: row.try_get("quantity")?,
        unit_price: Money(row.try_get("unit_price")?),
    })
}

fn vendor_from_row(row: &PgRow) -> Result<Vendor, StoreError> {
    Ok(Vendor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn menu_item_from_row(row: &PgRow) -> Result<MenuItem, StoreError> {
    Ok(MenuItem {
        id: row.try_get("id")?,
        vendor_id: row.try_get("vendor_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: Money(row.try_get("price")?),
        available: row.try_get("available")?,
    })
}

fn cart_from_row(customer_id: Uuid, row: &PgRow) -> Result<CartContext, StoreError> {
    let lines: String = row.try_get("lines")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(CartContext {
        customer_id,
        lines: serde_json::from_str(&lines)?,
        updated_at,
    })
}

fn event_from_row(row: &PgRow) -> Result<EventEnvelope<OrderEvent>, StoreError> {
    let event_data: String = row.try_get("event_data")?;
    Ok(EventEnvelope {
        event_id: row.try_get("event_id")?,
        aggregate_id: row.try_get("order_id")?,
        sequence_number: row.try_get("sequence_number")?,
        event_type: row.try_get("event_type")?,
        event_version: row.try_get("event_version")?,
        event_data: deserialize_event(&event_data)?,
        correlation_id: row.try_get("correlation_id")?,
        timestamp: row.try_get("created_at")?,
    })
}

fn lock_error(order_id: Uuid, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return StoreError::LockTimeout(order_id);
        }
    }
    StoreError::Database(err)
}

async fn insert_event(
    tx: &mut Transaction<'static, Postgres>,
    envelope: &EventEnvelope<OrderEvent>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO order_events (
            order_id, sequence_number, event_id, event_type, event_version,
            event_data, correlation_id, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(envelope.aggregate_id)
    .bind(envelope.sequence_number)
    .bind(envelope.event_id)
    .bind(&envelope.event_type)
    .bind(envelope.event_version)
    .bind(serialize_event(&envelope.event_data)?)
    .bind(envelope.correlation_id)
    .bind(envelope.timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub struct PostgresTransaction {
    order_id: Uuid,
    tx: Transaction<'static, Postgres>,
    record: OrderRecord,
}

#[async_trait]
impl OrderTransaction for PostgresTransaction {
    fn order_id(&self) -> Uuid {
        self.order_id
    }

    async fn order(&mut self) -> Result<OrderRecord, StoreError> {
        Ok(self.record.clone())
    }

    async fn get_vendors_for_order(&mut self) -> Result<BTreeSet<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT vendor_id FROM order_line_items WHERE order_id = $1")
            .bind(self.order_id)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("vendor_id").map_err(StoreError::from))
            .collect()
    }

    async fn get_vendor_status(&mut self, vendor_id: Uuid) -> Result<Option<VendorStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT status FROM vendor_order_status WHERE order_id = $1 AND vendor_id = $2",
        )
        .bind(self.order_id)
        .bind(vendor_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(parse_vendor_status(row.try_get("status")?)?)),
            None => Ok(None),
        }
    }

    async fn upsert_vendor_status(&mut self, vendor_id: Uuid, status: VendorStatus) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vendor_order_status (order_id, vendor_id, status, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (order_id, vendor_id)
             DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at",
        )
        .bind(self.order_id)
        .bind(vendor_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_order_status(&mut self, status: OrderStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
            .bind(self.order_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;
        self.record.status = status;
        Ok(())
    }

    async fn set_payment_reference(&mut self, reference: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET payment_reference = $2 WHERE id = $1")
            .bind(self.order_id)
            .bind(reference)
            .execute(&mut *self.tx)
            .await?;
        self.record.payment_reference = Some(reference.to_string());
        Ok(())
    }

    async fn append_event(&mut self, event: &OrderEvent, correlation_id: Uuid) -> Result<i64, StoreError> {
        let sequence_number = self.record.version + 1;
        let envelope = EventEnvelope::new(self.order_id, sequence_number, event.clone(), correlation_id);

        insert_event(&mut self.tx, &envelope).await?;
        sqlx::query("UPDATE orders SET version = $2 WHERE id = $1")
            .bind(self.order_id)
            .bind(sequence_number)
            .execute(&mut *self.tx)
            .await?;

        self.record.version = sequence_number;
        Ok(sequence_number)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn lock_order(&self, order_id: Uuid, timeout: Duration) -> Result<Box<dyn OrderTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1));
        sqlx::query(&set_timeout).execute(&mut *tx).await?;

        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = $1 FOR UPDATE", ORDER_COLUMNS))
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| lock_error(order_id, err))?;

        let record = match row {
            Some(row) => order_from_row(&row)?,
            None => return Err(StoreError::OrderNotFound(order_id)),
        };

        Ok(Box::new(PostgresTransaction { order_id, tx, record }))
    }

    async fn insert_order(&self, new_order: NewOrder) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // FOR SHARE blocks availability toggles until this order commits
        let ids: Vec<Uuid> = new_order.line_items.iter().map(|line| line.menu_item_id).collect();
        let rows = sqlx::query("SELECT id, available FROM menu_items WHERE id = ANY($1) FOR SHARE")
            .bind(ids)
            .fetch_all(&mut *tx)
            .await?;

        let mut availability = HashMap::new();
        for row in &rows {
            availability.insert(row.try_get::<Uuid, _>("id")?, row.try_get::<bool, _>("available")?);
        }

        for line in &new_order.line_items {
            match availability.get(&line.menu_item_id) {
                None => return Err(StoreError::MenuItemNotFound(line.menu_item_id)),
                Some(false) => return Err(StoreError::MenuItemUnavailable(line.menu_item_id)),
                Some(true) => {}
            }
        }

        let order = &new_order.order;
        sqlx::query(
            "INSERT INTO orders (id, customer_id, total, status, payment_reference, version, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(order.id)
        .bind(order.customer_id)
        .bind(order.total.minor_units())
        .bind(order.status.as_str())
        .bind(&order.payment_reference)
        .bind(order.version)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;

        for line in &new_order.line_items {
            sqlx::query(
                "INSERT INTO order_line_items (id, order_id, menu_item_id, vendor_id, quantity, unit_price)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(line.id)
            .bind(line.order_id)
            .bind(line.menu_item_id)
            .bind(line.vendor_id)
            .bind(line.quantity)
            .bind(line.unit_price.minor_units())
            .execute(&mut *tx)
            .await?;
        }

        insert_event(&mut tx, &new_order.created).await?;
        tx.commit().await?;

        tracing::debug!(order_id = %order.id, lines = new_order.line_items.len(), "Order rows inserted");
        Ok(())
    }

    async fn fetch_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, StoreError> {
        let mut tx = self.begin_read().await?;
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut snapshots = snapshots(&mut tx, vec![order_from_row(&row)?]).await?;
        tx.commit().await?;
        Ok(snapshots.pop())
    }

    async fn customer_orders(&self, customer_id: Uuid) -> Result<Vec<OrderSnapshot>, StoreError> {
        let mut tx = self.begin_read().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE customer_id = $1 ORDER BY created_at DESC",
            ORDER_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&mut *tx)
        .await?;

        let orders = rows.iter().map(order_from_row).collect::<Result<Vec<_>, _>>()?;
        let snapshots = snapshots(&mut tx, orders).await?;
        tx.commit().await?;
        Ok(snapshots)
    }

    async fn active_vendor_orders(&self, vendor_id: Uuid) -> Result<Vec<OrderSnapshot>, StoreError> {
        let mut tx = self.begin_read().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders
             WHERE status IN ('in_making', 'ready')
               AND id IN (SELECT order_id FROM order_line_items WHERE vendor_id = $1)
             ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))
        .bind(vendor_id)
        .fetch_all(&mut *tx)
        .await?;

        let orders = rows.iter().map(order_from_row).collect::<Result<Vec<_>, _>>()?;
        let snapshots = snapshots(&mut tx, orders).await?;
        tx.commit().await?;
        Ok(snapshots)
    }

    async fn order_events(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, StoreError> {
        let rows = sqlx::query(
            "SELECT order_id, sequence_number, event_id, event_type, event_version,
                    event_data, correlation_id, created_at
             FROM order_events WHERE order_id = $1 ORDER BY sequence_number ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn save_vendor(&self, vendor: &Vendor) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vendors (id, name) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(vendor.id)
        .bind(&vendor.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn vendor(&self, vendor_id: Uuid) -> Result<Option<Vendor>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM vendors WHERE id = $1")
            .bind(vendor_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(vendor_from_row).transpose()
    }

    async fn vendors(&self) -> Result<Vec<Vendor>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM vendors ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(vendor_from_row).collect()
    }

    async fn save_menu_item(&self, item: &MenuItem) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO menu_items (id, vendor_id, name, description, price, available)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                available = EXCLUDED.available",
        )
        .bind(item.id)
        .bind(item.vendor_id)
        .bind(&item.name)
        .bind(&item.description)
        .bind(item.price.minor_units())
        .bind(item.available)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                Err(StoreError::VendorNotFound(item.vendor_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn menu_item(&self, menu_item_id: Uuid) -> Result<Option<MenuItem>, StoreError> {
        let row = sqlx::query(
            "SELECT id, vendor_id, name, description, price, available FROM menu_items WHERE id = $1",
        )
        .bind(menu_item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(menu_item_from_row).transpose()
    }

    async fn menu_items(&self, menu_item_ids: &[Uuid]) -> Result<HashMap<Uuid, MenuItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, vendor_id, name, description, price, available FROM menu_items WHERE id = ANY($1)",
        )
        .bind(menu_item_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| menu_item_from_row(row).map(|item| (item.id, item)))
            .collect()
    }

    async fn vendor_menu(&self, vendor_id: Uuid) -> Result<Vec<MenuItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, vendor_id, name, description, price, available
             FROM menu_items WHERE vendor_id = $1 ORDER BY name",
        )
        .bind(vendor_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(menu_item_from_row).collect()
    }

    async fn set_menu_item_available(&self, menu_item_id: Uuid, available: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE menu_items SET available = $2 WHERE id = $1")
            .bind(menu_item_id)
            .bind(available)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MenuItemNotFound(menu_item_id));
        }
        Ok(())
    }
}

#[async_trait]
impl CartStore for PostgresStore {
    async fn load_cart(&self, customer_id: Uuid) -> Result<Option<CartContext>, StoreError> {
        let row = sqlx::query("SELECT lines, updated_at FROM carts WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(|row| cart_from_row(customer_id, row)).transpose()
    }

    async fn update_cart(&self, customer_id: Uuid, edit: CartEdit) -> Result<CartContext, CartError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        // Make sure a row exists so FOR UPDATE has something to lock
        sqlx::query(
            "INSERT INTO carts (customer_id, lines) VALUES ($1, '{}')
             ON CONFLICT (customer_id) DO NOTHING",
        )
        .bind(customer_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let row = sqlx::query("SELECT lines, updated_at FROM carts WHERE customer_id = $1 FOR UPDATE")
            .bind(customer_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        let mut cart = cart_from_row(customer_id, &row)?;

        edit(&mut cart)?;

        let lines = serde_json::to_string(&cart.lines).map_err(StoreError::from)?;
        sqlx::query("UPDATE carts SET lines = $2, updated_at = $3 WHERE customer_id = $1")
            .bind(customer_id)
            .bind(lines)
            .bind(cart.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;

        Ok(cart)
    }

    async fn clear_cart(&self, customer_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM carts WHERE customer_id = $1")
            .bind(customer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
