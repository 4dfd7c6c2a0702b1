use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use uuid::Uuid;

use crate::event_log::{Aggregate, EventEnvelope};
use crate::metrics::Metrics;
use crate::store::{with_order_lock, NewOrder, OrderTransaction, Persistence};
use crate::utils::{retry_on_transient, RetryConfig};

use super::aggregate::OrderFulfillment;
use super::commands::OrderCommand;
use super::errors::OrderError;
use super::events::{OrderCreated, OrderEvent};
use super::value_objects::*;

// ============================================================================
// Order Command Handler
// ============================================================================
//
// Orchestrates: lock order → load state → Aggregate → events → write rows and
// journal → commit. Every step after the lock runs inside one transaction, so
// a vendor status row is never committed without the aggregate recomputed
// from it. The handler keeps no order state between calls.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// New orders wait in `pending_payment` until a capture arrives
    pub payment_gate: bool,
    pub lock_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payment_gate: true,
            lock_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }
}

/// Whether a payment command changed the order or found it already settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Applied,
    AlreadyApplied,
}

struct Executed {
    status: OrderStatus,
    events: Vec<OrderEvent>,
}

#[derive(Clone)]
pub struct OrderCommandHandler {
    store: Arc<dyn Persistence>,
    config: EngineConfig,
    metrics: Option<Arc<Metrics>>,
}

impl OrderCommandHandler {
    pub fn new(store: Arc<dyn Persistence>, config: EngineConfig) -> Self {
        Self { store, config, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Place an order. Unit prices are taken as given; vendor ownership is
    /// resolved from the menu.
    pub async fn create_order(
        &self,
        customer_id: Uuid,
        line_items: Vec<LineItemInput>,
    ) -> Result<Uuid, OrderError> {
        let started = Instant::now();
        let result = self.create_order_inner(customer_id, line_items).await;
        self.observe("create_order", started, &result);

        match &result {
            Ok(order_id) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_order_created();
                }
                tracing::info!(order_id = %order_id, customer_id = %customer_id, "Order created");
            }
            Err(err) => {
                tracing::warn!(customer_id = %customer_id, error = %err, "Order creation rejected");
            }
        }

        result
    }

    async fn create_order_inner(
        &self,
        customer_id: Uuid,
        line_items: Vec<LineItemInput>,
    ) -> Result<Uuid, OrderError> {
        if line_items.is_empty() {
            return Err(OrderError::Validation("order must contain at least one line item".into()));
        }

        for line in &line_items {
            if line.quantity <= 0 {
                return Err(OrderError::Validation(format!(
                    "quantity for menu item {} must be positive, got {}",
                    line.menu_item_id, line.quantity
                )));
            }
            if line.unit_price.is_negative() {
                return Err(OrderError::Validation(format!(
                    "unit price for menu item {} must be non-negative, got {}",
                    line.menu_item_id, line.unit_price
                )));
            }
        }

        let ids: Vec<Uuid> = line_items
            .iter()
            .map(|line| line.menu_item_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let menu = self.store.menu_items(&ids).await?;

        let order_id = Uuid::now_v7();
        let mut lines = Vec::with_capacity(line_items.len());
        for input in &line_items {
            let item = menu.get(&input.menu_item_id).ok_or_else(|| {
                OrderError::Validation(format!("menu item {} does not exist", input.menu_item_id))
            })?;
            if !item.available {
                return Err(OrderError::Validation(format!(
                    "menu item {} ({}) is not available",
                    item.id, item.name
                )));
            }

            lines.push(OrderLineItem {
                id: Uuid::new_v4(),
                order_id,
                menu_item_id: item.id,
                vendor_id: item.vendor_id,
                quantity: input.quantity,
                unit_price: input.unit_price,
            });
        }

        let total = lines
            .iter()
            .map(OrderLineItem::checked_line_total)
            .try_fold(Money::ZERO, |total, line| total.checked_add(line?))
            .ok_or_else(|| OrderError::Validation("order total is out of range".into()))?;
        let status = if self.config.payment_gate {
            OrderStatus::PendingPayment
        } else {
            OrderStatus::InMaking
        };

        let order = OrderRecord {
            id: order_id,
            customer_id,
            total,
            status,
            payment_reference: None,
            version: 1,
            created_at: Utc::now(),
        };
        let created = EventEnvelope::new(
            order_id,
            1,
            OrderEvent::Created(OrderCreated {
                order_id,
                customer_id,
                line_items: lines.clone(),
                total,
                initial_status: status,
            }),
            Uuid::new_v4(),
        );

        self.store
            .insert_order(NewOrder { order, line_items: lines, created })
            .await?;

        Ok(order_id)
    }

    /// Advance one vendor's status and recompute the order's overall status
    /// in the same locked transaction. Returns the overall status afterwards.
    pub async fn mark_vendor_status(
        &self,
        order_id: Uuid,
        vendor_id: Uuid,
        status: VendorStatus,
    ) -> Result<OrderStatus, OrderError> {
        let executed = self
            .execute(order_id, OrderCommand::MarkVendorStatus { vendor_id, status })
            .await?;
        Ok(executed.status)
    }

    /// Idempotent: a duplicate or late capture is acknowledged without change.
    pub async fn mark_payment_captured(&self, order_id: Uuid) -> Result<PaymentOutcome, OrderError> {
        let executed = self.execute(order_id, OrderCommand::CapturePayment).await?;
        Ok(outcome(&executed))
    }

    /// Cancel an unpaid order. Repeated failures are acknowledged without change.
    pub async fn mark_payment_failed(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<PaymentOutcome, OrderError> {
        let executed = self
            .execute(order_id, OrderCommand::FailPayment { reason })
            .await?;
        Ok(outcome(&executed))
    }

    pub async fn attach_payment_reference(&self, order_id: Uuid, reference: &str) -> Result<(), OrderError> {
        self.execute(
            order_id,
            OrderCommand::AttachPaymentReference { reference: reference.to_string() },
        )
        .await?;
        Ok(())
    }

    async fn execute(&self, order_id: Uuid, command: OrderCommand) -> Result<Executed, OrderError> {
        let name = command.name();
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();

        let result = retry_on_transient(self.config.retry.clone(), |attempt| {
            let command = command.clone();
            async move {
                if attempt > 1 {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry_attempt(name);
                    }
                }

                let result = self.execute_once(order_id, command, correlation_id).await;
                if let (Err(OrderError::LockTimeout { .. }), Some(metrics)) = (&result, &self.metrics) {
                    metrics.record_lock_timeout();
                }
                result
            }
        })
        .await
        .into_result();

        self.observe(name, started, &result);

        match &result {
            Ok(executed) => self.record_events(order_id, &executed.events),
            Err(err) => {
                tracing::warn!(
                    order_id = %order_id,
                    command = name,
                    error = %err,
                    "Order command rejected"
                );
            }
        }

        result
    }

    async fn execute_once(
        &self,
        order_id: Uuid,
        command: OrderCommand,
        correlation_id: Uuid,
    ) -> Result<Executed, OrderError> {
        with_order_lock(self.store.as_ref(), order_id, self.config.lock_timeout, move |tx| {
            Box::pin(async move {
                let mut state = load_fulfillment(tx).await?;
                let events = state.handle_command(&command)?;

                for event in &events {
                    persist_event(tx, event, correlation_id).await?;
                    state.apply_event(event)?;
                }

                Ok(Executed { status: state.status, events })
            })
        })
        .await
    }

    fn record_events(&self, order_id: Uuid, events: &[OrderEvent]) {
        for event in events {
            match event {
                OrderEvent::VendorStatusChanged(e) => {
                    tracing::info!(
                        order_id = %order_id,
                        vendor_id = %e.vendor_id,
                        from = %e.from,
                        to = %e.to,
                        "Vendor status changed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_vendor_transition(e.from.as_str(), e.to.as_str());
                    }
                }
                OrderEvent::OverallStatusChanged(e) => {
                    tracing::info!(order_id = %order_id, from = %e.from, to = %e.to, "Order status changed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_order_transition(e.from.as_str(), e.to.as_str());
                    }
                }
                OrderEvent::PaymentReferenceAttached(e) => {
                    tracing::info!(order_id = %order_id, reference = %e.reference, "Payment reference attached");
                }
                OrderEvent::PaymentCaptured(_) => {
                    tracing::info!(order_id = %order_id, "Payment captured");
                }
                OrderEvent::PaymentFailed(e) => {
                    tracing::info!(order_id = %order_id, reason = ?e.reason, "Payment failed");
                }
                OrderEvent::Created(_) => {}
            }
        }
    }

    fn observe<T>(&self, command: &str, started: Instant, result: &Result<T, OrderError>) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_command(command, started.elapsed().as_secs_f64());
            if let Err(err) = result {
                metrics.record_rejection(command, err.kind());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_order_view(&self, order_id: Uuid) -> Result<OrderView, OrderError> {
        self.store
            .fetch_order(order_id)
            .await?
            .map(OrderView::from)
            .ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Journal of every accepted change, oldest first
    pub async fn get_order_history(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, OrderError> {
        let events = self.store.order_events(order_id).await?;
        if events.is_empty() {
            return Err(OrderError::OrderNotFound(order_id));
        }
        Ok(events)
    }

    /// Rebuild the fulfillment state purely from the journal.
    pub async fn replay_order(&self, order_id: Uuid) -> Result<OrderFulfillment, OrderError> {
        let events = self.get_order_history(order_id).await?;
        OrderFulfillment::replay(&events)?.ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Newest first
    pub async fn list_customer_orders(&self, customer_id: Uuid) -> Result<Vec<OrderView>, OrderError> {
        let orders = self.store.customer_orders(customer_id).await?;
        Ok(orders.into_iter().map(OrderView::from).collect())
    }

    /// Active orders waiting on this vendor, oldest first. `vendor_status`
    /// narrows to orders where the vendor is at that status.
    pub async fn list_vendor_orders(
        &self,
        vendor_id: Uuid,
        vendor_status: Option<VendorStatus>,
    ) -> Result<Vec<VendorOrderSummary>, OrderError> {
        let orders = self.store.active_vendor_orders(vendor_id).await?;

        Ok(orders
            .into_iter()
            .filter_map(|snapshot| {
                let status = snapshot
                    .vendor_statuses
                    .get(&vendor_id)
                    .copied()
                    .unwrap_or_default();
                if vendor_status.is_some_and(|wanted| wanted != status) {
                    return None;
                }

                let line_items: Vec<_> = snapshot
                    .line_items
                    .into_iter()
                    .filter(|item| item.vendor_id == vendor_id)
                    .collect();

                Some(VendorOrderSummary {
                    order_id: snapshot.order.id,
                    customer_id: snapshot.order.customer_id,
                    overall_status: snapshot.order.status,
                    vendor_status: status,
                    vendor_subtotal: line_items.iter().map(OrderLineItem::line_total).sum(),
                    line_items,
                    created_at: snapshot.order.created_at,
                })
            })
            .collect())
    }
}

fn outcome(executed: &Executed) -> PaymentOutcome {
    if executed.events.is_empty() {
        PaymentOutcome::AlreadyApplied
    } else {
        PaymentOutcome::Applied
    }
}

/// Read everything the aggregate needs while the lock is held.
async fn load_fulfillment(tx: &mut dyn OrderTransaction) -> Result<OrderFulfillment, OrderError> {
    let order = tx.order().await?;
    let implicated_vendors = tx.get_vendors_for_order().await?;

    let mut vendor_statuses = BTreeMap::new();
    for vendor_id in &implicated_vendors {
        if let Some(status) = tx.get_vendor_status(*vendor_id).await? {
            vendor_statuses.insert(*vendor_id, status);
        }
    }

    Ok(OrderFulfillment {
        order_id: order.id,
        version: order.version,
        customer_id: order.customer_id,
        status: order.status,
        payment_reference: order.payment_reference,
        implicated_vendors,
        vendor_statuses,
    })
}

/// Write the row change an event describes, then journal it.
async fn persist_event(
    tx: &mut dyn OrderTransaction,
    event: &OrderEvent,
    correlation_id: Uuid,
) -> Result<(), OrderError> {
    match event {
        OrderEvent::VendorStatusChanged(e) => tx.upsert_vendor_status(e.vendor_id, e.to).await?,
        OrderEvent::OverallStatusChanged(e) => tx.set_order_status(e.to).await?,
        OrderEvent::PaymentReferenceAttached(e) => tx.set_payment_reference(&e.reference).await?,
        OrderEvent::PaymentCaptured(_) | OrderEvent::PaymentFailed(_) => {}
        OrderEvent::Created(_) => {
            return Err(OrderError::Validation(format!(
                "order {} cannot be created twice",
                tx.order_id()
            )))
        }
    }

    tx.append_event(event, correlation_id).await?;
    Ok(())
}

// ============================================================================
// Unit Tests
// ============================================================================
