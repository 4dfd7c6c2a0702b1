use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

use crate::event_log::Aggregate;
use super::value_objects::{OrderStatus, VendorStatus};
use super::events::*;
use super::commands::OrderCommand;
use super::errors::OrderError;

// ============================================================================
// Order Fulfillment Aggregate
// ============================================================================
//
// State of one order as seen under its lock: the overall status, the set of
// implicated vendors and the vendor status rows written so far. Vendors
// without a row are `pending`.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFulfillment {
    pub order_id: Uuid,
    pub version: i64,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_reference: Option<String>,
    pub implicated_vendors: BTreeSet<Uuid>,
    pub vendor_statuses: BTreeMap<Uuid, VendorStatus>,
}

/// Recompute-on-write rule: `picked_up` once every vendor has handed over,
/// `ready` once every vendor is ready or beyond, otherwise unchanged.
pub fn aggregate_overall_status<I>(current: OrderStatus, vendor_statuses: I) -> OrderStatus
where
    I: IntoIterator<Item = VendorStatus>,
{
    let mut any = false;
    let mut all_ready = true;
    let mut all_picked_up = true;

    for status in vendor_statuses {
        any = true;
        all_ready &= status.is_ready_or_later();
        all_picked_up &= status == VendorStatus::PickedUp;
    }

    if !any {
        current
    } else if all_picked_up {
        OrderStatus::PickedUp
    } else if all_ready {
        OrderStatus::Ready
    } else {
        current
    }
}

impl OrderFulfillment {
    /// Capability check: only vendors owning a line item may act on the order
    pub fn is_implicated_vendor(&self, vendor_id: Uuid) -> bool {
        self.implicated_vendors.contains(&vendor_id)
    }

    pub fn vendor_status(&self, vendor_id: Uuid) -> VendorStatus {
        self.vendor_statuses.get(&vendor_id).copied().unwrap_or_default()
    }

    fn overall_status_with(&self, vendor_id: Uuid, status: VendorStatus) -> OrderStatus {
        let statuses = self.implicated_vendors.iter().map(|id| {
            if *id == vendor_id {
                status
            } else {
                self.vendor_status(*id)
            }
        });
        aggregate_overall_status(self.status, statuses)
    }

    fn overall_change(&self, to: OrderStatus) -> Option<OrderEvent> {
        (to != self.status).then(|| {
            OrderEvent::OverallStatusChanged(OverallStatusChanged { from: self.status, to })
        })
    }

    fn mark_vendor_status(
        &self,
        vendor_id: Uuid,
        status: VendorStatus,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if !self.is_implicated_vendor(vendor_id) {
            return Err(OrderError::NotImplicated { order_id: self.order_id, vendor_id });
        }

        // Unpaid and cancelled orders are closed to vendors. Past that, the
        // one-step rule decides, including on a fully collected order.
        if matches!(self.status, OrderStatus::PendingPayment | OrderStatus::Cancelled) {
            return Err(OrderError::OrderNotActive {
                order_id: self.order_id,
                status: self.status,
            });
        }

        let current = self.vendor_status(vendor_id);
        if !current.can_advance_to(status) {
            return Err(OrderError::InvalidTransition {
                subject: format!("vendor {}", vendor_id),
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        let mut events = vec![OrderEvent::VendorStatusChanged(VendorStatusChanged {
            vendor_id,
            from: current,
            to: status,
        })];
        events.extend(self.overall_change(self.overall_status_with(vendor_id, status)));

        Ok(events)
    }

    fn attach_payment_reference(&self, reference: &str) -> Result<Vec<OrderEvent>, OrderError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(OrderError::Validation("payment reference cannot be empty".into()));
        }

        match &self.payment_reference {
            Some(existing) if existing == reference => return Ok(vec![]),
            Some(existing) => {
                return Err(OrderError::Validation(format!(
                    "order {} already has payment reference {}",
                    self.order_id, existing
                )))
            }
            None => {}
        }

        if self.status != OrderStatus::PendingPayment {
            return Err(OrderError::Validation(format!(
                "payment reference can only be attached while pending payment (order is {})",
                self.status
            )));
        }

        Ok(vec![OrderEvent::PaymentReferenceAttached(PaymentReferenceAttached {
            reference: reference.to_string(),
        })])
    }

    fn capture_payment(&self) -> Vec<OrderEvent> {
        // Duplicate or late deliveries leave the order untouched
        if self.status != OrderStatus::PendingPayment {
            return vec![];
        }

        vec![
            OrderEvent::PaymentCaptured(PaymentCaptured { captured_at: Utc::now() }),
            OrderEvent::OverallStatusChanged(OverallStatusChanged {
                from: OrderStatus::PendingPayment,
                to: OrderStatus::InMaking,
            }),
        ]
    }

    fn fail_payment(&self, reason: &Option<String>) -> Result<Vec<OrderEvent>, OrderError> {
        match self.status {
            OrderStatus::PendingPayment => Ok(vec![
                OrderEvent::PaymentFailed(PaymentFailed {
                    failed_at: Utc::now(),
                    reason: reason.clone(),
                }),
                OrderEvent::OverallStatusChanged(OverallStatusChanged {
                    from: OrderStatus::PendingPayment,
                    to: OrderStatus::Cancelled,
                }),
            ]),
            OrderStatus::Cancelled => Ok(vec![]),
            other => Err(OrderError::InvalidTransition {
                subject: format!("order {}", self.order_id),
                from: other.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            }),
        }
    }
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for OrderFulfillment {
    type Event = OrderEvent;
    type Command = OrderCommand;
    type Error = OrderError;

    fn apply_first_event(event: &Self::Event) -> Result<Self, Self::Error> {
        match event {
            OrderEvent::Created(e) => Ok(Self {
                order_id: e.order_id,
                version: 1,
                customer_id: e.customer_id,
                status: e.initial_status,
                payment_reference: None,
                implicated_vendors: e.line_items.iter().map(|item| item.vendor_id).collect(),
                vendor_statuses: BTreeMap::new(),
            }),
            other => Err(OrderError::Validation(format!(
                "journal must start with OrderCreated, found {:?}",
                other
            ))),
        }
    }

    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            OrderEvent::Created(_) => {
                return Err(OrderError::Validation(format!(
                    "order {} was already created",
                    self.order_id
                )))
            }
            OrderEvent::PaymentReferenceAttached(e) => {
                self.payment_reference = Some(e.reference.clone());
            }
            OrderEvent::PaymentCaptured(_) | OrderEvent::PaymentFailed(_) => {}
            OrderEvent::VendorStatusChanged(e) => {
                self.vendor_statuses.insert(e.vendor_id, e.to);
            }
            OrderEvent::OverallStatusChanged(e) => {
                self.status = e.to;
            }
        }

        self.version += 1;
        Ok(())
    }

    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::MarkVendorStatus { vendor_id, status } => {
                self.mark_vendor_status(*vendor_id, *status)
            }
            OrderCommand::AttachPaymentReference { reference } => {
                self.attach_payment_reference(reference)
            }
            OrderCommand::CapturePayment => Ok(self.capture_payment()),
            OrderCommand::FailPayment { reason } => self.fail_payment(reason),
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::value_objects::{Money, OrderLineItem};
    use crate::event_log::EventEnvelope;

    fn fulfillment(status: OrderStatus, vendors: &[Uuid]) -> OrderFulfillment {
        OrderFulfillment {
            order_id: Uuid::new_v4(),
            version: 1,
            customer_id: Uuid::new_v4(),
            status,
            payment_reference: None,
            implicated_vendors: vendors.iter().copied().collect(),
            vendor_statuses: BTreeMap::new(),
        }
    }

    fn apply_all(agg: &mut OrderFulfillment, events: &[OrderEvent]) {
        for event in events {
            agg.apply_event(event).unwrap();
        }
    }

    fn mark(vendor_id: Uuid, status: VendorStatus) -> OrderCommand {
        OrderCommand::MarkVendorStatus { vendor_id, status }
    }

    #[test]
    fn test_aggregate_rule() {
        use VendorStatus::*;

        assert_eq!(aggregate_overall_status(OrderStatus::InMaking, [Ready, Pending]), OrderStatus::InMaking);
        assert_eq!(aggregate_overall_status(OrderStatus::InMaking, [Ready, Ready]), OrderStatus::Ready);
        assert_eq!(aggregate_overall_status(OrderStatus::InMaking, [PickedUp, Ready]), OrderStatus::Ready);
        assert_eq!(aggregate_overall_status(OrderStatus::Ready, [PickedUp, PickedUp]), OrderStatus::PickedUp);
        assert_eq!(aggregate_overall_status(OrderStatus::InMaking, Vec::<VendorStatus>::new()), OrderStatus::InMaking);
    }

    #[test]
    fn test_first_vendor_ready_keeps_order_in_making() {
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let agg = fulfillment(OrderStatus::InMaking, &[x, y]);

        let events = agg.handle_command(&mark(x, VendorStatus::Ready)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], OrderEvent::VendorStatusChanged(_)));
    }

    #[test]
    fn test_last_vendor_ready_moves_order_to_ready() {
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let mut agg = fulfillment(OrderStatus::InMaking, &[x, y]);

        let events = agg.handle_command(&mark(x, VendorStatus::Ready)).unwrap();
        apply_all(&mut agg, &events);
        let events = agg.handle_command(&mark(y, VendorStatus::Ready)).unwrap();
        apply_all(&mut agg, &events);

        assert_eq!(agg.status, OrderStatus::Ready);
        assert_eq!(
            events.last(),
            Some(&OrderEvent::OverallStatusChanged(OverallStatusChanged {
                from: OrderStatus::InMaking,
                to: OrderStatus::Ready,
            }))
        );
    }

    #[test]
    fn test_all_picked_up_moves_order_to_picked_up() {
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let mut agg = fulfillment(OrderStatus::InMaking, &[x, y]);

        for command in [
            mark(x, VendorStatus::Ready),
            mark(y, VendorStatus::Ready),
            mark(x, VendorStatus::PickedUp),
        ] {
            let events = agg.handle_command(&command).unwrap();
            apply_all(&mut agg, &events);
        }
        assert_eq!(agg.status, OrderStatus::Ready);

        let events = agg.handle_command(&mark(y, VendorStatus::PickedUp)).unwrap();
        apply_all(&mut agg, &events);
        assert_eq!(agg.status, OrderStatus::PickedUp);
    }

    #[test]
    fn test_vendor_outside_order_is_rejected() {
        let agg = fulfillment(OrderStatus::InMaking, &[Uuid::new_v4()]);
        let stranger = Uuid::new_v4();

        let result = agg.handle_command(&mark(stranger, VendorStatus::Ready));
        assert!(matches!(result, Err(OrderError::NotImplicated { vendor_id, .. }) if vendor_id == stranger));
    }

    #[test]
    fn test_regression_and_skips_are_rejected() {
        let x = Uuid::new_v4();
        let mut agg = fulfillment(OrderStatus::InMaking, &[x]);

        let result = agg.handle_command(&mark(x, VendorStatus::PickedUp));
        assert!(matches!(result, Err(OrderError::InvalidTransition { .. })));

        let events = agg.handle_command(&mark(x, VendorStatus::Ready)).unwrap();
        apply_all(&mut agg, &events);
        let result = agg.handle_command(&mark(x, VendorStatus::Ready));
        assert!(matches!(result, Err(OrderError::InvalidTransition { .. })));

        let result = agg.handle_command(&mark(x, VendorStatus::Pending));
        assert!(matches!(result, Err(OrderError::InvalidTransition { .. })));
    }

    #[test]
    fn test_vendor_updates_require_paid_order() {
        let x = Uuid::new_v4();
        for status in [OrderStatus::PendingPayment, OrderStatus::Cancelled] {
            let agg = fulfillment(status, &[x]);
            let result = agg.handle_command(&mark(x, VendorStatus::Ready));
            assert!(matches!(result, Err(OrderError::OrderNotActive { .. })));
        }
    }

    #[test]
    fn test_collected_order_rejects_regression_as_invalid_transition() {
        let x = Uuid::new_v4();
        let mut agg = fulfillment(OrderStatus::InMaking, &[x]);

        for status in [VendorStatus::Ready, VendorStatus::PickedUp] {
            let events = agg.handle_command(&mark(x, status)).unwrap();
            apply_all(&mut agg, &events);
        }
        assert_eq!(agg.status, OrderStatus::PickedUp);

        for status in [VendorStatus::Pending, VendorStatus::Ready, VendorStatus::PickedUp] {
            let result = agg.handle_command(&mark(x, status));
            assert!(
                matches!(result, Err(OrderError::InvalidTransition { .. })),
                "{} after picked_up gave {:?}",
                status,
                result
            );
        }
    }

    #[test]
    fn test_capture_payment_only_once() {
        let mut agg = fulfillment(OrderStatus::PendingPayment, &[Uuid::new_v4()]);

        let events = agg.handle_command(&OrderCommand::CapturePayment).unwrap();
        assert_eq!(events.len(), 2);
        apply_all(&mut agg, &events);
        assert_eq!(agg.status, OrderStatus::InMaking);

        let events = agg.handle_command(&OrderCommand::CapturePayment).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_fail_payment() {
        let mut agg = fulfillment(OrderStatus::PendingPayment, &[Uuid::new_v4()]);
        let fail = OrderCommand::FailPayment { reason: Some("declined".into()) };

        let events = agg.handle_command(&fail).unwrap();
        apply_all(&mut agg, &events);
        assert_eq!(agg.status, OrderStatus::Cancelled);
        assert!(agg.handle_command(&fail).unwrap().is_empty());

        let paid = fulfillment(OrderStatus::InMaking, &[Uuid::new_v4()]);
        assert!(matches!(paid.handle_command(&fail), Err(OrderError::InvalidTransition { .. })));
    }

    #[test]
    fn test_payment_reference_rules() {
        let mut agg = fulfillment(OrderStatus::PendingPayment, &[Uuid::new_v4()]);
        let attach = |reference: &str| OrderCommand::AttachPaymentReference { reference: reference.into() };

        assert!(matches!(agg.handle_command(&attach("  ")), Err(OrderError::Validation(_))));

        let events = agg.handle_command(&attach("order_Pq1")).unwrap();
        apply_all(&mut agg, &events);
        assert_eq!(agg.payment_reference.as_deref(), Some("order_Pq1"));

        assert!(agg.handle_command(&attach("order_Pq1")).unwrap().is_empty());
        assert!(matches!(agg.handle_command(&attach("order_Zz9")), Err(OrderError::Validation(_))));
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let order_id = Uuid::new_v4();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let line = |vendor_id| OrderLineItem {
            id: Uuid::new_v4(),
            order_id,
            menu_item_id: Uuid::new_v4(),
            vendor_id,
            quantity: 1,
            unit_price: Money(100),
        };

        let created = OrderEvent::Created(OrderCreated {
            order_id,
            customer_id: Uuid::new_v4(),
            line_items: vec![line(x), line(y)],
            total: Money(200),
            initial_status: OrderStatus::PendingPayment,
        });

        let mut live = OrderFulfillment::apply_first_event(&created).unwrap();
        let mut journal = vec![created];
        for command in [
            OrderCommand::CapturePayment,
            mark(x, VendorStatus::Ready),
            mark(y, VendorStatus::Ready),
        ] {
            let events = live.handle_command(&command).unwrap();
            apply_all(&mut live, &events);
            journal.extend(events);
        }

        let correlation_id = Uuid::new_v4();
        let envelopes: Vec<_> = journal
            .into_iter()
            .enumerate()
            .map(|(i, e)| EventEnvelope::new(order_id, i as i64 + 1, e, correlation_id))
            .collect();

        let replayed = OrderFulfillment::replay(&envelopes).unwrap().unwrap();
        assert_eq!(replayed, live);
        assert_eq!(replayed.status, OrderStatus::Ready);
        assert_eq!(replayed.version(), envelopes.len() as i64);

        assert!(OrderFulfillment::replay(&[]).unwrap().is_none());
    }
}
