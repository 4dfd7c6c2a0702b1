use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::event_log::DomainEvent;
use super::value_objects::{Money, OrderLineItem, OrderStatus, VendorStatus};

// ============================================================================
// Order Events - journaled next to every order state change
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    Created(OrderCreated),
    PaymentReferenceAttached(PaymentReferenceAttached),
    PaymentCaptured(PaymentCaptured),
    PaymentFailed(PaymentFailed),
    VendorStatusChanged(VendorStatusChanged),
    OverallStatusChanged(OverallStatusChanged),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Created(_) => "OrderCreated",
            OrderEvent::PaymentReferenceAttached(_) => "PaymentReferenceAttached",
            OrderEvent::PaymentCaptured(_) => "PaymentCaptured",
            OrderEvent::PaymentFailed(_) => "PaymentFailed",
            OrderEvent::VendorStatusChanged(_) => "VendorStatusChanged",
            OrderEvent::OverallStatusChanged(_) => "OverallStatusChanged",
        }
    }
}

/// First event of every order
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub line_items: Vec<OrderLineItem>,
    pub total: Money,
    pub initial_status: OrderStatus,
}

/// External payment-order id recorded while awaiting payment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentReferenceAttached {
    pub reference: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentCaptured {
    pub captured_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentFailed {
    pub failed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VendorStatusChanged {
    pub vendor_id: Uuid,
    pub from: VendorStatus,
    pub to: VendorStatus,
}

/// Aggregate status moved; always emitted in the same unit as its cause
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OverallStatusChanged {
    pub from: OrderStatus,
    pub to: OrderStatus,
}
