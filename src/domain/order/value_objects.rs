use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Amount of money in minor currency units (paise).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(units: i64) -> Self {
        Self(units)
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Price multiplied by a line quantity, saturating at the `i64` bounds.
    pub fn times(&self, quantity: i32) -> Money {
        Money(self.0.saturating_mul(i64::from(quantity)))
    }

    /// Price multiplied by a line quantity, `None` on overflow.
    pub fn checked_times(&self, quantity: i32) -> Option<Money> {
        self.0.checked_mul(i64::from(quantity)).map(Money)
    }

    pub fn checked_add(&self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    /// Sum of amounts, `None` on overflow.
    pub fn checked_sum<I>(amounts: I) -> Option<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |total, amount| total.checked_add(amount))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Overall order status, derived from the vendors' statuses once paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    InMaking,
    Ready,
    PickedUp,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::InMaking => "in_making",
            OrderStatus::Ready => "ready",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Vendors may only act on orders that are paid and not yet collected.
    pub fn accepts_vendor_updates(&self) -> bool {
        matches!(self, OrderStatus::InMaking | OrderStatus::Ready)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(OrderStatus::PendingPayment),
            "in_making" => Ok(OrderStatus::InMaking),
            "ready" => Ok(OrderStatus::Ready),
            "picked_up" => Ok(OrderStatus::PickedUp),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Per-vendor fulfillment status. Only moves forward:
/// `pending -> ready -> picked_up`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorStatus {
    #[default]
    Pending,
    Ready,
    PickedUp,
}

impl VendorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorStatus::Pending => "pending",
            VendorStatus::Ready => "ready",
            VendorStatus::PickedUp => "picked_up",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            VendorStatus::Pending => 0,
            VendorStatus::Ready => 1,
            VendorStatus::PickedUp => 2,
        }
    }

    /// Exactly one step forward; no skipping, no staying put, no regression.
    pub fn can_advance_to(&self, next: VendorStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn is_ready_or_later(&self) -> bool {
        matches!(self, VendorStatus::Ready | VendorStatus::PickedUp)
    }
}

impl fmt::Display for VendorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VendorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VendorStatus::Pending),
            "ready" => Ok(VendorStatus::Ready),
            "picked_up" => Ok(VendorStatus::PickedUp),
            other => Err(format!("unknown vendor status: {}", other)),
        }
    }
}

/// Line requested at checkout.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LineItemInput {
    pub menu_item_id: Uuid,
    pub quantity: i32,
    pub unit_price: Money,
}

/// Persisted order line. `vendor_id` and `unit_price` are captured when the
/// order is created and never change afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderLineItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub menu_item_id: Uuid,
    pub vendor_id: Uuid,
    pub quantity: i32,
    pub unit_price: Money,
}

impl OrderLineItem {
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }

    pub fn checked_line_total(&self) -> Option<Money> {
        self.unit_price.checked_times(self.quantity)
    }
}

/// Order row as stored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub total: Money,
    pub status: OrderStatus,
    pub payment_reference: Option<String>,
    /// Number of journal entries recorded for the order.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Everything the store knows about one order, as read outside the lock.
#[derive(Clone, Debug)]
pub struct OrderSnapshot {
    pub order: OrderRecord,
    pub line_items: Vec<OrderLineItem>,
    /// Only vendors that have acted so far have a row.
    pub vendor_statuses: BTreeMap<Uuid, VendorStatus>,
}

impl OrderSnapshot {
    pub fn implicated_vendors(&self) -> impl Iterator<Item = Uuid> + '_ {
        let mut seen = std::collections::BTreeSet::new();
        self.line_items
            .iter()
            .map(|item| item.vendor_id)
            .filter(move |vendor_id| seen.insert(*vendor_id))
    }
}

/// Read-only projection returned by `get_order_view`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderView {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub overall_status: OrderStatus,
    /// Every implicated vendor; vendors without a row yet report `pending`.
    pub per_vendor_statuses: BTreeMap<Uuid, VendorStatus>,
    pub line_items: Vec<OrderLineItem>,
    pub total: Money,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<OrderSnapshot> for OrderView {
    fn from(snapshot: OrderSnapshot) -> Self {
        let per_vendor_statuses = snapshot
            .implicated_vendors()
            .map(|vendor_id| {
                let status = snapshot
                    .vendor_statuses
                    .get(&vendor_id)
                    .copied()
                    .unwrap_or_default();
                (vendor_id, status)
            })
            .collect();

        Self {
            order_id: snapshot.order.id,
            customer_id: snapshot.order.customer_id,
            overall_status: snapshot.order.status,
            per_vendor_statuses,
            total: snapshot.order.total,
            payment_reference: snapshot.order.payment_reference,
            created_at: snapshot.order.created_at,
            line_items: snapshot.line_items,
        }
    }
}

/// One entry in a vendor's work queue: only that vendor's lines are included.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VendorOrderSummary {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub overall_status: OrderStatus,
    pub vendor_status: VendorStatus,
    pub line_items: Vec<OrderLineItem>,
    pub vendor_subtotal: Money,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Unit Tests
// ============================================================================
