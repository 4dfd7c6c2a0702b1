// ============================================================================
// Payment Notifications
// ============================================================================
//
// The payment provider delivers notifications at least once. Each one is
// turned into an idempotent engine call, so redelivery is acknowledged as
// `AlreadyApplied` rather than reported as an error.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::{OrderCommandHandler, OrderError, PaymentOutcome};
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum PaymentNotification {
    #[serde(rename = "payment.captured")]
    Captured {
        order_id: Uuid,
        /// Provider-side payment id, logged only
        #[serde(default)]
        payment_id: Option<String>,
    },
    #[serde(rename = "payment.failed")]
    Failed {
        order_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl PaymentNotification {
    pub fn order_id(&self) -> Uuid {
        match self {
            PaymentNotification::Captured { order_id, .. } => *order_id,
            PaymentNotification::Failed { order_id, .. } => *order_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PaymentNotification::Captured { .. } => "captured",
            PaymentNotification::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Malformed payment notification: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Order(#[from] OrderError),
}

#[derive(Clone)]
pub struct PaymentListener {
    orders: OrderCommandHandler,
    metrics: Option<Arc<Metrics>>,
}

impl PaymentListener {
    pub fn new(orders: OrderCommandHandler) -> Self {
        Self { orders, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parse a raw JSON body and dispatch it.
    pub async fn handle_payload(&self, payload: &str) -> Result<PaymentOutcome, PaymentError> {
        let notification: PaymentNotification = match serde_json::from_str(payload) {
            Ok(notification) => notification,
            Err(err) => {
                tracing::warn!(error = %err, "Discarding malformed payment notification");
                self.record("unknown", "malformed");
                return Err(err.into());
            }
        };

        self.handle(notification).await
    }

    pub async fn handle(&self, notification: PaymentNotification) -> Result<PaymentOutcome, PaymentError> {
        let order_id = notification.order_id();
        let kind = notification.kind();

        let result = match notification {
            PaymentNotification::Captured { order_id, payment_id } => {
                tracing::debug!(order_id = %order_id, payment_id = ?payment_id, "Payment capture received");
                self.orders.mark_payment_captured(order_id).await
            }
            PaymentNotification::Failed { order_id, reason } => {
                tracing::debug!(order_id = %order_id, reason = ?reason, "Payment failure received");
                self.orders.mark_payment_failed(order_id, reason).await
            }
        };

        match &result {
            Ok(PaymentOutcome::Applied) => self.record(kind, "applied"),
            Ok(PaymentOutcome::AlreadyApplied) => {
                tracing::info!(order_id = %order_id, kind, "Duplicate payment notification acknowledged");
                self.record(kind, "duplicate");
            }
            Err(err) => {
                tracing::warn!(order_id = %order_id, kind, error = %err, "Payment notification rejected");
                self.record(kind, "rejected");
            }
        }

        result.map_err(PaymentError::from)
    }

    fn record(&self, kind: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_payment_notification(kind, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::menu::{MenuItem, Vendor};
    use crate::domain::order::{EngineConfig, LineItemInput, Money, OrderStatus};
    use crate::store::{CatalogStore, MemoryStore};

    async fn listener_with_order() -> (PaymentListener, OrderCommandHandler, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let vendor = Vendor::new("Chaat Corner");
        store.save_vendor(&vendor).await.unwrap();
        let item = MenuItem::new(vendor.id, "Pani Puri", Money(4000));
        store.save_menu_item(&item).await.unwrap();

        let orders = OrderCommandHandler::new(store, EngineConfig::default());
        let order_id = orders
            .create_order(
                Uuid::new_v4(),
                vec![LineItemInput { menu_item_id: item.id, quantity: 1, unit_price: item.price }],
            )
            .await
            .unwrap();

        let listener = PaymentListener::new(orders.clone()).with_metrics(Arc::new(Metrics::new().unwrap()));
        (listener, orders, order_id)
    }

    #[test]
    fn test_parse_notifications() {
        let id = Uuid::new_v4();
        let captured: PaymentNotification =
            serde_json::from_str(&format!(r#"{{"event":"payment.captured","order_id":"{}"}}"#, id)).unwrap();
        assert_eq!(captured, PaymentNotification::Captured { order_id: id, payment_id: None });

        let failed: PaymentNotification = serde_json::from_str(&format!(
            r#"{{"event":"payment.failed","order_id":"{}","reason":"card declined"}}"#,
            id
        ))
        .unwrap();
        assert_eq!(failed.kind(), "failed");
        assert_eq!(failed.order_id(), id);
    }

    #[tokio::test]
    async fn test_duplicate_capture_is_acknowledged() {
        let (listener, orders, order_id) = listener_with_order().await;
        let payload = format!(r#"{{"event":"payment.captured","order_id":"{}","payment_id":"pay_9"}}"#, order_id);

        assert_eq!(listener.handle_payload(&payload).await.unwrap(), PaymentOutcome::Applied);
        assert_eq!(listener.handle_payload(&payload).await.unwrap(), PaymentOutcome::AlreadyApplied);

        let view = orders.get_order_view(order_id).await.unwrap();
        assert_eq!(view.overall_status, OrderStatus::InMaking);
    }

    #[tokio::test]
    async fn test_failure_cancels_order() {
        let (listener, orders, order_id) = listener_with_order().await;
        let notification = PaymentNotification::Failed { order_id, reason: Some("timeout".into()) };

        assert_eq!(listener.handle(notification).await.unwrap(), PaymentOutcome::Applied);
        let view = orders.get_order_view(order_id).await.unwrap();
        assert_eq!(view.overall_status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_order() {
        let (listener, _, _) = listener_with_order().await;

        assert!(matches!(
            listener.handle_payload(r#"{"event":"payment.refunded"}"#).await,
            Err(PaymentError::Malformed(_))
        ));

        let unknown = PaymentNotification::Captured { order_id: Uuid::new_v4(), payment_id: None };
        assert!(matches!(
            listener.handle(unknown).await,
            Err(PaymentError::Order(OrderError::OrderNotFound(_)))
        ));
    }
}
