use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use campus_eats::app_config::{AppConfig, StoreBackend};
use campus_eats::domain::cart::CartService;
use campus_eats::domain::menu::MenuCatalog;
use campus_eats::domain::order::{EngineConfig, Money, OrderCommandHandler, VendorStatus};
use campus_eats::metrics::{self, Metrics};
use campus_eats::payment::PaymentListener;
use campus_eats::store::{MemoryStore, Persistence, PostgresStore};
use campus_eats::utils::{retry_with_backoff, RetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::load()?;

    // RUST_LOG overrides the configured filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.filter)))
        .init();

    tracing::info!("🚀 Starting campus food ordering demo");

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    if cfg.metrics.enabled {
        let registry = Arc::new(metrics.registry().clone());
        let port = cfg.metrics.port;
        std::thread::spawn(move || {
            let result = actix_web::rt::System::new()
                .block_on(metrics::start_metrics_server(registry, port));
            if let Err(e) = result {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    // === 2. Store ===
    let store = open_store(&cfg).await?;

    // === 3. Services ===
    let orders = OrderCommandHandler::new(store.clone(), EngineConfig::from(&cfg.engine))
        .with_metrics(metrics.clone());
    let catalog = MenuCatalog::new(store.clone());
    let carts = CartService::new(store.clone(), orders.clone());
    let payments = PaymentListener::new(orders.clone()).with_metrics(metrics.clone());

    // === 4. Seed two vendors ===
    let chaat = catalog.register_vendor("Chaat Corner").await?;
    let dosa = catalog.register_vendor("Dosa Point").await?;
    let pani_puri = catalog
        .add_menu_item(chaat.id, "Pani Puri", Some("Six puris"), Money::from_minor(50))
        .await?;
    catalog.add_menu_item(chaat.id, "Bhel", None, Money::from_minor(40)).await?;
    let masala_dosa = catalog
        .add_menu_item(dosa.id, "Masala Dosa", None, Money::from_minor(100))
        .await?;

    for vendor in catalog.list_vendors().await? {
        let menu = catalog.vendor_menu(vendor.id, true).await?;
        tracing::info!(vendor = %vendor.name, items = menu.len(), "Menu loaded");
    }

    // === 5. Cart and checkout ===
    let customer_id = Uuid::new_v4();
    carts.add(customer_id, pani_puri.id, 2).await?;
    carts.add(customer_id, masala_dosa.id, 1).await?;
    let summary = carts.summary(customer_id).await?;
    tracing::info!(lines = summary.lines.len(), total = %summary.total, "Cart ready");

    let order_id = carts.checkout(customer_id).await?;
    orders.attach_payment_reference(order_id, &format!("pay_{}", order_id.simple())).await?;

    // === 6. Payment notification, delivered twice ===
    let payload = serde_json::json!({ "event": "payment.captured", "order_id": order_id }).to_string();
    for delivery in 1..=2 {
        let outcome = payments.handle_payload(&payload).await?;
        tracing::info!(delivery, ?outcome, "Payment notification handled");
    }

    // === 7. Both vendors mark ready at the same time ===
    let (a, b) = tokio::join!(
        orders.mark_vendor_status(order_id, chaat.id, VendorStatus::Ready),
        orders.mark_vendor_status(order_id, dosa.id, VendorStatus::Ready),
    );
    let (after_chaat, after_dosa) = (a?, b?);
    tracing::info!(chaat = %after_chaat, dosa = %after_dosa, "Vendors marked ready");

    for vendor_id in [chaat.id, dosa.id] {
        let status = orders.mark_vendor_status(order_id, vendor_id, VendorStatus::PickedUp).await?;
        tracing::info!(vendor_id = %vendor_id, overall = %status, "Vendor handed over");
    }

    let view = orders.get_order_view(order_id).await?;
    tracing::info!(
        order_id = %view.order_id,
        status = %view.overall_status,
        total = %view.total,
        "✅ Order complete"
    );

    for envelope in orders.get_order_history(order_id).await? {
        tracing::debug!(seq = envelope.sequence_number, event = %envelope.event_type, "Journal");
    }

    if cfg.metrics.enabled {
        tracing::info!("Metrics available on port {}; press Ctrl-C to exit", cfg.metrics.port);
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("🎉 Demo complete!");
    Ok(())
}

async fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Persistence>> {
    match cfg.store.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = cfg
                .store
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.database_url is required for the postgres backend"))?;
            let max_connections = cfg.store.max_connections;

            tracing::info!("Connecting to PostgreSQL...");
            let retry = RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
            };
            let store = retry_with_backoff(retry, |_attempt| PostgresStore::connect(url, max_connections))
                .await
                .into_result()?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
