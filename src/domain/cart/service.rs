use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::{LineItemInput, Money, OrderCommandHandler};
use crate::store::Persistence;
use super::{CartContext, CartError, CartLine, CartSummary};

/// Cart operations. Each change is applied by the store under the cart's
/// lock, so concurrent edits for one customer are never lost.
#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn Persistence>,
    orders: OrderCommandHandler,
}

impl CartService {
    pub fn new(store: Arc<dyn Persistence>, orders: OrderCommandHandler) -> Self {
        Self { store, orders }
    }

    /// The stored cart, or an empty one
    pub async fn load(&self, customer_id: Uuid) -> Result<CartContext, CartError> {
        Ok(self
            .store
            .load_cart(customer_id)
            .await?
            .unwrap_or_else(|| CartContext::new(customer_id)))
    }

    pub async fn set_quantity(
        &self,
        customer_id: Uuid,
        menu_item_id: Uuid,
        quantity: i32,
    ) -> Result<CartContext, CartError> {
        if quantity > 0 {
            self.ensure_orderable(menu_item_id).await?;
        }

        let cart = self
            .store
            .update_cart(customer_id, Box::new(move |cart: &mut CartContext| cart.set_quantity(menu_item_id, quantity)))
            .await?;

        tracing::debug!(
            customer_id = %customer_id,
            menu_item_id = %menu_item_id,
            quantity,
            "Cart quantity set"
        );
        Ok(cart)
    }

    pub async fn add(&self, customer_id: Uuid, menu_item_id: Uuid, quantity: i32) -> Result<CartContext, CartError> {
        self.ensure_orderable(menu_item_id).await?;

        let cart = self
            .store
            .update_cart(customer_id, Box::new(move |cart: &mut CartContext| cart.add(menu_item_id, quantity)))
            .await?;

        tracing::debug!(customer_id = %customer_id, menu_item_id = %menu_item_id, quantity, "Added to cart");
        Ok(cart)
    }

    /// Price the cart at current menu prices. Items deleted from the menu
    /// since they were added are left out.
    pub async fn summary(&self, customer_id: Uuid) -> Result<CartSummary, CartError> {
        let cart = self.load(customer_id).await?;
        let menu = self.store.menu_items(&cart.menu_item_ids()).await?;

        let mut lines = Vec::with_capacity(cart.lines.len());
        for (menu_item_id, quantity) in &cart.lines {
            let Some(item) = menu.get(menu_item_id) else {
                continue;
            };
            let line_total = item.price.checked_times(*quantity).ok_or_else(|| {
                CartError::Validation(format!("line total for {} is out of range", item.name))
            })?;
            lines.push(CartLine {
                menu_item_id: item.id,
                name: item.name.clone(),
                vendor_id: item.vendor_id,
                quantity: *quantity,
                unit_price: item.price,
                line_total,
                available: item.available,
            });
        }

        let total = Money::checked_sum(lines.iter().map(|line| line.line_total))
            .ok_or_else(|| CartError::Validation("cart total is out of range".into()))?;
        Ok(CartSummary { customer_id, lines, total })
    }

    /// Turn the cart into an order at current prices. The cart is cleared
    /// only when the order was created.
    pub async fn checkout(&self, customer_id: Uuid) -> Result<Uuid, CartError> {
        let cart = self.load(customer_id).await?;
        if cart.is_empty() {
            return Err(CartError::EmptyCart);
        }

        let menu = self.store.menu_items(&cart.menu_item_ids()).await?;
        let mut line_items = Vec::with_capacity(cart.lines.len());
        for (menu_item_id, quantity) in &cart.lines {
            let item = menu
                .get(menu_item_id)
                .ok_or(CartError::MenuItemNotFound(*menu_item_id))?;
            line_items.push(LineItemInput {
                menu_item_id: item.id,
                quantity: *quantity,
                unit_price: item.price,
            });
        }

        let order_id = self.orders.create_order(customer_id, line_items).await?;
        self.store.clear_cart(customer_id).await?;

        tracing::info!(customer_id = %customer_id, order_id = %order_id, "Cart checked out");
        Ok(order_id)
    }

    async fn ensure_orderable(&self, menu_item_id: Uuid) -> Result<(), CartError> {
        match self.store.menu_item(menu_item_id).await? {
            None => Err(CartError::MenuItemNotFound(menu_item_id)),
            Some(item) if !item.available => Err(CartError::MenuItemUnavailable(menu_item_id)),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::menu::{MenuItem, Vendor};
    use crate::domain::order::{EngineConfig, OrderError, OrderStatus};
    use crate::store::{CatalogStore, MemoryStore};

    struct Fixture {
        carts: CartService,
        orders: OrderCommandHandler,
        store: Arc<MemoryStore>,
        chai: MenuItem,
        poha: MenuItem,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tapri = Vendor::new("Tapri");
        let mess = Vendor::new("Hostel Mess");
        store.save_vendor(&tapri).await.unwrap();
        store.save_vendor(&mess).await.unwrap();

        let chai = MenuItem::new(tapri.id, "Cutting Chai", Money(1500));
        let poha = MenuItem::new(mess.id, "Poha", Money(3000));
        store.save_menu_item(&chai).await.unwrap();
        store.save_menu_item(&poha).await.unwrap();

        let orders = OrderCommandHandler::new(store.clone(), EngineConfig::default());
        let carts = CartService::new(store.clone(), orders.clone());
        Fixture { carts, orders, store, chai, poha }
    }

    #[tokio::test]
    async fn test_cart_persists_between_calls() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();

        fx.carts.add(customer, fx.chai.id, 2).await.unwrap();
        fx.carts.add(customer, fx.poha.id, 1).await.unwrap();
        fx.carts.set_quantity(customer, fx.chai.id, 3).await.unwrap();

        let summary = fx.carts.summary(customer).await.unwrap();
        assert_eq!(summary.lines.len(), 2);
        assert_eq!(summary.total, Money(3 * 1500 + 3000));

        fx.carts.set_quantity(customer, fx.poha.id, 0).await.unwrap();
        let cart = fx.carts.load(customer).await.unwrap();
        assert_eq!(cart.menu_item_ids(), vec![fx.chai.id]);
    }

    #[tokio::test]
    async fn test_unavailable_item_cannot_be_added() {
        let fx = fixture().await;
        fx.store.set_menu_item_available(fx.chai.id, false).await.unwrap();

        let result = fx.carts.add(Uuid::new_v4(), fx.chai.id, 1).await;
        assert!(matches!(result, Err(CartError::MenuItemUnavailable(_))));

        let result = fx.carts.add(Uuid::new_v4(), Uuid::new_v4(), 1).await;
        assert!(matches!(result, Err(CartError::MenuItemNotFound(_))));
    }

    #[tokio::test]
    async fn test_checkout_creates_order_and_clears_cart() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();
        fx.carts.add(customer, fx.chai.id, 2).await.unwrap();
        fx.carts.add(customer, fx.poha.id, 1).await.unwrap();

        let order_id = fx.carts.checkout(customer).await.unwrap();

        let view = fx.orders.get_order_view(order_id).await.unwrap();
        assert_eq!(view.total, Money(6000));
        assert_eq!(view.overall_status, OrderStatus::PendingPayment);
        assert_eq!(view.per_vendor_statuses.len(), 2);
        assert!(fx.carts.load(customer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_checkout_keeps_cart() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();
        fx.carts.add(customer, fx.chai.id, 1).await.unwrap();
        fx.store.set_menu_item_available(fx.chai.id, false).await.unwrap();

        let result = fx.carts.checkout(customer).await;
        assert!(matches!(result, Err(CartError::Order(OrderError::Validation(_)))));
        assert_eq!(fx.carts.load(customer).await.unwrap().quantity(fx.chai.id), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_totals_are_rejected() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();
        let mut thali = MenuItem::new(fx.poha.vendor_id, "Royal Thali", Money(i64::MAX / 2));
        fx.store.save_menu_item(&thali).await.unwrap();

        fx.carts.add(customer, thali.id, 3).await.unwrap();
        assert!(matches!(fx.carts.summary(customer).await, Err(CartError::Validation(_))));
        assert!(matches!(
            fx.carts.checkout(customer).await,
            Err(CartError::Order(OrderError::Validation(_)))
        ));
        assert_eq!(fx.carts.load(customer).await.unwrap().quantity(thali.id), 3);

        thali.price = Money(i64::MAX);
        fx.store.save_menu_item(&thali).await.unwrap();
        fx.carts.set_quantity(customer, thali.id, 1).await.unwrap();
        fx.carts.add(customer, fx.chai.id, 1).await.unwrap();
        assert!(matches!(fx.carts.summary(customer).await, Err(CartError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_for_one_customer_are_all_kept() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let carts = fx.carts.clone();
                let item = if i % 2 == 0 { fx.chai.id } else { fx.poha.id };
                tokio::spawn(async move { carts.add(customer, item, 1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let cart = fx.carts.load(customer).await.unwrap();
        assert_eq!(cart.quantity(fx.chai.id), 10);
        assert_eq!(cart.quantity(fx.poha.id), 10);
    }

    #[tokio::test]
    async fn test_rejected_edit_leaves_cart_untouched() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();
        fx.carts.add(customer, fx.chai.id, i32::MAX).await.unwrap();

        let result = fx.carts.add(customer, fx.chai.id, 1).await;
        assert!(matches!(result, Err(CartError::Validation(_))));
        assert_eq!(fx.carts.load(customer).await.unwrap().quantity(fx.chai.id), i32::MAX);
    }

    #[tokio::test]
    async fn test_empty_cart_checkout() {
        let fx = fixture().await;
        assert!(matches!(fx.carts.checkout(Uuid::new_v4()).await, Err(CartError::EmptyCart)));
    }
}
