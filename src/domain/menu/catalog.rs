use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::Money;
use crate::store::Persistence;
use super::{MenuError, MenuItem, Vendor};

/// Browse and maintain vendor menus.
#[derive(Clone)]
pub struct MenuCatalog {
    store: Arc<dyn Persistence>,
}

impl MenuCatalog {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    pub async fn register_vendor(&self, name: &str) -> Result<Vendor, MenuError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MenuError::Validation("vendor name cannot be empty".into()));
        }

        let vendor = Vendor::new(name);
        self.store.save_vendor(&vendor).await?;

        tracing::info!(vendor_id = %vendor.id, name = %vendor.name, "Vendor registered");
        Ok(vendor)
    }

    pub async fn add_menu_item(
        &self,
        vendor_id: Uuid,
        name: &str,
        description: Option<&str>,
        price: Money,
    ) -> Result<MenuItem, MenuError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MenuError::Validation("menu item name cannot be empty".into()));
        }
        if price.is_negative() {
            return Err(MenuError::Validation(format!("price must be non-negative, got {}", price)));
        }

        if self.store.vendor(vendor_id).await?.is_none() {
            return Err(MenuError::VendorNotFound(vendor_id));
        }

        let mut item = MenuItem::new(vendor_id, name, price);
        if let Some(description) = description {
            item = item.with_description(description);
        }
        self.store.save_menu_item(&item).await?;

        tracing::info!(
            vendor_id = %vendor_id,
            menu_item_id = %item.id,
            price = %item.price,
            "Menu item added"
        );
        Ok(item)
    }

    pub async fn list_vendors(&self) -> Result<Vec<Vendor>, MenuError> {
        Ok(self.store.vendors().await?)
    }

    pub async fn vendor_menu(&self, vendor_id: Uuid, only_available: bool) -> Result<Vec<MenuItem>, MenuError> {
        if self.store.vendor(vendor_id).await?.is_none() {
            return Err(MenuError::VendorNotFound(vendor_id));
        }

        let mut items = self.store.vendor_menu(vendor_id).await?;
        if only_available {
            items.retain(|item| item.available);
        }
        Ok(items)
    }

    /// Toggle availability. Only the vendor owning the item may do this.
    pub async fn set_availability(
        &self,
        vendor_id: Uuid,
        menu_item_id: Uuid,
        available: bool,
    ) -> Result<MenuItem, MenuError> {
        let mut item = self
            .store
            .menu_item(menu_item_id)
            .await?
            .ok_or(MenuError::MenuItemNotFound(menu_item_id))?;

        if item.vendor_id != vendor_id {
            tracing::warn!(
                vendor_id = %vendor_id,
                menu_item_id = %menu_item_id,
                "Availability change rejected: vendor does not own item"
            );
            return Err(MenuError::NotOwner { vendor_id, menu_item_id });
        }

        if item.available != available {
            self.store.set_menu_item_available(menu_item_id, available).await?;
            item.available = available;
            tracing::info!(menu_item_id = %menu_item_id, available, "Menu item availability changed");
        }

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn catalog() -> MenuCatalog {
        MenuCatalog::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_vendor_menu_filters_unavailable_items() {
        let catalog = catalog();
        let vendor = catalog.register_vendor("Nescafe Booth").await.unwrap();
        let coffee = catalog.add_menu_item(vendor.id, "Cold Coffee", None, Money(6000)).await.unwrap();
        catalog.add_menu_item(vendor.id, "Maggi", Some("Masala"), Money(4000)).await.unwrap();

        catalog.set_availability(vendor.id, coffee.id, false).await.unwrap();

        let all = catalog.vendor_menu(vendor.id, false).await.unwrap();
        let available = catalog.vendor_menu(vendor.id, true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, "Maggi");
        assert_eq!(available[0].description.as_deref(), Some("Masala"));
    }

    #[tokio::test]
    async fn test_only_owner_can_toggle_availability() {
        let catalog = catalog();
        let owner = catalog.register_vendor("Juice Corner").await.unwrap();
        let other = catalog.register_vendor("Tea Stall").await.unwrap();
        let item = catalog.add_menu_item(owner.id, "Mosambi", None, Money(3000)).await.unwrap();

        let result = catalog.set_availability(other.id, item.id, false).await;
        assert!(matches!(result, Err(MenuError::NotOwner { .. })));

        let menu = catalog.vendor_menu(owner.id, true).await.unwrap();
        assert_eq!(menu.len(), 1);
    }

    #[tokio::test]
    async fn test_add_item_rejects_unknown_vendor_and_negative_price() {
        let catalog = catalog();
        let missing = Uuid::new_v4();
        assert!(matches!(
            catalog.add_menu_item(missing, "Vada Pav", None, Money(1500)).await,
            Err(MenuError::VendorNotFound(id)) if id == missing
        ));

        let vendor = catalog.register_vendor("Canteen").await.unwrap();
        assert!(matches!(
            catalog.add_menu_item(vendor.id, "Refund", None, Money(-1)).await,
            Err(MenuError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_list_vendors_sorted_by_name() {
        let catalog = catalog();
        catalog.register_vendor("Zaika").await.unwrap();
        catalog.register_vendor("Amul Parlour").await.unwrap();

        let names: Vec<_> = catalog.list_vendors().await.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["Amul Parlour", "Zaika"]);
    }
}
