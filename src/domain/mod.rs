// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// - order: fulfillment state machine across an order's vendors
// - menu: vendors, menu items and availability
// - cart: per-customer cart context and checkout
//
// Storage is reached only through the traits in crate::store.
//
// ============================================================================

pub mod order;
pub mod menu;
pub mod cart;
