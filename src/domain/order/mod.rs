// ============================================================================
// Order Domain - multi-vendor fulfillment
// ============================================================================
//
// - Value objects (Money, OrderStatus, VendorStatus, line items, views)
// - Events journaled with every change
// - Commands accepted on an existing order
// - Errors (OrderError)
// - Aggregate (OrderFulfillment: transition rules and status aggregation)
// - Command Handler (OrderCommandHandler: locking, persistence, queries)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod commands;
pub mod errors;
pub mod aggregate;
pub mod command_handler;

// Re-export for convenience
pub use value_objects::*;
pub use events::*;
pub use commands::*;
pub use errors::*;
pub use aggregate::*;
pub use command_handler::*;
