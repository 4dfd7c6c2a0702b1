// ============================================================================
// Event Log - Journal Infrastructure
// ============================================================================
//
// Generic pieces shared by every aggregate that journals its changes:
// the Aggregate trait and the EventEnvelope written next to each state change.
// Domain-specific code is in src/domain/
//
// ============================================================================

pub mod aggregate;
pub mod envelope;

pub use aggregate::Aggregate;
pub use envelope::{deserialize_event, serialize_event, DomainEvent, EventEnvelope};
