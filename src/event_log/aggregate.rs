use uuid::Uuid;
use super::envelope::EventEnvelope;

// ============================================================================
// Aggregate Root Pattern
// ============================================================================
//
// Current state lives in tables; the journal records how it got there.
// Commands are validated against the loaded state and turned into events,
// and the same events are applied to the state before it is written back.
//
// ============================================================================

/// Aggregate that turns commands into journaled events
///
/// Type Parameters:
/// - `Event`: The domain event type for this aggregate
/// - `Command`: The command type for this aggregate
/// - `Error`: The error type for business rule violations
pub trait Aggregate: Sized + Send + Sync {
    type Event;
    type Command;
    type Error;

    /// Create the aggregate from the first journal entry
    fn apply_first_event(event: &Self::Event) -> Result<Self, Self::Error>;

    /// Apply a subsequent event to update state
    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Handle command and emit events (business logic, no side effects)
    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn aggregate_id(&self) -> Uuid;

    /// Number of journal entries reflected in this state
    fn version(&self) -> i64;

    /// Rebuild state from a journal. `None` for an empty journal.
    fn replay(events: &[EventEnvelope<Self::Event>]) -> Result<Option<Self>, Self::Error> {
        let Some((first, rest)) = events.split_first() else {
            return Ok(None);
        };

        let mut aggregate = Self::apply_first_event(&first.event_data)?;
        for envelope in rest {
            aggregate.apply_event(&envelope.event_data)?;
        }

        Ok(Some(aggregate))
    }
}
