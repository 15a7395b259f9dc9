//! Domain models - transactions, windows and aggregates
//!
//! - `TransactionEvent` - normalized POS transaction
//! - `Window` / `WindowKey` - tumbling window and its (store, window) slot
//! - `Accumulator` - per-window partial aggregate with fold and merge
//! - `AggregatedEvent` - record emitted when a window closes

pub mod accumulator;
pub mod aggregate;
pub mod types;

// Re-export commonly used types at module level
pub use accumulator::{Accumulator, AmountOverflow};
pub use aggregate::{AggregatedEvent, FormatError};
pub use types::{Amount, EventTime, RawMessage, TransactionEvent, Window, WindowKey};
