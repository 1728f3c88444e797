// ============================================================================
// Transaction Module
// ============================================================================
//
// All-or-nothing write batches over the keyed state store. One transaction
// is active per store at a time; the partition's processor is its only
// writer.
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::Change;
pub use state::{Transaction, TransactionId, TransactionState};
