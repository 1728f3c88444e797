pub mod appliers;
pub mod context;
pub mod handlers;
pub mod metrics;
pub mod outcome;
pub mod processor;
pub mod scheduled;

pub use appliers::EventAppliers;
pub use context::ProcessingContext;
pub use handlers::{CommandHandlers, CommandProcessor, FORWARDED_REQUEST_STREAM};
pub use metrics::ProcessingMetrics;
pub use outcome::{CommandError, PostCommitTask, ProcessedCommand, ProcessingOutcome, Rejection};
pub use processor::{LOG_DIR, ProcessingRun, STATE_DIR, StreamProcessor};
pub use scheduled::ScheduledSweep;
