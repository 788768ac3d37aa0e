//! Verification tasks: storage, execution, batching, and cancellation.

mod batch;
mod cancel;
mod engine;
mod store;
mod sweeper;
mod types;

pub use batch::{BatchCoordinator, BatchItem, BatchResult};
pub use cancel::{CancelResult, CancellationRegistry};
pub use engine::{EngineError, TaskEngine, CANCEL_REQUESTED_STEP};
pub use store::{InMemoryTaskStore, SharedTaskStore, StoreError, TaskStore};
pub use sweeper::start_sweeper;
pub use types::{TaskOutcome, TaskRecord, TaskResultView, TaskStatus, TaskView};
