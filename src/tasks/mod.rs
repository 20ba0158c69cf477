pub mod queue;
pub mod recompute;

pub use queue::{Enqueued, JobHandler, JobQueue, JobStatus, LocalJobQueue};
pub use recompute::{RecomputeCoordinator, RecomputeError, ResultRecomputer, RESULT_QUEUE_NAME};
