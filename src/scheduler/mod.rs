pub mod assigner;
pub mod job;
pub mod queue;

pub use assigner::{Assignment, CycleOutcome, Scheduler};
pub use job::{Job, JobSpec, JobState};
pub use queue::{AgingPolicy, JobQueue};
