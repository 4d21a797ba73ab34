mod job;
mod state;

pub use job::{GenerationResult, Job, JobError, JobId, JobReport, RetryConfig};
pub use state::{JobStatus, Mutation, StateMachine, Transition};
