pub mod client;
pub mod error;
pub mod submission;
pub mod types;

pub use client::{GenerationBackend, HttpBackend};
pub use error::SubmitError;
pub use submission::SubmissionClient;
pub use types::{ClientMetrics, Submission};
