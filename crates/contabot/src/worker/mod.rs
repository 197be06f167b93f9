pub mod error;
pub mod job;
pub mod pipeline;
pub mod scheduler;

pub use error::{JobStoreError, PipelineError, WorkerError};
pub use job::{AttachmentKind, Job, JobStatus, NewJob};
pub use pipeline::JobPipeline;
pub use scheduler::{CycleReport, RetryBackoff, WorkerLoop, WorkerSettings};
