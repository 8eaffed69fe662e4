pub mod envelope;
pub mod execution;
pub mod job;

pub use envelope::DispatchEnvelope;
pub use execution::{Execution, ExecutionLog, ExecutionOutcome, ExecutionStatus, LogLevel};
pub use job::{
    Job, JobFilter, JobKind, JobPatch, JobStatus, NewJob, Page, PageRequest, Schedule, SortField,
    SortOrder,
};
