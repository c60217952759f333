pub mod context;
pub mod document;
pub mod property;
pub mod registry;
pub mod state;

pub use context::JobContext;
pub use document::{
    args_hash, project_of, Enqueued, JobDocument, JobId, LastError, LockInfo, NewJob, Origin,
};
pub use property::{JobOverrides, JobProperties};
pub use registry::{Job, JobError, JobFactory, JobRegistry, JobType};
pub use state::JobState;
