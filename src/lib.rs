pub mod config;
pub mod daemon;
pub mod error;
pub mod job;
pub mod jobs;
pub mod node;
pub mod process;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{QueueError, Result};
