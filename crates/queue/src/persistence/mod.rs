//! Persistence layer: JobStore trait and implementations

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{
    CompletionOutcome, FailureOutcome, JobStore, LockedJob, NewJob, StageMessage, StoreError,
};
