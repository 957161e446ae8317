//! Stateless worker invocations
//!
//! A worker is a short-lived loop, not a resident process: it is triggered,
//! runs acquisition cycles until its time budget is spent or the queue stays
//! empty, settles everything it dispatched, and exits. Crash recovery is the
//! store's lease expiry, not worker-side bookkeeping.

mod dispatch;
mod runner;

pub use dispatch::{JobProcessor, ProcessOutcome};
pub use runner::{JobWorker, WorkerConfig, WorkerRunReport, WorkerRunStats};
