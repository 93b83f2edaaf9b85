//! Worker process handle and pipe plumbing.

mod handle;
#[cfg(any(test, feature = "test-support"))]
mod harness;
mod process;

pub use handle::{OutputChunk, WorkerHandle, WorkerStatus};
#[cfg(any(test, feature = "test-support"))]
pub use harness::WorkerHarness;
pub use process::{WorkerProcess, spawn_worker};
