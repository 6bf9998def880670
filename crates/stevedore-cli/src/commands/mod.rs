//! CLI commands

mod failed;
mod queue;
mod work;

pub use failed::{flush_failed, forget_failed, list_failed, retry_failed};
pub use queue::{clear, setup, size, ConnectionArgs, QueueArgs};
pub use work::{run_next, work, RunNextArgs, WorkArgs};
