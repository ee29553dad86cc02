mod outcome;
mod summary;

pub use outcome::{ItemOutcome, ItemStatus};
pub use summary::{write_summary, RunSummary};
