mod config;
mod error;
mod journal;
mod stats;
mod util;

pub mod frontier;
pub mod policy;
pub mod status;
pub mod storage;
pub mod uniq;
pub mod uri;

// (Re) Exports
pub use config::{Config, StoreKind};
pub use error::{FrontierError, Result};
pub use frontier::{
    ConsistencyReport, Frontier, FrontierBuilder, ImportParams, ImportSummary, QueueCounts,
    QueueState, Scope, State, WorkQueue, WorkQueueFrontier,
};
pub use journal::{parse_line, FrontierJournal, JournalTag, JOURNAL_FILENAME};
pub use stats::{CounterSnapshot, Stats};
pub use uri::{canonicalize, BudgetOverride, CrawlUri, Hop, SchedulingDirective};

/// A frontier with every collaborator chosen by `config`.
pub fn frontier(config: Config) -> Result<WorkQueueFrontier> {
    WorkQueueFrontier::new(config)
}
