use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FrontierError, Result};
use crate::policy::precedence::parse_increments;
use crate::policy::{AssignmentConfig, CostPolicyKind, QueuePrecedencePolicy, UriPrecedencePolicy};

/// Where queue contents and the already-seen set are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Rocksdb,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds to snooze a queue after a connect-class failure before
    /// retrying its head URI.
    pub retry_delay_seconds: u64,
    /// Number of times a recoverable failure is retried before the URI is
    /// counted as failed. Counts retries, not attempts: with 3, a URI is
    /// fetched at most 4 times.
    pub max_retries: u32,
    /// Session budget a queue receives each time it is activated.
    pub balance_replenish_amount: i32,
    /// Extra expenditure charged to a queue for each failed URI.
    pub error_penalty_amount: i32,
    /// Total budget per queue. A negative value means unlimited.
    pub queue_total_budget: i64,
    /// Queues at or past this precedence are never activated.
    pub precedence_floor: i32,
    /// Park new queues as inactive rather than making them ready at once.
    pub hold_queues: bool,
    /// Snoozes longer than this are reported as long.
    pub snooze_long_ms: u64,
    /// Embeds this many hops from the last link are promoted to MEDIUM. A
    /// value of 0 disables the promotion.
    pub preference_embed_hops: usize,
    /// Write the recovery journal.
    pub recovery_log_enabled: bool,
    /// If non-empty, every URI goes to this queue.
    pub force_queue_assignment: String,
    /// Politeness delay as a multiple of the last fetch's duration.
    pub delay_factor: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Snoozed queues beyond this count go to the overflow map.
    pub max_snoozed_in_memory: usize,
    /// Maximum number of queues listed per section of a report.
    pub report_max_queues: usize,
    /// Interval between one-line summaries logged by the manager.
    pub report_interval_secs: u64,
    /// Directory to store frontier state (store, journal, checkpoints).
    pub data_dir: String,
    pub store: StoreKind,
    pub uniq: StoreKind,
    pub queue_assignment: AssignmentConfig,
    pub cost_policy: CostPolicyKind,
    pub queue_precedence: QueuePrecedencePolicy,
    pub uri_precedence: UriPrecedencePolicy,
    /// If enabled, Ctrl-C requests FINISH.
    pub handle_interrupt: bool,
}

impl Config {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.sanity_check()?;
        Ok(config)
    }

    pub fn sanity_check(&self) -> Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(FrontierError::config(
                "config.min_delay_ms cannot exceed config.max_delay_ms",
            ));
        }
        if self.delay_factor < 0.0 {
            return Err(FrontierError::config("config.delay_factor must be positive"));
        }
        if self.precedence_floor <= 0 {
            return Err(FrontierError::config("config.precedence_floor must be positive"));
        }
        if self.max_snoozed_in_memory == 0 {
            return Err(FrontierError::config(
                "config.max_snoozed_in_memory cannot be zero",
            ));
        }
        if self.queue_assignment.parallel_queues == 0 {
            return Err(FrontierError::config(
                "config.queue_assignment.parallel_queues cannot be zero",
            ));
        }
        if let QueuePrecedencePolicy::SuccessCounts { increments, .. } = &self.queue_precedence {
            parse_increments(increments)?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_delay_seconds: 900,
            max_retries: 30,
            balance_replenish_amount: 3000,
            error_penalty_amount: 100,
            queue_total_budget: -1,
            precedence_floor: 255,
            hold_queues: true,
            snooze_long_ms: 5 * 60 * 1000,
            preference_embed_hops: 1,
            recovery_log_enabled: true,
            force_queue_assignment: String::new(),
            delay_factor: 5.0,
            min_delay_ms: 3000,
            max_delay_ms: 30000,
            max_snoozed_in_memory: 10000,
            report_max_queues: 2000,
            report_interval_secs: 60,
            data_dir: "db".to_owned(),
            store: StoreKind::Memory,
            uniq: StoreKind::Memory,
            queue_assignment: AssignmentConfig::default(),
            cost_policy: CostPolicyKind::Unit,
            queue_precedence: QueuePrecedencePolicy::default(),
            uri_precedence: UriPrecedencePolicy::default(),
            handle_interrupt: false,
        }
    }
}
