use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FrontierError, Result};
use crate::uri::CrawlUri;

pub const DEFAULT_QUEUE_PRECEDENCE: i32 = 3;
pub const DEFAULT_URI_PRECEDENCE: i32 = 1;

/// Point in a URI's life at which its queue's provider is told about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Scheduled,
    Succeeded,
    Disregarded,
    Failed,
    Retried,
}

/// Per-queue source of scheduling precedence. Lower is more urgent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PrecedenceProvider {
    Simple {
        base: i32,
    },
    /// Base plus the most urgent URI precedence still enqueued.
    HighestUri {
        base: i32,
        enqueued: BTreeMap<i32, u64>,
    },
    /// Precedence sinks by one each time the success count passes the next
    /// increment. Only moves on re-evaluation.
    SuccessCounts {
        base: i32,
        increments: Vec<u64>,
        successes: u64,
        current: i32,
    },
}

impl PrecedenceProvider {
    pub fn precedence(&self) -> i32 {
        match self {
            PrecedenceProvider::Simple { base } => *base,
            PrecedenceProvider::HighestUri { base, enqueued } => {
                let delta = enqueued.keys().next().copied().unwrap_or(0);
                base + delta
            }
            PrecedenceProvider::SuccessCounts { current, .. } => *current,
        }
    }

    pub fn tally(&mut self, uri_precedence: i32, stage: Stage) {
        match self {
            PrecedenceProvider::Simple { .. } => {}
            PrecedenceProvider::HighestUri { enqueued, .. } => match stage {
                Stage::Scheduled => {
                    *enqueued.entry(uri_precedence).or_insert(0) += 1;
                }
                Stage::Succeeded | Stage::Disregarded | Stage::Failed => {
                    if let Some(count) = enqueued.get_mut(&uri_precedence) {
                        *count -= 1;
                        if *count == 0 {
                            enqueued.remove(&uri_precedence);
                        }
                    }
                }
                Stage::Retried => {}
            },
            PrecedenceProvider::SuccessCounts { successes, .. } => {
                if stage == Stage::Succeeded {
                    *successes += 1;
                }
            }
        }
    }

    /// Recompute any precedence that only changes between sessions.
    pub fn reevaluate(&mut self) {
        if let PrecedenceProvider::SuccessCounts {
            base,
            increments,
            successes,
            current,
        } = self
        {
            *current = success_counts_precedence(*base, increments, *successes);
        }
    }

    pub fn report_fragment(&self) -> String {
        match self {
            PrecedenceProvider::Simple { base } => format!("{}", base),
            PrecedenceProvider::HighestUri { enqueued, .. } => {
                let counts: Vec<String> = enqueued
                    .iter()
                    .map(|(p, n)| format!("p{}:{}", p, n))
                    .collect();
                format!("{} [{}]", self.precedence(), counts.join(" "))
            }
            PrecedenceProvider::SuccessCounts { successes, .. } => {
                format!("{} ({} ok)", self.precedence(), successes)
            }
        }
    }
}

fn success_counts_precedence(base: i32, increments: &[u64], successes: u64) -> i32 {
    let mut precedence = base - 1;
    let mut iter = increments.iter();
    let mut increment = match iter.next() {
        Some(inc) => *inc as i64,
        None => return base,
    };
    let mut remaining = successes as i64;
    while remaining >= 0 {
        remaining -= increment.max(1);
        precedence += 1;
        if let Some(next) = iter.next() {
            increment = *next as i64;
        }
    }
    precedence
}

/// Which provider a new queue gets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePrecedencePolicy {
    Base { base: i32 },
    HighestUri { base: i32 },
    SuccessCounts { base: i32, increments: String },
}

impl Default for QueuePrecedencePolicy {
    fn default() -> Self {
        QueuePrecedencePolicy::Base {
            base: DEFAULT_QUEUE_PRECEDENCE,
        }
    }
}

impl QueuePrecedencePolicy {
    pub fn provider(&self) -> Result<PrecedenceProvider> {
        Ok(match self {
            QueuePrecedencePolicy::Base { base } => PrecedenceProvider::Simple { base: *base },
            QueuePrecedencePolicy::HighestUri { base } => PrecedenceProvider::HighestUri {
                base: *base,
                enqueued: BTreeMap::new(),
            },
            QueuePrecedencePolicy::SuccessCounts { base, increments } => {
                let increments = parse_increments(increments)?;
                PrecedenceProvider::SuccessCounts {
                    base: *base,
                    current: success_counts_precedence(*base, &increments, 0),
                    increments,
                    successes: 0,
                }
            }
        })
    }
}

pub(crate) fn parse_increments(counts: &str) -> Result<Vec<u64>> {
    let parsed: std::result::Result<Vec<u64>, _> = counts
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>())
        .collect();
    match parsed {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(FrontierError::config(format!(
            "bad success-count increments '{}'",
            counts
        ))),
    }
}

/// How a URI's own precedence is set when it is scheduled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UriPrecedencePolicy {
    Base { precedence: i32 },
    /// Precedence equals the URI's cost.
    Cost,
    Hops { base: i32, nav_links_only: bool },
}

impl Default for UriPrecedencePolicy {
    fn default() -> Self {
        UriPrecedencePolicy::Base {
            precedence: DEFAULT_URI_PRECEDENCE,
        }
    }
}

impl UriPrecedencePolicy {
    pub fn uri_scheduled(&self, curi: &mut CrawlUri) {
        curi.precedence = match self {
            UriPrecedencePolicy::Base { precedence } => *precedence,
            UriPrecedencePolicy::Cost => curi.holder_cost.unwrap_or(1),
            UriPrecedencePolicy::Hops {
                base,
                nav_links_only,
            } => {
                let hops = if *nav_links_only {
                    curi.link_hops()
                } else {
                    curi.path_from_seed.len()
                };
                base + hops as i32
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_uri_follows_most_urgent_enqueued() {
        let mut p = QueuePrecedencePolicy::HighestUri { base: 1 }.provider().unwrap();
        assert_eq!(p.precedence(), 1);
        p.tally(5, Stage::Scheduled);
        p.tally(2, Stage::Scheduled);
        assert_eq!(p.precedence(), 3);
        p.tally(2, Stage::Retried);
        assert_eq!(p.precedence(), 3);
        p.tally(2, Stage::Succeeded);
        assert_eq!(p.precedence(), 6);
    }

    #[test]
    fn success_counts_sink_on_reevaluation() {
        let mut p = QueuePrecedencePolicy::SuccessCounts {
            base: 3,
            increments: "2,5".to_owned(),
        }
        .provider()
        .unwrap();
        assert_eq!(p.precedence(), 3);
        p.tally(0, Stage::Succeeded);
        p.tally(0, Stage::Succeeded);
        assert_eq!(p.precedence(), 3);
        p.reevaluate();
        assert_eq!(p.precedence(), 4);
        for _ in 0..5 {
            p.tally(0, Stage::Succeeded);
        }
        p.reevaluate();
        assert_eq!(p.precedence(), 5);
    }

    #[test]
    fn bad_increments_rejected() {
        let policy = QueuePrecedencePolicy::SuccessCounts {
            base: 3,
            increments: "x".to_owned(),
        };
        assert!(policy.provider().is_err());
    }

    #[test]
    fn hops_uri_precedence() {
        let mut curi = CrawlUri::new("http://a.example/").unwrap();
        curi.path_from_seed = "LLE".to_owned();
        UriPrecedencePolicy::Hops { base: 1, nav_links_only: true }.uri_scheduled(&mut curi);
        assert_eq!(curi.precedence, 3);
        UriPrecedencePolicy::Hops { base: 1, nav_links_only: false }.uri_scheduled(&mut curi);
        assert_eq!(curi.precedence, 4);
    }
}
