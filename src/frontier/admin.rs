use std::fmt;

use regex::Regex;

use crate::error::Result;
use crate::frontier::{lock_queue, WorkQueueFrontier};

/// Findings of [`WorkQueueFrontier::consistency_check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// States the frontier cannot recover from by itself, such as a queue
    /// holding items while sitting on no lifecycle collection.
    pub anomalies: Vec<String>,
    /// Redundant memberships and similar states that heal on their own.
    pub concerns: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} anomalies, {} concerns",
            self.anomalies.len(),
            self.concerns.len()
        )?;
        for anomaly in self.anomalies.iter() {
            writeln!(f, " ANOMALY {}", anomaly)?;
        }
        for concern in self.concerns.iter() {
            writeln!(f, " concern {}", concern)?;
        }
        Ok(())
    }
}

impl WorkQueueFrontier {
    /// Delete every queued URI matching `uri_regex` from the queues whose
    /// class key matches `queue_regex`. Both patterns must match the whole
    /// string. Heads currently in process are spared.
    ///
    /// Returns the number of URIs deleted.
    pub fn delete_uris(&self, queue_regex: &str, uri_regex: &str) -> Result<i64> {
        let queue_pattern = Regex::new(&format!("^(?:{})$", queue_regex))?;
        let uri_pattern = Regex::new(&format!("^(?:{})$", uri_regex))?;

        let _lc = self.lock_lifecycle();
        let mut total = 0;
        for queue in self.all_queues() {
            let mut wq = lock_queue(&queue);
            if !queue_pattern.is_match(wq.class_key()) {
                continue;
            }
            let deleted = wq.delete_matching(self.store.as_ref(), &uri_pattern)?;
            if deleted > 0 {
                log::info!("deleted {} URIs from {}", deleted, wq.class_key());
            }
            if !wq.is_retired() {
                self.stats.decr_queued(deleted);
            }
            total += deleted;
        }
        Ok(total)
    }

    /// Give every retired queue another chance. Queues still over their
    /// total budget retire again when next activated.
    pub fn reconsider_retired_queues(&self) {
        let mut lc = self.lock_lifecycle();
        let retired: Vec<String> = lc.retired.drain(..).collect();
        for class_key in retired {
            match self.existing_queue(&class_key) {
                Some(queue) => {
                    let mut wq = lock_queue(&queue);
                    self.unretire(&mut lc, &mut wq);
                }
                None => log::error!("retired queue {} missing from queue map", class_key),
            }
        }
    }

    /// Wake every snoozed queue now, whatever its wake time. Returns the
    /// number woken.
    pub fn force_wake_queues(&self) -> usize {
        let mut lc = self.lock_lifecycle();
        let snoozed = lc.take_all_snoozed();
        let woken = snoozed.len();
        for class_key in snoozed {
            match self.existing_queue(&class_key) {
                Some(queue) => {
                    let mut wq = lock_queue(&queue);
                    wq.wake_time = 0;
                    self.reenqueue(&mut lc, &mut wq);
                }
                None => log::error!("snoozed queue {} missing from queue map", class_key),
            }
        }
        if woken > 0 {
            log::info!("force-woke {} queues", woken);
        }
        woken
    }

    /// Check that every queue with items sits on exactly one lifecycle
    /// collection and that the queued count matches the queues.
    pub fn consistency_check(&self) -> ConsistencyReport {
        let _disposition = self.disposition.write().unwrap_or_else(|e| e.into_inner());
        let lc = self.lock_lifecycle();
        let mut report = ConsistencyReport::default();
        let mut queued = 0;

        let mut queues = self.all_queues();
        queues.sort_by_cached_key(|queue| lock_queue(queue).class_key().to_owned());
        for queue in queues {
            let wq = lock_queue(&queue);
            let key = wq.class_key();
            let marks = lc.memberships(key);
            if wq.is_retired() {
                if !marks.iter().any(|m| m == "R") {
                    report
                        .anomalies
                        .push(format!("{} is retired but not on the retired list", key));
                }
                continue;
            }
            queued += wq.count();
            if wq.count() > 0 && marks.is_empty() {
                report.anomalies.push(format!(
                    "{} holds {} items but is on no lifecycle collection",
                    key,
                    wq.count()
                ));
            }
            if marks.len() > 1 {
                report
                    .concerns
                    .push(format!("{} is on several collections [{}]", key, marks.join(",")));
            }
            if wq.count() == 0 && marks.iter().any(|m| m == "r") {
                report.concerns.push(format!("{} is ready but empty", key));
            }
        }
        if queued != self.stats.queued_uri_count() {
            report.anomalies.push(format!(
                "queues hold {} URIs but {} are counted as queued",
                queued,
                self.stats.queued_uri_count()
            ));
        }

        if report.is_clean() && report.concerns.is_empty() {
            log::info!("consistency check found nothing");
        } else {
            log::warn!("consistency check: {}", report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::frontier::{QueueState, WorkQueueFrontier};
    use crate::uri::CrawlUri;

    fn frontier() -> WorkQueueFrontier {
        WorkQueueFrontier::new(Config {
            recovery_log_enabled: false,
            ..Config::default()
        })
        .unwrap()
    }

    fn schedule(f: &WorkQueueFrontier, uri: &str) {
        f.schedule(CrawlUri::new(uri).unwrap()).unwrap();
    }

    #[test]
    fn delete_uris_matches_whole_strings() {
        let f = frontier();
        schedule(&f, "http://a.example/keep");
        schedule(&f, "http://a.example/tmp/1");
        schedule(&f, "http://a.example/tmp/2");
        schedule(&f, "http://b.example/tmp/1");
        assert_eq!(f.delete_uris("a\\.example", ".*/tmp/.*").unwrap(), 2);
        assert_eq!(f.queued_uri_count(), 2);
        assert_eq!(f.delete_uris("a", ".*").unwrap(), 0);
        assert!(f.delete_uris("(", ".*").is_err());
        assert!(f.consistency_check().is_clean());
    }

    #[test]
    fn consistency_check_flags_orphaned_queue() {
        let f = frontier();
        schedule(&f, "http://a.example/");
        assert!(f.consistency_check().is_clean());
        {
            let mut lc = f.lock_lifecycle();
            lc.inactive.clear();
        }
        let report = f.consistency_check();
        assert_eq!(report.anomalies.len(), 1);
        assert!(report.anomalies[0].starts_with("a.example holds 1 items"));
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Exhausted));
    }

    #[test]
    fn retired_queues_can_be_reconsidered() {
        let f = WorkQueueFrontier::new(Config {
            recovery_log_enabled: false,
            queue_total_budget: 1,
            ..Config::default()
        })
        .unwrap();
        schedule(&f, "http://a.example/1");
        schedule(&f, "http://a.example/2");
        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = 200;
        f.finished(curi).unwrap();
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Retired));
        assert_eq!(f.queued_uri_count(), 0);
        assert!(f.consistency_check().is_clean());

        f.reconsider_retired_queues();
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Inactive(3)));
        assert_eq!(f.queued_uri_count(), 1);
        // still over budget, so activation retires it again
        assert!(f.find_eligible_uri().unwrap().is_none());
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Retired));
    }
}
