use std::fmt::Write;

use chrono::Utc;

use crate::frontier::lifecycle::QueueState;
use crate::frontier::work_queue::WorkQueue;
use crate::frontier::{lock_queue, WorkQueueFrontier};
use crate::util;

/// Queue counts per lifecycle bucket at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub total: usize,
    pub in_process: usize,
    pub ready: usize,
    pub snoozed: usize,
    pub inactive: usize,
    pub ineligible: usize,
    pub retired: usize,
    pub exhausted: usize,
}

impl QueueCounts {
    pub fn active(&self) -> usize {
        self.in_process + self.ready + self.snoozed
    }
}

impl WorkQueueFrontier {
    /// Copy of the queue for `class_key`, if one exists.
    pub fn work_queue(&self, class_key: &str) -> Option<WorkQueue> {
        self.existing_queue(class_key)
            .map(|queue| lock_queue(&queue).clone())
    }

    /// Lifecycle collection the queue sits on, or `None` for an unknown key.
    pub fn queue_state(&self, class_key: &str) -> Option<QueueState> {
        let lc = self.lock_lifecycle();
        self.existing_queue(class_key)?;
        Some(lc.state_of(class_key))
    }

    pub fn queue_counts(&self) -> QueueCounts {
        let lc = self.lock_lifecycle();
        let total = self.queues.read().unwrap_or_else(|e| e.into_inner()).len();
        let floor = self.config.precedence_floor;
        let mut counts = QueueCounts {
            total,
            in_process: lc.in_process.len(),
            ready: lc.ready.len(),
            snoozed: lc.snoozed_count(),
            inactive: lc.eligible_inactive_count(floor),
            ineligible: lc.ineligible_inactive_count(floor),
            retired: lc.retired.len(),
            exhausted: 0,
        };
        counts.exhausted = total.saturating_sub(
            counts.active() + counts.inactive + counts.ineligible + counts.retired,
        );
        counts
    }

    pub fn single_line_report(&self) -> String {
        let c = self.queue_counts();
        format!(
            "{} URI queues: {} active ({} in-process; {} ready; {} snoozed); \
             {} inactive; {} ineligible; {} retired; {} exhausted [{}]",
            c.total,
            c.active(),
            c.in_process,
            c.ready,
            c.snoozed,
            c.inactive,
            c.ineligible,
            c.retired,
            c.exhausted,
            self.state(),
        )
    }

    /// Queued URIs per queue that is active or waiting to be.
    pub fn average_depth(&self) -> f64 {
        let c = self.queue_counts();
        let queues = c.active() + c.inactive;
        if queues == 0 {
            0.0
        } else {
            self.queued_uri_count() as f64 / queues as f64
        }
    }

    /// Queues that could be served per queue actually being served.
    pub fn congestion_ratio(&self) -> f64 {
        let c = self.queue_counts();
        let serving = c.in_process + c.snoozed;
        if serving == 0 {
            0.0
        } else {
            (c.active() + c.inactive) as f64 / serving as f64
        }
    }

    /// Size of the longest queue, or -1 with no queues.
    pub fn deepest_uri(&self) -> i64 {
        self.longest_queues(1)
            .first()
            .map(|(_, count)| *count)
            .unwrap_or(-1)
    }

    /// Up to `n` non-retired queues with the most items, longest first.
    pub fn longest_queues(&self, n: usize) -> Vec<(String, i64)> {
        let mut sizes: Vec<(String, i64)> = self
            .all_queues()
            .iter()
            .filter_map(|queue| {
                let wq = lock_queue(queue);
                if wq.is_retired() || wq.count() == 0 {
                    None
                } else {
                    Some((wq.class_key().to_owned(), wq.count()))
                }
            })
            .collect();
        sizes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sizes.truncate(n);
        sizes
    }

    pub fn discovered_uri_count(&self) -> u64 {
        self.uniq.count()
    }

    pub fn finished_uri_count(&self) -> u64 {
        self.stats.finished_uri_count()
    }

    /// Totals, queue counts and one section of queue lines per lifecycle
    /// collection.
    pub fn standard_report(&self) -> String {
        let mut out = String::new();
        let c = self.queue_counts();
        let _ = writeln!(out, "Frontier report - {}", Utc::now().format("%Y%m%d%H%M%S"));
        let _ = writeln!(out, "\n -----===== STATS =====-----");
        let _ = writeln!(out, " Discovered:    {}", self.discovered_uri_count());
        let _ = writeln!(out, " Queued:        {}", self.queued_uri_count());
        let _ = writeln!(out, " Finished:      {}", self.finished_uri_count());
        let _ = writeln!(out, "  Successfully: {}", self.succeeded_fetch_count());
        let _ = writeln!(out, "  Failed:       {}", self.failed_fetch_count());
        let _ = writeln!(out, "  Disregarded:  {}", self.disregarded_uri_count());
        let _ = writeln!(
            out,
            "  Rate:         {} URIs/min, {} bytes/min",
            self.stats.succeeded_per_minute(),
            self.stats.bytes_per_minute()
        );

        let (inactive_tiers, keys) = {
            let lc = self.lock_lifecycle();
            let tiers: Vec<String> = lc
                .inactive
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(p, q)| format!("p{}: {}", p, q.len()))
                .collect();
            let mut in_process: Vec<String> = lc.in_process.iter().cloned().collect();
            in_process.sort();
            let inactive: Vec<String> = lc.inactive.values().flatten().cloned().collect();
            let sections = vec![
                ("IN-PROCESS", in_process),
                ("READY", lc.ready.iter().cloned().collect()),
                ("SNOOZED", lc.snoozed_keys()),
                ("INACTIVE", inactive),
                ("RETIRED", lc.retired.iter().cloned().collect()),
            ];
            (tiers, sections)
        };

        let _ = writeln!(out, "\n -----===== QUEUES =====-----");
        let _ = writeln!(out, " Already included size:     {}", self.uniq.count());
        let _ = writeln!(out, "               pending:     {}", self.uniq.pending());
        let _ = writeln!(out, "\n All class queues map size: {}", c.total);
        let _ = writeln!(out, "             Active queues: {}", c.active());
        let _ = writeln!(out, "                    In-process: {}", c.in_process);
        let _ = writeln!(out, "                         Ready: {}", c.ready);
        let _ = writeln!(out, "                       Snoozed: {}", c.snoozed);
        let _ = writeln!(
            out,
            "           Inactive queues: {} ({})",
            c.inactive,
            inactive_tiers.join("; ")
        );
        let _ = writeln!(out, "         Ineligible queues: {}", c.ineligible);
        let _ = writeln!(out, "            Retired queues: {}", c.retired);
        let _ = writeln!(out, "          Exhausted queues: {}", c.exhausted);
        let _ = writeln!(out, "\n             Last state: {}", self.state());

        let longest = self.longest_queues(5);
        let _ = writeln!(out, "\n -----===== {} LONGEST QUEUES =====-----", longest.len());
        for (key, count) in longest {
            let _ = writeln!(out, " {} ({})", key, count);
        }

        let now = util::now_ms();
        for (title, keys) in keys {
            let _ = writeln!(out, "\n -----===== {} QUEUES =====-----", title);
            self.append_queue_lines(&mut out, &keys, now);
        }
        out
    }

    /// One line for every queue holding items.
    pub fn all_nonempty_report(&self) -> String {
        let mut keys: Vec<String> = self
            .all_queues()
            .iter()
            .filter_map(|queue| {
                let wq = lock_queue(queue);
                if wq.count() > 0 {
                    Some(wq.class_key().to_owned())
                } else {
                    None
                }
            })
            .collect();
        keys.sort();
        let mut out = String::new();
        self.append_queue_lines(&mut out, &keys, util::now_ms());
        out
    }

    fn append_queue_lines(&self, out: &mut String, keys: &[String], now: i64) {
        let _ = writeln!(out, " {}", WorkQueue::short_report_legend());
        let max = self.config.report_max_queues;
        for key in keys.iter().take(max) {
            if let Some(queue) = self.existing_queue(key) {
                let _ = writeln!(out, " {}", lock_queue(&queue).short_report_line(now));
            }
        }
        if keys.len() > max {
            let _ = writeln!(out, " ...and {} more.", keys.len() - max);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::frontier::WorkQueueFrontier;
    use crate::uri::CrawlUri;

    fn frontier(report_max_queues: usize) -> WorkQueueFrontier {
        WorkQueueFrontier::new(Config {
            recovery_log_enabled: false,
            report_max_queues,
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn single_line_counts_buckets() {
        let f = frontier(10);
        for host in ["a", "b", "c"] {
            f.schedule(CrawlUri::new(&format!("http://{}.example/", host)).unwrap())
                .unwrap();
        }
        f.schedule(CrawlUri::new("http://a.example/2").unwrap()).unwrap();
        assert_eq!(
            f.single_line_report(),
            "3 URI queues: 0 active (0 in-process; 0 ready; 0 snoozed); \
             3 inactive; 0 ineligible; 0 retired; 0 exhausted [PAUSE]"
        );
        let _curi = f.find_eligible_uri().unwrap().unwrap();
        let c = f.queue_counts();
        assert_eq!(c.in_process, 1);
        assert_eq!(c.inactive, 2);
        assert_eq!(f.deepest_uri(), 2);
        assert_eq!(f.longest_queues(1)[0].0, "a.example");
        assert_eq!(f.discovered_uri_count(), 4);
        assert!((f.average_depth() - 4.0 / 3.0).abs() < 1e-9);
        assert!((f.congestion_ratio() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn standard_report_caps_sections() {
        let f = frontier(1);
        for host in ["a", "b", "c"] {
            f.schedule(CrawlUri::new(&format!("http://{}.example/", host)).unwrap())
                .unwrap();
        }
        let report = f.standard_report();
        assert!(report.contains("Inactive queues: 3 (p3: 3)"));
        assert!(report.contains(" -----===== INACTIVE QUEUES =====-----"));
        assert!(report.contains(" ...and 2 more."));
        assert!(report.contains(" a.example 3 1 1 "));
        assert_eq!(f.all_nonempty_report().lines().count(), 3);
    }
}
