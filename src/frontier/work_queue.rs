use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::{PrecedenceProvider, Stage};
use crate::storage::{self, QueueStore};
use crate::uri::CrawlUri;
use crate::util;

/// Pending URIs for one class key, plus the bookkeeping that decides when
/// the queue may be served.
///
/// The items themselves live in the shared [`QueueStore`]; this struct holds
/// only scalar state and the cached head.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkQueue {
    class_key: String,
    pub(crate) active: bool,
    /// On some lifecycle collection. Cleared when found exhausted.
    pub(crate) managed: bool,
    pub(crate) retired: bool,
    count: i64,
    enqueue_count: u64,
    pub(crate) wake_time: i64,
    session_budget: i32,
    total_budget: i64,
    total_expenditure: i64,
    expenditure_at_last_activation: i64,
    last_cost: i32,
    cost_count: i64,
    error_count: u64,
    last_dequeue_time: i64,
    last_peeked: Option<String>,
    last_queued: Option<String>,
    /// Precedences of the inactive lists this key currently sits on.
    pub(crate) on_inactive_queues: BTreeSet<i32>,
    precedence: PrecedenceProvider,
    #[serde(skip)]
    peeked: Option<CrawlUri>,
}

impl WorkQueue {
    pub fn new(class_key: &str, precedence: PrecedenceProvider, total_budget: i64) -> Self {
        Self {
            class_key: class_key.to_owned(),
            active: false,
            managed: false,
            retired: false,
            count: 0,
            enqueue_count: 0,
            wake_time: 0,
            session_budget: 0,
            total_budget,
            total_expenditure: 0,
            expenditure_at_last_activation: 0,
            last_cost: 0,
            cost_count: 0,
            error_count: 0,
            last_dequeue_time: 0,
            last_peeked: None,
            last_queued: None,
            on_inactive_queues: BTreeSet::new(),
            precedence,
            peeked: None,
        }
    }

    pub fn class_key(&self) -> &str {
        &self.class_key
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn enqueue_count(&self) -> u64 {
        self.enqueue_count
    }

    pub fn wake_time(&self) -> i64 {
        self.wake_time
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn precedence(&self) -> i32 {
        self.precedence.precedence()
    }

    pub fn precedence_provider(&self) -> &PrecedenceProvider {
        &self.precedence
    }

    pub fn session_budget(&self) -> i32 {
        self.session_budget
    }

    pub fn total_budget(&self) -> i64 {
        self.total_budget
    }

    pub fn total_expenditure(&self) -> i64 {
        self.total_expenditure
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn last_cost(&self) -> i32 {
        self.last_cost
    }

    pub fn session_balance(&self) -> i64 {
        self.session_budget as i64 - (self.total_expenditure - self.expenditure_at_last_activation)
    }

    pub fn average_cost(&self) -> f64 {
        if self.cost_count == 0 {
            0.0
        } else {
            self.total_expenditure as f64 / self.cost_count as f64
        }
    }

    /// URI currently cached as the head, if any.
    pub fn peeked(&self) -> Option<&CrawlUri> {
        self.peeked.as_ref()
    }

    pub(crate) fn set_session_budget(&mut self, budget: i32) {
        self.session_budget = budget;
    }

    pub(crate) fn set_total_budget(&mut self, budget: i64) {
        self.total_budget = budget;
    }

    pub(crate) fn tally(&mut self, curi: &CrawlUri, stage: Stage) {
        self.precedence.tally(curi.precedence, stage);
    }

    pub(crate) fn reevaluate_precedence(&mut self) {
        self.precedence.reevaluate();
    }

    /// Store `curi` under its ordering key. The record must not already be
    /// in this queue.
    pub(crate) fn enqueue(&mut self, store: &dyn QueueStore, curi: &mut CrawlUri) -> Result<()> {
        let key = storage::item_key(&self.class_key, curi);
        store.put(&key, &serde_json::to_vec(curi)?)?;
        curi.holder_key = Some(key);
        self.last_queued = Some(curi.uri().to_owned());
        self.count += 1;
        self.enqueue_count += 1;
        self.tally(curi, Stage::Scheduled);
        Ok(())
    }

    /// Current head, cached so repeated calls return the same record until
    /// it is unpeeked or dequeued.
    pub(crate) fn peek(&mut self, store: &dyn QueueStore) -> Result<Option<CrawlUri>> {
        if self.peeked.is_none() && self.count > 0 {
            let prefix = storage::queue_prefix(&self.class_key);
            if let Some((key, value)) = store.first_with_prefix(&prefix)? {
                let mut curi: CrawlUri = serde_json::from_slice(&value)?;
                curi.holder_key = Some(key);
                self.last_peeked = Some(curi.uri().to_owned());
                self.peeked = Some(curi);
            }
        }
        Ok(self.peeked.clone())
    }

    /// Whether `curi` is the cached head handed out for processing. A copy
    /// from an earlier attempt of the same URI does not match.
    pub(crate) fn is_peeked(&self, curi: &CrawlUri) -> bool {
        match self.peeked.as_ref() {
            Some(peeked) => {
                peeked.uri() == curi.uri()
                    && peeked.ordinal == curi.ordinal
                    && peeked.fetch_attempts == curi.fetch_attempts
            }
            None => false,
        }
    }

    /// Give the caller's copy of the head, which carries the results of a
    /// fetch attempt, the store key of the cached record.
    pub(crate) fn adopt_holder_key(&self, curi: &mut CrawlUri) {
        if let Some(peeked) = self.peeked.as_ref() {
            curi.holder_key = peeked.holder_key.clone();
        }
    }

    pub(crate) fn unpeek(&mut self) {
        self.peeked = None;
    }

    /// Remove the cached head from the store.
    pub(crate) fn dequeue(&mut self, store: &dyn QueueStore) -> Result<Option<CrawlUri>> {
        let curi = match self.peeked.take() {
            Some(curi) => curi,
            None => return Ok(None),
        };
        match curi.holder_key.as_deref() {
            Some(key) => {
                if !store.delete(key)? {
                    log::error!("{} missing from store for queue {}", curi, self.class_key);
                }
            }
            None => log::error!("{} dequeued without a store key", curi),
        }
        self.count -= 1;
        self.last_dequeue_time = util::now_ms();
        Ok(Some(curi))
    }

    /// Rewrite a record already in this queue without moving it.
    pub(crate) fn update(&mut self, store: &dyn QueueStore, curi: &CrawlUri) -> Result<()> {
        let key = match curi.holder_key.clone() {
            Some(key) => key,
            None => storage::item_key(&self.class_key, curi),
        };
        store.put(&key, &serde_json::to_vec(curi)?)?;
        self.last_queued = Some(curi.uri().to_owned());
        Ok(())
    }

    /// Delete every stored item whose URI matches `pattern`, sparing the
    /// cached head. Returns the number deleted.
    pub(crate) fn delete_matching(&mut self, store: &dyn QueueStore, pattern: &Regex) -> Result<i64> {
        let spared = self.peeked.as_ref().and_then(|c| c.holder_key.clone());
        let prefix = storage::queue_prefix(&self.class_key);
        let mut deleted = 0;
        for (key, value) in store.scan_prefix(&prefix)? {
            if spared.as_deref() == Some(key.as_slice()) {
                continue;
            }
            let curi: CrawlUri = serde_json::from_slice(&value)?;
            if pattern.is_match(curi.uri()) && store.delete(&key)? {
                deleted += 1;
            }
        }
        self.count -= deleted;
        Ok(deleted)
    }

    /// All stored records in dispatch order.
    pub fn contents(&self, store: &dyn QueueStore) -> Result<Vec<CrawlUri>> {
        let prefix = storage::queue_prefix(&self.class_key);
        store
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, value)| {
                let mut curi: CrawlUri = serde_json::from_slice(&value)?;
                curi.holder_key = Some(key);
                Ok(curi)
            })
            .collect()
    }

    /// Begin a session; a no-op if one is already running.
    pub(crate) fn consider_active(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.expenditure_at_last_activation = self.total_expenditure;
    }

    pub(crate) fn note_deactivated(&mut self) {
        self.active = false;
        self.managed = true;
    }

    pub(crate) fn note_exhausted(&mut self) {
        self.active = false;
        self.managed = false;
    }

    /// Charge `amount` to the queue. Negative amounts refund.
    pub(crate) fn expend(&mut self, amount: i32) {
        self.total_expenditure += amount as i64;
        if amount >= 0 {
            self.last_cost = amount;
            self.cost_count += 1;
        } else {
            self.cost_count -= 1;
        }
    }

    pub(crate) fn note_error(&mut self, penalty: i32) {
        self.total_expenditure += penalty as i64;
        self.error_count += 1;
    }

    pub fn is_over_session_budget(&self) -> bool {
        self.session_budget > 0
            && (self.total_expenditure - self.expenditure_at_last_activation)
                > self.session_budget as i64
    }

    pub fn is_over_total_budget(&self) -> bool {
        self.total_budget >= 0 && self.total_expenditure >= self.total_budget
    }

    pub fn short_report_legend() -> &'static str {
        "queue precedence currentSize totalEnqueues sessionBalance lastCost \
         (averageCost) lastDequeueTime wakeTime totalSpend/totalBudget \
         errorCount lastPeekUri lastQueuedUri"
    }

    pub fn short_report_line(&self, now_ms: i64) -> String {
        let last_dequeue = if self.last_dequeue_time != 0 {
            Utc.timestamp_millis_opt(self.last_dequeue_time)
                .single()
                .map(|t| t.format("%Y%m%d%H%M%S%3f").to_string())
                .unwrap_or_else(|| "-".to_owned())
        } else {
            "-".to_owned()
        };
        let wake = if self.wake_time != 0 {
            format!("{}ms", self.wake_time - now_ms)
        } else {
            "-".to_owned()
        };
        format!(
            "{} {} {} {} {} {}({:.1}) {} {} {}/{} {} {} {}",
            self.class_key,
            self.precedence(),
            self.count,
            self.enqueue_count,
            self.session_balance(),
            self.last_cost,
            self.average_cost(),
            last_dequeue,
            wake,
            self.total_expenditure,
            self.total_budget,
            self.error_count,
            self.last_peeked.as_deref().unwrap_or("-"),
            self.last_queued.as_deref().unwrap_or("-"),
        )
    }

    /// Multi-line detail for one queue.
    pub fn report(&self, now_ms: i64) -> String {
        let mut out = format!(
            "Queue {} (p{})\n  {} items\n",
            self.class_key,
            self.precedence(),
            self.count
        );
        if self.wake_time != 0 {
            out.push_str(&format!("   wakes in: {}ms\n", self.wake_time - now_ms));
        }
        out.push_str(&format!(
            "    last enqueued: {}\n      last peeked: {}\n",
            self.last_queued.as_deref().unwrap_or("-"),
            self.last_peeked.as_deref().unwrap_or("-"),
        ));
        out.push_str(&format!(
            "   total expended: {} (total budget: {})\n   active balance: {}\n",
            self.total_expenditure,
            self.total_budget,
            self.session_balance()
        ));
        out.push_str(&format!(
            "   last(avg) cost: {}({:.1})\n   precedence: {}\n",
            self.last_cost,
            self.average_cost(),
            self.precedence.report_fragment()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;
    use crate::uri::SchedulingDirective;

    fn queue() -> WorkQueue {
        WorkQueue::new("a.example", PrecedenceProvider::Simple { base: 3 }, -1)
    }

    fn curi(path: &str, ordinal: u64) -> CrawlUri {
        let mut curi = CrawlUri::new(&format!("http://a.example{}", path)).unwrap();
        curi.ordinal = ordinal;
        curi.class_key = Some("a.example".to_owned());
        curi
    }

    #[test]
    fn peek_is_sticky_until_unpeeked() {
        let store = MemStore::new();
        let mut q = queue();
        q.enqueue(&store, &mut curi("/2", 2)).unwrap();
        assert_eq!(q.peek(&store).unwrap().unwrap().uri(), "http://a.example/2");

        let mut urgent = curi("/1", 3);
        urgent.scheduling_directive = SchedulingDirective::High;
        q.enqueue(&store, &mut urgent).unwrap();
        assert_eq!(q.peek(&store).unwrap().unwrap().uri(), "http://a.example/2");

        q.unpeek();
        assert_eq!(q.peek(&store).unwrap().unwrap().uri(), "http://a.example/1");
        assert_eq!(q.count(), 2);
        assert_eq!(q.enqueue_count(), 2);
    }

    #[test]
    fn dequeue_removes_head_and_tolerates_missing() {
        let store = MemStore::new();
        let mut q = queue();
        q.enqueue(&store, &mut curi("/1", 1)).unwrap();
        q.enqueue(&store, &mut curi("/2", 2)).unwrap();
        let head = q.peek(&store).unwrap().unwrap();
        store.delete(head.holder_key.as_deref().unwrap()).unwrap();
        let gone = q.dequeue(&store).unwrap().unwrap();
        assert_eq!(gone.uri(), "http://a.example/1");
        assert_eq!(q.count(), 1);
        assert_eq!(q.peek(&store).unwrap().unwrap().uri(), "http://a.example/2");
    }

    #[test]
    fn update_keeps_position() {
        let store = MemStore::new();
        let mut q = queue();
        q.enqueue(&store, &mut curi("/1", 1)).unwrap();
        q.enqueue(&store, &mut curi("/2", 2)).unwrap();
        let mut head = q.peek(&store).unwrap().unwrap();
        head.fetch_attempts = 2;
        q.unpeek();
        q.update(&store, &head).unwrap();
        let again = q.peek(&store).unwrap().unwrap();
        assert_eq!(again.uri(), "http://a.example/1");
        assert_eq!(again.fetch_attempts, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn budgets() {
        let mut q = queue();
        q.set_session_budget(10);
        q.set_total_budget(25);
        q.consider_active();
        q.expend(8);
        assert!(!q.is_over_session_budget());
        q.note_error(5);
        assert!(q.is_over_session_budget());
        assert_eq!(q.error_count(), 1);
        assert!(!q.is_over_total_budget());
        q.expend(12);
        assert!(q.is_over_total_budget());
        assert_eq!(q.session_balance(), -15);
        q.expend(-12);
        assert_eq!(q.total_expenditure(), 13);
    }

    #[test]
    fn delete_matching_spares_head() {
        let store = MemStore::new();
        let mut q = queue();
        for (i, path) in ["/keep", "/drop-1", "/drop-2", "/other"].iter().enumerate() {
            q.enqueue(&store, &mut curi(path, i as u64 + 1)).unwrap();
        }
        q.peek(&store).unwrap();
        let pattern = Regex::new(r"^(?:.*/(drop-\d|keep))$").unwrap();
        assert_eq!(q.delete_matching(&store, &pattern).unwrap(), 2);
        assert_eq!(q.count(), 2);
        let left: Vec<String> = q
            .contents(&store)
            .unwrap()
            .iter()
            .map(|c| c.uri().to_owned())
            .collect();
        assert_eq!(left, vec!["http://a.example/keep", "http://a.example/other"]);
    }

    #[test]
    fn report_line_follows_legend() {
        let q = queue();
        let line = q.short_report_line(0);
        assert_eq!(
            line.split(' ').count(),
            WorkQueue::short_report_legend().split(' ').count() - 1
        );
        assert!(line.starts_with("a.example 3 0 0 0 0(0.0) - - 0/-1 0"));
    }
}
