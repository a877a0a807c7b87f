//! The queue-of-queues frontier.
//!
//! Every pending URI lives in the [`WorkQueue`] for its class key. Queues move
//! between the lifecycle collections (ready, in-process, snoozed, inactive by
//! precedence, retired) as workers take their heads with
//! [`WorkQueueFrontier::next`] and report back through
//! [`WorkQueueFrontier::finished`].
//!
//! Lock order: disposition, lifecycle, queue map, one queue, journal. The
//! uniqueness filter is always called with no lock held, since accepting a
//! URI calls back into the frontier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;

mod admin;
mod checkpoint;
mod import;
mod lifecycle;
mod manager;
mod report;
mod work_queue;

pub use admin::ConsistencyReport;
pub use import::{ImportParams, ImportSummary, Scope};
pub use lifecycle::QueueState;
pub use manager::State;
pub use report::QueueCounts;
pub use work_queue::WorkQueue;

use crate::config::Config;
use crate::error::{FrontierError, Result};
use crate::journal::FrontierJournal;
use crate::policy::retry;
use crate::policy::{
    AuthorityAssignment, CostAssignmentPolicy, CredentialRetry, PrecedenceProvider,
    QueueAssignmentPolicy, RetryPredicate, ServerCache, Stage, DEFAULT_CLASS_KEY,
};
use crate::stats::Stats;
use crate::status;
use crate::storage::{self, QueueStore};
use crate::uniq::{self, UriReceiver, UriUniqFilter};
use crate::uri::{self, CrawlUri, SchedulingDirective};
use crate::util;

use lifecycle::QueueLifecycle;
use manager::Control;

/// Longest a worker sleeps in [`WorkQueueFrontier::next`] between searches.
const MAX_IDLE_SLEEP_MS: i64 = 1000;

/// What workers and the crawl controller see of a frontier.
#[async_trait]
pub trait Frontier: Send + Sync {
    /// Wait for the next URI to fetch. `None` once the crawl has finished.
    async fn next(&self) -> Result<Option<CrawlUri>>;

    fn schedule(&self, curi: CrawlUri) -> Result<()>;

    fn receive(&self, curi: CrawlUri) -> Result<()>;

    fn finished(&self, curi: CrawlUri) -> Result<()>;

    fn consider_included(&self, curi: CrawlUri) -> Result<()>;

    fn request_state(&self, state: State);

    fn is_empty(&self) -> bool;

    fn queued_uri_count(&self) -> i64;
}

pub struct FrontierBuilder {
    config: Config,
    assignment: Option<Box<dyn QueueAssignmentPolicy>>,
    cost: Option<Box<dyn CostAssignmentPolicy>>,
    retry: Option<Box<dyn RetryPredicate>>,
    uniq: Option<Box<dyn UriUniqFilter>>,
    store: Option<Arc<dyn QueueStore>>,
    scope: Option<Box<dyn Scope>>,
    servers: ServerCache,
}

impl FrontierBuilder {
    pub fn assignment<P: QueueAssignmentPolicy + 'static>(mut self, policy: P) -> Self {
        self.assignment = Some(Box::new(policy));
        self
    }

    pub fn cost<P: CostAssignmentPolicy + 'static>(mut self, policy: P) -> Self {
        self.cost = Some(Box::new(policy));
        self
    }

    pub fn retry_predicate<P: RetryPredicate + 'static>(mut self, predicate: P) -> Self {
        self.retry = Some(Box::new(predicate));
        self
    }

    pub fn uniq_filter<F: UriUniqFilter + 'static>(mut self, filter: F) -> Self {
        self.uniq = Some(Box::new(filter));
        self
    }

    /// Share an already open store, e.g. to restore from a checkpoint.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scope<S: Scope + 'static>(mut self, scope: S) -> Self {
        self.scope = Some(Box::new(scope));
        self
    }

    /// Host to address map consulted by IP-based queue assignment.
    pub fn server_cache(mut self, servers: ServerCache) -> Self {
        self.servers = servers;
        self
    }

    pub fn build(self) -> Result<WorkQueueFrontier> {
        let config = self.config;
        config.sanity_check()?;

        let precedence = config.queue_precedence.provider()?;
        let assignment = match self.assignment {
            Some(assignment) => assignment,
            None => Box::new(AuthorityAssignment::new(
                config.queue_assignment.clone(),
                self.servers,
            )?),
        };
        let cost = self.cost.unwrap_or_else(|| config.cost_policy.build());
        let retry = self.retry.unwrap_or_else(|| Box::new(CredentialRetry));
        let uniq = match self.uniq {
            Some(uniq) => uniq,
            None => uniq::open(&config)?,
        };
        let store = match self.store {
            Some(store) => store,
            None => storage::open(&config)?,
        };
        let journal = if config.recovery_log_enabled {
            Some(FrontierJournal::open(&config.data_dir)?)
        } else {
            None
        };
        if let Some(max) = assignment.maximum_number_of_keys() {
            log::debug!("queue assignment yields at most {} keys", max);
        }

        Ok(WorkQueueFrontier {
            config: Arc::new(config),
            assignment,
            cost,
            retry,
            uniq,
            store,
            journal,
            scope: self.scope,
            precedence,
            queues: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(QueueLifecycle::new()),
            disposition: RwLock::new(()),
            stats: Stats::new(),
            control: Control::new(),
        })
    }
}

pub struct WorkQueueFrontier {
    config: Arc<Config>,
    assignment: Box<dyn QueueAssignmentPolicy>,
    cost: Box<dyn CostAssignmentPolicy>,
    retry: Box<dyn RetryPredicate>,
    uniq: Box<dyn UriUniqFilter>,
    store: Arc<dyn QueueStore>,
    journal: Option<FrontierJournal>,
    scope: Option<Box<dyn Scope>>,
    /// Provider each new queue starts from.
    precedence: PrecedenceProvider,
    queues: RwLock<HashMap<String, Arc<Mutex<WorkQueue>>>>,
    lifecycle: Mutex<QueueLifecycle>,
    /// Held for reading across a disposition, for writing by checkpoints.
    disposition: RwLock<()>,
    stats: Stats,
    control: Control,
}

/// Receives URIs the uniqueness filter lets through.
struct Accepted<'a>(&'a WorkQueueFrontier);

impl UriReceiver for Accepted<'_> {
    fn receive(&self, curi: CrawlUri) -> Result<()> {
        self.0.send_to_queue(curi)
    }
}

fn lock_queue(queue: &Mutex<WorkQueue>) -> MutexGuard<'_, WorkQueue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkQueueFrontier {
    pub fn builder(config: Config) -> FrontierBuilder {
        FrontierBuilder {
            config,
            assignment: None,
            cost: None,
            retry: None,
            uniq: None,
            store: None,
            scope: None,
            servers: ServerCache::new(),
        }
    }

    /// A frontier with every collaborator chosen by `config`.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn journal(&self) -> Option<&FrontierJournal> {
        self.journal.as_ref()
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, QueueLifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn existing_queue(&self, class_key: &str) -> Option<Arc<Mutex<WorkQueue>>> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues.get(class_key).cloned()
    }

    fn queue_for(&self, class_key: &str) -> Arc<Mutex<WorkQueue>> {
        if let Some(queue) = self.existing_queue(class_key) {
            return queue;
        }
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(class_key.to_owned())
            .or_insert_with(|| {
                log::debug!("created queue {}", class_key);
                Arc::new(Mutex::new(WorkQueue::new(
                    class_key,
                    self.precedence.clone(),
                    self.config.queue_total_budget,
                )))
            })
            .clone()
    }

    fn all_queues(&self) -> Vec<Arc<Mutex<WorkQueue>>> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues.values().cloned().collect()
    }

    /// Class key `curi` belongs in right now.
    fn class_key_for(&self, curi: &CrawlUri) -> String {
        if !self.config.force_queue_assignment.is_empty() {
            return self.config.force_queue_assignment.clone();
        }
        let key = self.assignment.class_key(curi);
        if key.is_empty() {
            DEFAULT_CLASS_KEY.to_owned()
        } else {
            key
        }
    }

    /// Seed redirects and near embeds jump ahead of ordinary discoveries.
    fn apply_special_handling(&self, curi: &mut CrawlUri) {
        if curi.scheduling_directive != SchedulingDirective::Normal {
            return;
        }
        if curi.is_seed && !curi.flatten_via().is_empty() {
            curi.scheduling_directive = SchedulingDirective::Medium;
            return;
        }
        let embed_hops = curi.trans_hops();
        let preferred = self.config.preference_embed_hops;
        if preferred > 0 && embed_hops > 0 && embed_hops <= preferred {
            curi.scheduling_directive = SchedulingDirective::Medium;
        }
    }

    /// Give `curi` everything a queue needs: ordinal, class key, cost and
    /// precedence.
    fn prepare(&self, curi: &mut CrawlUri) {
        if curi.ordinal == 0 {
            curi.ordinal = self.stats.take_ordinal();
        }
        self.apply_special_handling(curi);
        if curi.class_key.is_none() {
            curi.class_key = Some(self.class_key_for(curi));
        }
        if curi.holder_cost.is_none() {
            curi.holder_cost = Some(self.cost.cost_of(curi));
        }
        self.config.uri_precedence.uri_scheduled(curi);
    }

    /// Queue `curi` if its canonical form has never been seen.
    pub fn schedule(&self, curi: CrawlUri) -> Result<()> {
        self.schedule_if_new(curi).map(|_| ())
    }

    /// [`schedule`](Self::schedule), reporting whether the URI got past the
    /// uniqueness filter.
    fn schedule_if_new(&self, mut curi: CrawlUri) -> Result<bool> {
        self.prepare(&mut curi);
        let canon = uri::canonicalize_curi(&mut curi)?;
        let receiver = Accepted(self);
        if curi.force_fetch {
            self.uniq.add_force(&canon, curi, &receiver)?;
            return Ok(true);
        }
        let added = self.uniq.add(&canon, curi, &receiver)?;
        if !added {
            log::trace!("already seen {}", canon);
        }
        Ok(added)
    }

    /// Queue `curi` unconditionally, bypassing the uniqueness filter.
    pub fn receive(&self, mut curi: CrawlUri) -> Result<()> {
        self.prepare(&mut curi);
        self.send_to_queue(curi)
    }

    /// Mark `curi` as seen without queueing it, charging its cost to the
    /// queue it would have joined.
    pub fn consider_included(&self, mut curi: CrawlUri) -> Result<()> {
        let canon = uri::canonicalize_curi(&mut curi)?;
        self.uniq.note(&canon)?;
        let class_key = match curi.class_key.clone() {
            Some(key) => key,
            None => self.class_key_for(&curi),
        };
        let cost = curi.holder_cost.unwrap_or_else(|| self.cost.cost_of(&curi));
        let queue = self.queue_for(&class_key);
        let mut wq = lock_queue(&queue);
        wq.expend(cost);
        Ok(())
    }

    fn send_to_queue(&self, curi: CrawlUri) -> Result<()> {
        let mut lc = self.lock_lifecycle();
        self.send_to_queue_locked(&mut lc, curi)
    }

    fn send_to_queue_locked(&self, lc: &mut QueueLifecycle, mut curi: CrawlUri) -> Result<()> {
        let class_key = match curi.class_key.clone() {
            Some(key) => key,
            None => {
                let key = self.class_key_for(&curi);
                curi.class_key = Some(key.clone());
                key
            }
        };
        let queue = self.queue_for(&class_key);
        let mut wq = lock_queue(&queue);
        let original_precedence = wq.precedence();
        wq.enqueue(self.store.as_ref(), &mut curi)?;
        if let Some(journal) = self.journal.as_ref() {
            journal.added(&curi)?;
        }
        if wq.is_retired() {
            return Ok(());
        }
        self.stats.incr_queued(1);
        if wq.is_managed() {
            if !wq.is_active() && wq.precedence() < original_precedence {
                // bumped up; list it at its new tier too
                self.deactivate(lc, &mut wq);
            }
        } else if self.config.hold_queues {
            self.deactivate(lc, &mut wq);
        } else {
            self.replenish(&mut wq)?;
            self.ready(lc, &mut wq);
        }
        Ok(())
    }

    /// Refill the queue's session budget, and reset its total budget, from
    /// its head's override or the config.
    fn replenish(&self, wq: &mut WorkQueue) -> Result<()> {
        let had_peeked = wq.peeked().is_some();
        let head = wq.peek(self.store.as_ref())?;
        let budgets = head.and_then(|c| c.budget_override).unwrap_or_default();
        wq.set_session_budget(
            budgets
                .session_budget
                .unwrap_or(self.config.balance_replenish_amount),
        );
        wq.set_total_budget(
            budgets
                .total_budget
                .unwrap_or(self.config.queue_total_budget),
        );
        if !had_peeked {
            wq.unpeek();
        }
        Ok(())
    }

    fn ready(&self, lc: &mut QueueLifecycle, wq: &mut WorkQueue) {
        wq.managed = true;
        wq.consider_active();
        lc.ready.push_back(wq.class_key().to_owned());
        log::debug!("queue {} ready", wq.class_key());
    }

    /// Park a queue on the inactive list for its precedence.
    fn deactivate(&self, lc: &mut QueueLifecycle, wq: &mut WorkQueue) {
        wq.set_session_budget(0);
        let precedence = wq.precedence();
        if wq.on_inactive_queues.insert(precedence) {
            lc.inactive
                .entry(precedence)
                .or_default()
                .push_back(wq.class_key().to_owned());
            if precedence < lc.highest_precedence_waiting {
                lc.highest_precedence_waiting = precedence;
            }
        }
        wq.note_deactivated();
        log::debug!("queue {} deactivated to p{}", wq.class_key(), precedence);
    }

    fn retire(&self, lc: &mut QueueLifecycle, wq: &mut WorkQueue) {
        lc.retired.push_back(wq.class_key().to_owned());
        self.stats.decr_queued(wq.count());
        wq.retired = true;
        wq.active = false;
        log::debug!(
            "queue {} retired ({}/{})",
            wq.class_key(),
            wq.total_expenditure(),
            wq.total_budget()
        );
    }

    fn unretire(&self, lc: &mut QueueLifecycle, wq: &mut WorkQueue) {
        self.deactivate(lc, wq);
        wq.retired = false;
        self.stats.incr_queued(wq.count());
        log::debug!("queue {} unretired", wq.class_key());
    }

    fn snooze(&self, lc: &mut QueueLifecycle, wq: &mut WorkQueue, now: i64, delay_ms: u64) {
        let wake_time = now + delay_ms as i64;
        wq.wake_time = wake_time;
        lc.snooze(wq.class_key(), wake_time, self.config.max_snoozed_in_memory);
        if delay_ms > self.config.snooze_long_ms {
            log::debug!("queue {} snoozed long, {}ms", wq.class_key(), delay_ms);
        }
    }

    /// Put a queue back in rotation after a disposition or a snooze.
    fn reenqueue(&self, lc: &mut QueueLifecycle, wq: &mut WorkQueue) {
        wq.reevaluate_precedence();
        if wq.is_over_total_budget() {
            self.retire(lc, wq);
            return;
        }
        let precedence = wq.precedence();
        let waiting = lc.highest_precedence_waiting;
        if waiting < precedence
            || (wq.is_over_session_budget() && waiting <= precedence)
            || precedence >= self.config.precedence_floor
        {
            self.deactivate(lc, wq);
        } else {
            self.ready(lc, wq);
        }
    }

    fn handle_queue(
        &self,
        lc: &mut QueueLifecycle,
        wq: &mut WorkQueue,
        force_retire: bool,
        now: i64,
        delay_ms: u64,
    ) {
        if force_retire {
            self.retire(lc, wq);
        } else if delay_ms > 0 {
            self.snooze(lc, wq, now, delay_ms);
        } else {
            self.reenqueue(lc, wq);
        }
    }

    /// Ready the most urgent inactive queue. Returns false if none could be.
    fn activate_inactive_queue(&self, lc: &mut QueueLifecycle) -> Result<bool> {
        let tiers: Vec<i32> = lc.inactive.keys().copied().collect();
        for expected in tiers {
            if expected >= self.config.precedence_floor {
                break;
            }
            loop {
                let class_key = match lc.inactive.get_mut(&expected).and_then(|q| q.pop_front()) {
                    Some(key) => key,
                    None => break,
                };
                lc.update_highest_waiting(expected);
                let queue = match self.existing_queue(&class_key) {
                    Some(queue) => queue,
                    None => {
                        log::error!("inactive queue {} missing from queue map", class_key);
                        continue;
                    }
                };
                let mut wq = lock_queue(&queue);
                wq.on_inactive_queues.remove(&expected);
                if wq.is_retired() || wq.is_active() {
                    continue;
                }
                let precedence = wq.precedence();
                if precedence != expected {
                    // precedence moved since it was listed
                    if !wq.on_inactive_queues.contains(&precedence) {
                        self.deactivate(lc, &mut wq);
                    }
                    continue;
                }
                self.replenish(&mut wq)?;
                if wq.is_over_total_budget() {
                    self.retire(lc, &mut wq);
                    continue;
                }
                wq.wake_time = 0;
                self.ready(lc, &mut wq);
                return Ok(true);
            }
        }
        if lc.inactive.values().all(|q| q.is_empty()) {
            lc.inactive.clear();
        }
        Ok(false)
    }

    fn wake_queues(&self, lc: &mut QueueLifecycle, now: i64) {
        for class_key in lc.pop_woken(now) {
            let queue = match self.existing_queue(&class_key) {
                Some(queue) => queue,
                None => {
                    log::error!("snoozed queue {} missing from queue map", class_key);
                    continue;
                }
            };
            let mut wq = lock_queue(&queue);
            wq.wake_time = 0;
            log::debug!("queue {} woken", class_key);
            self.reenqueue(lc, &mut wq);
        }
    }

    fn release_future_uris(&self, lc: &mut QueueLifecycle, now: i64) -> Result<()> {
        let later = lc.future_uris.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut lc.future_uris, later);
        for (_, mut curi) in due {
            self.stats.decr_future();
            curi.reschedule_time = None;
            self.prepare(&mut curi);
            self.send_to_queue_locked(lc, curi)?;
        }
        Ok(())
    }

    /// Wake due queues and release due future URIs.
    pub(crate) fn wake_due(&self) -> Result<()> {
        let mut lc = self.lock_lifecycle();
        let now = util::now_ms();
        self.wake_queues(&mut lc, now);
        self.release_future_uris(&mut lc, now)
    }

    /// One non-blocking dispatch attempt. The returned URI's queue is in
    /// process until the URI is passed to [`finished`](Self::finished).
    ///
    /// Unlike [`next`](Self::next) this ignores the crawl state.
    pub fn find_eligible_uri(&self) -> Result<Option<CrawlUri>> {
        let mut lc = self.lock_lifecycle();
        let now = util::now_ms();
        self.wake_queues(&mut lc, now);
        self.release_future_uris(&mut lc, now)?;

        'find: loop {
            let class_key = match lc.ready.pop_front() {
                Some(key) => key,
                None => {
                    if lc.highest_precedence_waiting < self.config.precedence_floor
                        && self.activate_inactive_queue(&mut lc)?
                    {
                        continue 'find;
                    }
                    if lc.in_process.is_empty() {
                        self.uniq.request_flush()?;
                    }
                    return Ok(None);
                }
            };
            let queue = match self.existing_queue(&class_key) {
                Some(queue) => queue,
                None => {
                    log::error!("ready queue {} missing from queue map", class_key);
                    continue 'find;
                }
            };

            {
                let mut wq = lock_queue(&queue);
                if wq.count() == 0 {
                    wq.note_exhausted();
                    continue 'find;
                }
                if !lc.in_process.insert(class_key.clone()) {
                    log::debug!("queue {} already in process", class_key);
                    continue 'find;
                }
                wq.consider_active();
                wq.wake_time = 0;
                if wq.is_over_session_budget() {
                    lc.in_process.remove(&class_key);
                    self.deactivate(&mut lc, &mut wq);
                    continue 'find;
                }
                if wq.is_over_total_budget() {
                    lc.in_process.remove(&class_key);
                    self.retire(&mut lc, &mut wq);
                    continue 'find;
                }
            }

            loop {
                let mut wq = lock_queue(&queue);
                let curi = match wq.peek(self.store.as_ref())? {
                    Some(curi) => curi,
                    None => {
                        log::error!(
                            "queue {} counts {} items but holds none",
                            class_key,
                            wq.count()
                        );
                        lc.in_process.remove(&class_key);
                        wq.note_exhausted();
                        continue 'find;
                    }
                };
                let current_key = self.class_key_for(&curi);
                if current_key == class_key {
                    if let Some(journal) = self.journal.as_ref() {
                        journal.emitted(&curi)?;
                    }
                    return Ok(Some(curi));
                }

                // head now belongs elsewhere
                let mut moving = match wq.dequeue(self.store.as_ref())? {
                    Some(moving) => moving,
                    None => continue,
                };
                self.stats.decr_queued(1);
                wq.tally(&moving, Stage::Disregarded);
                log::debug!("relocating {} from {} to {}", moving, class_key, current_key);
                moving.class_key = Some(current_key);
                moving.holder_key = None;
                let exhausted = wq.count() == 0;
                if exhausted {
                    wq.note_exhausted();
                    lc.in_process.remove(&class_key);
                }
                drop(wq);
                self.send_to_queue_locked(&mut lc, moving)?;
                if exhausted {
                    continue 'find;
                }
            }
        }
    }

    /// Wait for a URI to fetch. Blocks while the crawl is paused or nothing
    /// is eligible; returns `None` once the crawl has finished.
    pub async fn next(&self) -> Result<Option<CrawlUri>> {
        loop {
            if self.control.reached() == State::Finish {
                return Ok(None);
            }
            {
                let _outbound = self.control.outbound.read().await;
                if self.control.reached() == State::Finish {
                    return Ok(None);
                }
                if let Some(curi) = self.find_eligible_uri()? {
                    return Ok(Some(curi));
                }
            }
            tokio::time::sleep(Duration::from_millis(self.idle_wait_ms())).await;
        }
    }

    fn idle_wait_ms(&self) -> u64 {
        let lc = self.lock_lifecycle();
        let wait = match lc.next_wake_time() {
            Some(at) => (at - util::now_ms()).clamp(1, MAX_IDLE_SLEEP_MS),
            None => MAX_IDLE_SLEEP_MS,
        };
        wait as u64
    }

    /// Dispose of a URI handed out by [`next`](Self::next) after one fetch
    /// attempt: retry it, or count it as succeeded, disregarded or failed.
    ///
    /// Fails with [`FrontierError::NotInProcess`] if `curi` is not the head
    /// currently in process for its queue, including when it was already
    /// finished.
    pub fn finished(&self, mut curi: CrawlUri) -> Result<()> {
        let _disposition = self.disposition.read().unwrap_or_else(|e| e.into_inner());
        let mut lc = self.lock_lifecycle();
        let class_key = match curi.class_key.clone() {
            Some(key) if lc.in_process.contains(&key) => key,
            _ => return Err(FrontierError::NotInProcess(curi.uri().to_owned())),
        };
        let queue = self
            .existing_queue(&class_key)
            .ok_or_else(|| FrontierError::UnknownQueue(class_key.clone()))?;
        let mut wq = lock_queue(&queue);
        if !wq.is_peeked(&curi) {
            return Err(FrontierError::NotInProcess(curi.uri().to_owned()));
        }
        wq.adopt_holder_key(&mut curi);
        self.process_finish(&mut lc, &mut wq, curi)
    }

    fn process_finish(
        &self,
        lc: &mut QueueLifecycle,
        wq: &mut WorkQueue,
        mut curi: CrawlUri,
    ) -> Result<()> {
        let now = util::now_ms();
        curi.fetch_attempts += 1;
        for failure in curi.non_fatal_failures.iter() {
            log::warn!("{} non-fatal failure: {}", curi, failure);
        }
        lc.in_process.remove(wq.class_key());

        if retry::needs_retrying(&self.config, self.retry.as_ref(), &curi) {
            if curi.fetch_status != status::S_DEFERRED {
                wq.expend(curi.holder_cost.unwrap_or(0));
            }
            let delay_ms = retry::retry_delay_for(&self.config, &curi) * 1000;
            curi.processing_cleanup();
            wq.unpeek();
            wq.update(self.store.as_ref(), &curi)?;
            wq.tally(&curi, Stage::Retried);
            self.handle_queue(lc, wq, curi.force_retire, now, delay_ms);
            if let Some(journal) = self.journal.as_ref() {
                journal.rescheduled(&curi)?;
            }
            return Ok(());
        }

        wq.dequeue(self.store.as_ref())?;
        self.stats.decr_queued(1);
        log_disposition(&curi);

        let stage = if curi.is_success() {
            self.stats.add_processed_bytes(curi.recorded_size);
            self.stats.incr_succeeded();
            if let Some(journal) = self.journal.as_ref() {
                journal.succeeded(&curi)?;
            }
            Stage::Succeeded
        } else if status::is_disregard(curi.fetch_status) {
            curi.holder_cost = Some(0);
            self.stats.incr_disregarded();
            if let Some(journal) = self.journal.as_ref() {
                journal.disregarded(&curi)?;
            }
            Stage::Disregarded
        } else {
            if curi.fetch_status == status::S_RUNTIME_EXCEPTION {
                log::warn!(target: "hopper::errors", "{} runtime exception", curi.hops_via_string());
            }
            self.stats.incr_failed();
            wq.note_error(self.config.error_penalty_amount);
            if let Some(journal) = self.journal.as_ref() {
                journal.failed(&curi)?;
            }
            Stage::Failed
        };
        wq.expend(curi.holder_cost.unwrap_or(0));
        wq.tally(&curi, stage);

        let delay_ms = retry::politeness_delay_for(&self.config, &curi);
        self.handle_queue(lc, wq, curi.force_retire, now, delay_ms);

        if let Some(at) = curi.reschedule_time.filter(|at| *at > 0) {
            curi.reset_for_rescheduling();
            curi.reschedule_time = Some(at);
            lc.future_uris.insert((at, curi.ordinal), curi);
            self.stats.incr_future();
        }
        Ok(())
    }

    /// Count an in-hand URI an operator deleted as disregarded.
    pub fn deleted(&self, mut curi: CrawlUri) {
        curi.fetch_status = status::S_DELETED_BY_USER;
        log_disposition(&curi);
        self.stats.incr_disregarded();
    }

    /// Nothing queued, pending in the uniqueness filter, or waiting to be
    /// rescheduled.
    pub fn is_empty(&self) -> bool {
        self.stats.queued_uri_count() == 0
            && self.uniq.pending() == 0
            && self.stats.future_uri_count() == 0
    }

    pub fn queued_uri_count(&self) -> i64 {
        self.stats.queued_uri_count()
    }

    pub fn future_uri_count(&self) -> i64 {
        self.stats.future_uri_count()
    }

    pub fn succeeded_fetch_count(&self) -> u64 {
        self.stats.succeeded_fetch_count()
    }

    pub fn failed_fetch_count(&self) -> u64 {
        self.stats.failed_fetch_count()
    }

    pub fn disregarded_uri_count(&self) -> u64 {
        self.stats.disregarded_uri_count()
    }

    pub fn total_processed_bytes(&self) -> u64 {
        self.stats.total_processed_bytes()
    }

    pub(crate) fn in_process_count(&self) -> usize {
        self.lock_lifecycle().in_process.len()
    }

    /// Push everything buffered to disk.
    pub fn flush(&self) -> Result<()> {
        if let Some(journal) = self.journal.as_ref() {
            journal.flush()?;
        }
        self.store.flush()?;
        self.uniq.request_flush()
    }
}

/// One crawl log line per permanently disposed URI.
fn log_disposition(curi: &CrawlUri) {
    log::info!(
        target: "hopper::crawl",
        "{} {} {} {}",
        curi.fetch_status,
        curi.uri(),
        if curi.path_from_seed.is_empty() { "-" } else { &curi.path_from_seed },
        curi.via.as_deref().unwrap_or("-"),
    );
}

#[async_trait]
impl Frontier for WorkQueueFrontier {
    async fn next(&self) -> Result<Option<CrawlUri>> {
        WorkQueueFrontier::next(self).await
    }

    fn schedule(&self, curi: CrawlUri) -> Result<()> {
        WorkQueueFrontier::schedule(self, curi)
    }

    fn receive(&self, curi: CrawlUri) -> Result<()> {
        WorkQueueFrontier::receive(self, curi)
    }

    fn finished(&self, curi: CrawlUri) -> Result<()> {
        WorkQueueFrontier::finished(self, curi)
    }

    fn consider_included(&self, curi: CrawlUri) -> Result<()> {
        WorkQueueFrontier::consider_included(self, curi)
    }

    fn request_state(&self, state: State) {
        WorkQueueFrontier::request_state(self, state)
    }

    fn is_empty(&self) -> bool {
        WorkQueueFrontier::is_empty(self)
    }

    fn queued_uri_count(&self) -> i64 {
        WorkQueueFrontier::queued_uri_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::*;
    use crate::uri::Hop;

    fn frontier(config: Config) -> WorkQueueFrontier {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = Config {
            recovery_log_enabled: false,
            ..config
        };
        WorkQueueFrontier::new(config).unwrap()
    }

    #[test]
    fn seed_redirects_and_near_embeds_are_promoted() {
        let f = frontier(Config::default());
        let seed = CrawlUri::seed("http://a.example/").unwrap();
        let page = CrawlUri::discovered(&seed, "/p", Hop::Link).unwrap();
        let mut img = CrawlUri::discovered(&page, "i.png", Hop::Embed).unwrap();
        f.apply_special_handling(&mut img);
        assert_eq!(img.scheduling_directive, SchedulingDirective::Medium);

        let mut far = CrawlUri::discovered(&img, "x.css", Hop::Embed).unwrap();
        f.apply_special_handling(&mut far);
        assert_eq!(far.scheduling_directive, SchedulingDirective::Normal);

        let mut redirected = CrawlUri::discovered(&seed, "http://b.example/", Hop::Redirect).unwrap();
        redirected.is_seed = true;
        redirected.path_from_seed = "LL".to_owned();
        f.apply_special_handling(&mut redirected);
        assert_eq!(redirected.scheduling_directive, SchedulingDirective::Medium);
    }

    #[test]
    fn forced_assignment_overrides_policy() {
        let f = frontier(Config {
            force_queue_assignment: "everything".to_owned(),
            ..Config::default()
        });
        f.schedule(CrawlUri::new("http://a.example/").unwrap()).unwrap();
        f.schedule(CrawlUri::new("http://b.example/").unwrap()).unwrap();
        assert_eq!(f.work_queue("everything").unwrap().count(), 2);
        assert!(f.work_queue("a.example").is_none());
    }

    #[test]
    fn new_queues_wait_inactive_when_held() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/").unwrap()).unwrap();
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Inactive(3)));

        let f = frontier(Config {
            hold_queues: false,
            ..Config::default()
        });
        f.schedule(CrawlUri::new("http://a.example/").unwrap()).unwrap();
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Ready));
        assert_eq!(f.work_queue("a.example").unwrap().session_budget(), 3000);
    }

    #[test]
    fn queues_at_the_floor_are_never_served() {
        let f = frontier(Config {
            precedence_floor: 3,
            ..Config::default()
        });
        f.schedule(CrawlUri::new("http://a.example/").unwrap()).unwrap();
        assert!(f.find_eligible_uri().unwrap().is_none());
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Inactive(3)));
        assert_eq!(f.queued_uri_count(), 1);
    }

    #[test]
    fn politeness_snoozes_the_queue() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/1").unwrap()).unwrap();
        f.schedule(CrawlUri::new("http://a.example/2").unwrap()).unwrap();
        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        assert!(f.find_eligible_uri().unwrap().is_none());
        curi.fetch_status = 200;
        curi.fetch_began_ms = Some(0);
        curi.fetch_completed_ms = Some(2_000);
        f.finished(curi).unwrap();
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Snoozed));
        let wq = f.work_queue("a.example").unwrap();
        let remaining = wq.wake_time() - util::now_ms();
        assert!(remaining > 9_000 && remaining <= 10_000);
        assert!(f.find_eligible_uri().unwrap().is_none());

        assert_eq!(f.force_wake_queues(), 1);
        let next = f.find_eligible_uri().unwrap().unwrap();
        assert_eq!(next.uri(), "http://a.example/2");
    }

    #[test]
    fn disregards_cost_nothing() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/1").unwrap()).unwrap();
        f.schedule(CrawlUri::new("http://a.example/2").unwrap()).unwrap();

        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = S_ROBOTS_PRECLUDED;
        f.finished(curi).unwrap();
        assert_eq!(f.disregarded_uri_count(), 1);
        assert_eq!(f.work_queue("a.example").unwrap().total_expenditure(), 0);

        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = 404;
        f.finished(curi).unwrap();
        assert_eq!(f.succeeded_fetch_count(), 1);

        assert_eq!(f.queued_uri_count(), 0);
        assert!(f.is_empty());
    }

    #[test]
    fn hard_failures_are_penalised() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/1").unwrap()).unwrap();
        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = S_RUNTIME_EXCEPTION;
        f.finished(curi).unwrap();
        assert_eq!(f.failed_fetch_count(), 1);
        let wq = f.work_queue("a.example").unwrap();
        assert_eq!(wq.total_expenditure(), 101);
        assert_eq!(wq.error_count(), 1);
    }

    #[test]
    fn force_retire_retires_on_finish() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/1").unwrap()).unwrap();
        f.schedule(CrawlUri::new("http://a.example/2").unwrap()).unwrap();
        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = 200;
        curi.force_retire = true;
        f.finished(curi).unwrap();
        assert_eq!(f.queue_state("a.example"), Some(QueueState::Retired));
        assert_eq!(f.queued_uri_count(), 0);
        assert!(f.find_eligible_uri().unwrap().is_none());
    }

    #[test]
    fn reschedule_time_holds_uri_for_later() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/1").unwrap()).unwrap();
        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = 200;
        curi.reschedule_time = Some(util::now_ms() - 1);
        f.finished(curi).unwrap();
        assert_eq!(f.future_uri_count(), 1);
        assert!(!f.is_empty());

        let again = f.find_eligible_uri().unwrap().unwrap();
        assert_eq!(again.uri(), "http://a.example/1");
        assert_eq!(again.fetch_attempts, 0);
        assert_eq!(f.future_uri_count(), 0);
        assert_eq!(f.queued_uri_count(), 1);
    }

    #[test]
    fn deferred_retries_without_charge() {
        let f = frontier(Config::default());
        f.schedule(CrawlUri::new("http://a.example/1").unwrap()).unwrap();
        let mut curi = f.find_eligible_uri().unwrap().unwrap();
        curi.fetch_status = S_DEFERRED;
        f.finished(curi).unwrap();
        assert_eq!(f.work_queue("a.example").unwrap().total_expenditure(), 0);
        let again = f.find_eligible_uri().unwrap().unwrap();
        assert_eq!(again.fetch_attempts, 1);
        assert_eq!(f.queued_uri_count(), 1);
    }
}
