use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use skiplist::OrderedSkipList;

use crate::uri::CrawlUri;

/// Where a queue sits in the dispatch cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Ready,
    InProcess,
    Snoozed,
    /// Parked on the inactive list for this precedence.
    Inactive(i32),
    Retired,
    /// Known, but on no lifecycle collection.
    Exhausted,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Ready => write!(f, "ready"),
            QueueState::InProcess => write!(f, "in-process"),
            QueueState::Snoozed => write!(f, "snoozed"),
            QueueState::Inactive(p) => write!(f, "inactive p{}", p),
            QueueState::Retired => write!(f, "retired"),
            QueueState::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// A snoozed queue's key and the epoch ms at which it wakes. Orders by wake
/// time, then key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct DelayedQueue {
    pub wake_time: i64,
    pub class_key: String,
}

/// Queue-of-queues membership. Holds class keys only; queue state is looked
/// up in the frontier's map.
pub(crate) struct QueueLifecycle {
    pub ready: VecDeque<String>,
    pub in_process: HashSet<String>,
    pub snoozed: OrderedSkipList<DelayedQueue>,
    /// Snoozes beyond the in-memory limit, by wake time.
    pub snoozed_overflow: BTreeMap<i64, Vec<String>>,
    pub inactive: BTreeMap<i32, VecDeque<String>>,
    /// Lowest precedence with a non-empty inactive list, or `i32::MAX`.
    pub highest_precedence_waiting: i32,
    pub retired: VecDeque<String>,
    /// URIs waiting to be scheduled again, by fire time and ordinal.
    pub future_uris: BTreeMap<(i64, u64), CrawlUri>,
}

impl QueueLifecycle {
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            in_process: HashSet::new(),
            snoozed: OrderedSkipList::new(),
            snoozed_overflow: BTreeMap::new(),
            inactive: BTreeMap::new(),
            highest_precedence_waiting: i32::MAX,
            retired: VecDeque::new(),
            future_uris: BTreeMap::new(),
        }
    }

    pub fn snooze(&mut self, class_key: &str, wake_time: i64, max_in_memory: usize) {
        if self.snoozed.len() < max_in_memory {
            self.snoozed.insert(DelayedQueue {
                wake_time,
                class_key: class_key.to_owned(),
            });
        } else {
            self.snoozed_overflow
                .entry(wake_time)
                .or_default()
                .push(class_key.to_owned());
        }
    }

    /// Remove and return every snoozed key due at or before `now`.
    pub fn pop_woken(&mut self, now: i64) -> Vec<String> {
        let mut woken = vec![];
        while self
            .snoozed
            .front()
            .map(|d| d.wake_time <= now)
            .unwrap_or(false)
        {
            if let Some(delayed) = self.snoozed.pop_front() {
                woken.push(delayed.class_key);
            }
        }
        let later = self.snoozed_overflow.split_off(&(now + 1));
        let due = std::mem::replace(&mut self.snoozed_overflow, later);
        for (_, keys) in due {
            woken.extend(keys);
        }
        woken
    }

    pub fn take_all_snoozed(&mut self) -> Vec<String> {
        let mut all: Vec<String> = std::mem::take(&mut self.snoozed)
            .into_iter()
            .map(|d| d.class_key)
            .collect();
        for (_, keys) in std::mem::take(&mut self.snoozed_overflow) {
            all.extend(keys);
        }
        all
    }

    pub fn snoozed_count(&self) -> usize {
        self.snoozed.len() + self.snoozed_overflow.values().map(Vec::len).sum::<usize>()
    }

    pub fn snoozed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snoozed.iter().map(|d| d.class_key.clone()).collect();
        for overflow in self.snoozed_overflow.values() {
            keys.extend(overflow.iter().cloned());
        }
        keys
    }

    /// Earliest pending wake or future-URI time.
    pub fn next_wake_time(&self) -> Option<i64> {
        let candidates = [
            self.snoozed.front().map(|d| d.wake_time),
            self.snoozed_overflow.keys().next().copied(),
            self.future_uris.keys().next().map(|(t, _)| *t),
        ];
        candidates.iter().flatten().min().copied()
    }

    pub fn has_inactive(&self) -> bool {
        self.inactive.values().any(|q| !q.is_empty())
    }

    pub fn update_highest_waiting(&mut self, start_from: i32) {
        self.highest_precedence_waiting = self
            .inactive
            .range(start_from..)
            .find(|(_, q)| !q.is_empty())
            .map(|(p, _)| *p)
            .unwrap_or(i32::MAX);
    }

    pub fn eligible_inactive_count(&self, floor: i32) -> usize {
        self.inactive.range(..floor).map(|(_, q)| q.len()).sum()
    }

    pub fn ineligible_inactive_count(&self, floor: i32) -> usize {
        self.inactive.range(floor..).map(|(_, q)| q.len()).sum()
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.values().map(VecDeque::len).sum()
    }

    /// Every collection `class_key` appears on, as short marks: `i`
    /// in-process, `r` ready, `s` snoozed, `S` snoozed overflow, the
    /// precedence for inactive lists, `R` retired.
    pub fn memberships(&self, class_key: &str) -> Vec<String> {
        let mut marks = vec![];
        if self.in_process.contains(class_key) {
            marks.push("i".to_owned());
        }
        for _ in self.ready.iter().filter(|k| *k == class_key) {
            marks.push("r".to_owned());
        }
        for _ in self.snoozed.iter().filter(|d| d.class_key == class_key) {
            marks.push("s".to_owned());
        }
        for keys in self.snoozed_overflow.values() {
            for _ in keys.iter().filter(|k| *k == class_key) {
                marks.push("S".to_owned());
            }
        }
        for (p, keys) in self.inactive.iter() {
            for _ in keys.iter().filter(|k| *k == class_key) {
                marks.push(p.to_string());
            }
        }
        for _ in self.retired.iter().filter(|k| *k == class_key) {
            marks.push("R".to_owned());
        }
        marks
    }

    pub fn state_of(&self, class_key: &str) -> QueueState {
        if self.in_process.contains(class_key) {
            return QueueState::InProcess;
        }
        if self.ready.iter().any(|k| k == class_key) {
            return QueueState::Ready;
        }
        if self.snoozed_keys().iter().any(|k| k == class_key) {
            return QueueState::Snoozed;
        }
        for (p, keys) in self.inactive.iter() {
            if keys.iter().any(|k| k == class_key) {
                return QueueState::Inactive(*p);
            }
        }
        if self.retired.iter().any(|k| k == class_key) {
            return QueueState::Retired;
        }
        QueueState::Exhausted
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let mut in_process: Vec<String> = self.in_process.iter().cloned().collect();
        in_process.sort();
        LifecycleSnapshot {
            ready: self.ready.iter().cloned().collect(),
            in_process,
            snoozed: self.snoozed.iter().cloned().collect(),
            snoozed_overflow: self.snoozed_overflow.clone(),
            inactive: self
                .inactive
                .iter()
                .map(|(p, q)| (*p, q.iter().cloned().collect()))
                .collect(),
            retired: self.retired.iter().cloned().collect(),
            future_uris: self.future_uris.values().cloned().collect(),
        }
    }

    /// Rebuild from a snapshot. Queues that were in process go back to the
    /// front of the ready list: their heads were never finished.
    pub fn from_snapshot(snapshot: LifecycleSnapshot) -> Self {
        let mut lifecycle = Self::new();
        lifecycle.ready = snapshot.ready.into_iter().collect();
        for key in snapshot.in_process.into_iter().rev() {
            lifecycle.ready.push_front(key);
        }
        for delayed in snapshot.snoozed {
            lifecycle.snoozed.insert(delayed);
        }
        lifecycle.snoozed_overflow = snapshot.snoozed_overflow;
        lifecycle.inactive = snapshot
            .inactive
            .into_iter()
            .map(|(p, keys)| (p, keys.into_iter().collect()))
            .collect();
        lifecycle.update_highest_waiting(i32::MIN);
        lifecycle.retired = snapshot.retired.into_iter().collect();
        for curi in snapshot.future_uris {
            let at = curi.reschedule_time.unwrap_or(0);
            lifecycle.future_uris.insert((at, curi.ordinal), curi);
        }
        lifecycle
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct LifecycleSnapshot {
    pub ready: Vec<String>,
    pub in_process: Vec<String>,
    pub snoozed: Vec<DelayedQueue>,
    pub snoozed_overflow: BTreeMap<i64, Vec<String>>,
    pub inactive: BTreeMap<i32, Vec<String>>,
    pub retired: Vec<String>,
    pub future_uris: Vec<CrawlUri>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snoozed_wake_in_time_order_with_overflow() {
        let mut lc = QueueLifecycle::new();
        lc.snooze("b", 200, 2);
        lc.snooze("a", 100, 2);
        lc.snooze("c", 150, 2);
        lc.snooze("d", 400, 2);
        assert_eq!(lc.snoozed.len(), 2);
        assert_eq!(lc.snoozed_count(), 4);
        assert_eq!(lc.next_wake_time(), Some(100));

        assert_eq!(lc.pop_woken(99), Vec::<String>::new());
        assert_eq!(lc.pop_woken(160), vec!["a", "c"]);
        assert_eq!(lc.pop_woken(1000), vec!["b", "d"]);
        assert_eq!(lc.snoozed_count(), 0);
        assert_eq!(lc.next_wake_time(), None);
    }

    #[test]
    fn highest_waiting_tracks_lowest_nonempty_tier() {
        let mut lc = QueueLifecycle::new();
        lc.inactive.entry(5).or_default().push_back("x".to_owned());
        lc.inactive.entry(2).or_default();
        lc.update_highest_waiting(0);
        assert_eq!(lc.highest_precedence_waiting, 5);
        assert_eq!(lc.eligible_inactive_count(5), 0);
        assert_eq!(lc.ineligible_inactive_count(5), 1);
        lc.inactive.get_mut(&5).unwrap().clear();
        lc.update_highest_waiting(0);
        assert_eq!(lc.highest_precedence_waiting, i32::MAX);
    }

    #[test]
    fn state_and_memberships() {
        let mut lc = QueueLifecycle::new();
        lc.ready.push_back("a".to_owned());
        lc.inactive.entry(3).or_default().push_back("a".to_owned());
        lc.retired.push_back("r".to_owned());
        assert_eq!(lc.state_of("a"), QueueState::Ready);
        assert_eq!(lc.memberships("a"), vec!["r", "3"]);
        assert_eq!(lc.state_of("r"), QueueState::Retired);
        assert_eq!(lc.state_of("zzz"), QueueState::Exhausted);
    }

    #[test]
    fn snapshot_puts_in_process_back_on_ready() {
        let mut lc = QueueLifecycle::new();
        lc.ready.push_back("b".to_owned());
        lc.in_process.insert("a".to_owned());
        lc.snooze("s", 50, 10);
        lc.inactive.entry(4).or_default().push_back("i".to_owned());
        let restored = QueueLifecycle::from_snapshot(lc.snapshot());
        assert_eq!(restored.ready, vec!["a", "b"]);
        assert!(restored.in_process.is_empty());
        assert_eq!(restored.snoozed_keys(), vec!["s"]);
        assert_eq!(restored.highest_precedence_waiting, 4);
    }
}
