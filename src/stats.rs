use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Crawl-wide counters. Updated with plain atomic adds; a consistent
/// snapshot needs the frontier's disposition lock held for writing.
pub struct Stats {
    next_ordinal: AtomicU64,
    queued_uri_count: AtomicI64,
    future_uri_count: AtomicI64,
    succeeded_fetch_count: AtomicU64,
    failed_fetch_count: AtomicU64,
    disregarded_uri_count: AtomicU64,
    total_processed_bytes: AtomicU64,
    start_time: Mutex<NaiveDateTime>,
}

/// The counters as written at checkpoint time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub next_ordinal: u64,
    pub queued_uri_count: i64,
    pub future_uri_count: i64,
    pub succeeded_fetch_count: u64,
    pub failed_fetch_count: u64,
    pub disregarded_uri_count: u64,
    pub total_processed_bytes: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            next_ordinal: AtomicU64::new(1),
            queued_uri_count: AtomicI64::new(0),
            future_uri_count: AtomicI64::new(0),
            succeeded_fetch_count: AtomicU64::new(0),
            failed_fetch_count: AtomicU64::new(0),
            disregarded_uri_count: AtomicU64::new(0),
            total_processed_bytes: AtomicU64::new(0),
            start_time: Mutex::new(Utc::now().naive_utc()),
        }
    }

    pub fn take_ordinal(&self) -> u64 {
        self.next_ordinal.fetch_add(1, Ordering::Relaxed)
    }

    pub fn incr_queued(&self, by: i64) {
        self.queued_uri_count.fetch_add(by, Ordering::Relaxed);
    }

    pub fn decr_queued(&self, by: i64) {
        self.queued_uri_count.fetch_sub(by, Ordering::Relaxed);
    }

    pub fn incr_future(&self) {
        self.future_uri_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_future(&self) {
        self.future_uri_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn incr_succeeded(&self) {
        self.succeeded_fetch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed_fetch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_disregarded(&self) {
        self.disregarded_uri_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_processed_bytes(&self, value: u64) {
        self.total_processed_bytes.fetch_add(value, Ordering::Relaxed);
    }

    pub fn queued_uri_count(&self) -> i64 {
        self.queued_uri_count.load(Ordering::Relaxed)
    }

    pub fn future_uri_count(&self) -> i64 {
        self.future_uri_count.load(Ordering::Relaxed)
    }

    pub fn succeeded_fetch_count(&self) -> u64 {
        self.succeeded_fetch_count.load(Ordering::Relaxed)
    }

    pub fn failed_fetch_count(&self) -> u64 {
        self.failed_fetch_count.load(Ordering::Relaxed)
    }

    pub fn disregarded_uri_count(&self) -> u64 {
        self.disregarded_uri_count.load(Ordering::Relaxed)
    }

    pub fn total_processed_bytes(&self) -> u64 {
        self.total_processed_bytes.load(Ordering::Relaxed)
    }

    pub fn finished_uri_count(&self) -> u64 {
        self.succeeded_fetch_count() + self.failed_fetch_count() + self.disregarded_uri_count()
    }

    pub fn succeeded_per_minute(&self) -> u64 {
        let succeeded = self.succeeded_fetch_count();
        let elapsed = (self.elapsed_time() / 60) as u64;
        if elapsed > 0 {
            succeeded / elapsed
        } else {
            0
        }
    }

    pub fn bytes_per_minute(&self) -> u64 {
        let bytes = self.total_processed_bytes();
        let elapsed = (self.elapsed_time() / 60) as u64;
        if elapsed > 0 {
            bytes / elapsed
        } else {
            0
        }
    }

    /// Elapsed time since the frontier was created, in seconds
    pub fn elapsed_time(&self) -> i64 {
        let start_time = self.start_time.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now().naive_utc();
        let elapsed = now - *start_time;
        elapsed.num_seconds()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            next_ordinal: self.next_ordinal.load(Ordering::Relaxed),
            queued_uri_count: self.queued_uri_count(),
            future_uri_count: self.future_uri_count(),
            succeeded_fetch_count: self.succeeded_fetch_count(),
            failed_fetch_count: self.failed_fetch_count(),
            disregarded_uri_count: self.disregarded_uri_count(),
            total_processed_bytes: self.total_processed_bytes(),
        }
    }

    pub fn restore(&self, snapshot: &CounterSnapshot) {
        self.next_ordinal.store(snapshot.next_ordinal, Ordering::Relaxed);
        self.queued_uri_count.store(snapshot.queued_uri_count, Ordering::Relaxed);
        self.future_uri_count.store(snapshot.future_uri_count, Ordering::Relaxed);
        self.succeeded_fetch_count
            .store(snapshot.succeeded_fetch_count, Ordering::Relaxed);
        self.failed_fetch_count
            .store(snapshot.failed_fetch_count, Ordering::Relaxed);
        self.disregarded_uri_count
            .store(snapshot.disregarded_uri_count, Ordering::Relaxed);
        self.total_processed_bytes
            .store(snapshot.total_processed_bytes, Ordering::Relaxed);
        let mut start_time = self.start_time.lock().unwrap_or_else(|e| e.into_inner());
        *start_time = Utc::now().naive_utc();
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
