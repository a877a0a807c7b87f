//! Already-seen filters gating what the frontier schedules.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rocksdb::{IteratorMode, DB};

use crate::config::{Config, StoreKind};
use crate::error::Result;
use crate::uri::CrawlUri;
use crate::util;

/// Destination for URIs a filter accepts.
pub trait UriReceiver {
    fn receive(&self, curi: CrawlUri) -> Result<()>;
}

pub trait UriUniqFilter: Send + Sync {
    /// Pass `curi` to `receiver` only if `canon` has not been seen before.
    ///
    /// Returns whether the URI was accepted.
    fn add(&self, canon: &str, curi: CrawlUri, receiver: &dyn UriReceiver) -> Result<bool>;

    /// Note `canon` as seen and pass `curi` on regardless.
    fn add_force(&self, canon: &str, curi: CrawlUri, receiver: &dyn UriReceiver) -> Result<()>;

    /// Mark as seen without scheduling anything.
    fn note(&self, canon: &str) -> Result<()>;

    fn forget(&self, canon: &str) -> Result<()>;

    /// Number of distinct URIs ever seen.
    fn count(&self) -> u64;

    /// URIs accepted but not yet handed to a receiver.
    fn pending(&self) -> u64 {
        0
    }

    fn request_flush(&self) -> Result<()> {
        Ok(())
    }
}

pub fn open(config: &Config) -> Result<Box<dyn UriUniqFilter>> {
    Ok(match config.uniq {
        StoreKind::Memory => Box::new(SetUniqFilter::new()),
        StoreKind::Rocksdb => {
            std::fs::create_dir_all(&config.data_dir)?;
            let path = Path::new(&config.data_dir).join("uniq");
            Box::new(RocksUniqFilter::open(path)?)
        }
    })
}

#[derive(Default)]
pub struct SetUniqFilter {
    seen: Mutex<HashSet<String>>,
}

impl SetUniqFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, canon: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(canon.to_owned())
    }
}

impl UriUniqFilter for SetUniqFilter {
    fn add(&self, canon: &str, curi: CrawlUri, receiver: &dyn UriReceiver) -> Result<bool> {
        if !self.insert(canon) {
            return Ok(false);
        }
        receiver.receive(curi)?;
        Ok(true)
    }

    fn add_force(&self, canon: &str, curi: CrawlUri, receiver: &dyn UriReceiver) -> Result<()> {
        self.insert(canon);
        receiver.receive(curi)
    }

    fn note(&self, canon: &str) -> Result<()> {
        self.insert(canon);
        Ok(())
    }

    fn forget(&self, canon: &str) -> Result<()> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.remove(canon);
        Ok(())
    }

    fn count(&self) -> u64 {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len() as u64
    }
}

/// Seen set kept in rocksdb; each key maps to the epoch ms it was first
/// seen.
pub struct RocksUniqFilter {
    db: DB,
    count: AtomicU64,
    // serialises check-then-insert
    adding: Mutex<()>,
}

impl RocksUniqFilter {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = DB::open_default(path)?;
        let mut existing = 0;
        for item in db.iterator(IteratorMode::Start) {
            item?;
            existing += 1;
        }
        Ok(Self {
            db,
            count: AtomicU64::new(existing),
            adding: Mutex::new(()),
        })
    }

    fn insert(&self, canon: &str) -> Result<bool> {
        let _guard = self.adding.lock().unwrap_or_else(|e| e.into_inner());
        if self.db.get(canon.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.db.put(canon.as_bytes(), util::now_ms().to_be_bytes())?;
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Epoch ms at which `canon` was first seen.
    pub fn first_seen(&self, canon: &str) -> Result<Option<i64>> {
        Ok(self.db.get(canon.as_bytes())?.and_then(|x| {
            let x: &mut &[u8] = &mut x.as_ref();
            util::read_be_u64(x).map(|v| v as i64)
        }))
    }
}

impl UriUniqFilter for RocksUniqFilter {
    fn add(&self, canon: &str, curi: CrawlUri, receiver: &dyn UriReceiver) -> Result<bool> {
        if !self.insert(canon)? {
            return Ok(false);
        }
        receiver.receive(curi)?;
        Ok(true)
    }

    fn add_force(&self, canon: &str, curi: CrawlUri, receiver: &dyn UriReceiver) -> Result<()> {
        self.insert(canon)?;
        receiver.receive(curi)
    }

    fn note(&self, canon: &str) -> Result<()> {
        self.insert(canon)?;
        Ok(())
    }

    fn forget(&self, canon: &str) -> Result<()> {
        let _guard = self.adding.lock().unwrap_or_else(|e| e.into_inner());
        if self.db.get(canon.as_bytes())?.is_some() {
            self.db.delete(canon.as_bytes())?;
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn request_flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
