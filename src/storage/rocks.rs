use std::path::Path;

use rocksdb::{Direction, IteratorMode, DB};

use super::QueueStore;
use crate::error::Result;

/// Disk-backed store on rocksdb.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = DB::open_default(path)?;
        Ok(Self { db })
    }
}

impl QueueStore for RocksStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn first_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.starts_with(prefix) {
                    Ok(Some((key.to_vec(), value.to_vec())))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        if self.db.get(key)?.is_none() {
            return Ok(false);
        }
        self.db.delete(key)?;
        Ok(true)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut found = vec![];
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push((key.to_vec(), value.to_vec()));
        }
        Ok(found)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.put(b"q\x00\x02", b"second").unwrap();
            store.put(b"q\x00\x01", b"first").unwrap();
            store.put(b"r\x00\x01", b"other").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        let (_, value) = store.first_with_prefix(b"q\x00").unwrap().unwrap();
        assert_eq!(value, b"first");
        assert_eq!(store.scan_prefix(b"q\x00").unwrap().len(), 2);
        assert!(store.delete(b"q\x00\x01").unwrap());
        assert!(!store.delete(b"q\x00\x01").unwrap());
        let (_, value) = store.first_with_prefix(b"q\x00").unwrap().unwrap();
        assert_eq!(value, b"second");
    }
}
