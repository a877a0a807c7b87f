//! Ordered byte-keyed storage holding the contents of every work queue.
//!
//! All queues share one store. A queue's items live under the prefix
//! `class_key 0x00`, followed by an 8-byte big-endian ordering word:
//! scheduling directive, then precedence, then a 6-byte ordinal. A forward
//! scan of the prefix therefore yields items in dispatch order.

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, StoreKind};
use crate::error::Result;
use crate::uri::CrawlUri;
use crate::util;

mod mem;
mod rocks;

pub use mem::MemStore;
pub use rocks::RocksStore;

const ORDINAL_MASK: u64 = 0xFFFF_FFFF_FFFF;
const MAX_KEY_PRECEDENCE: i32 = 127;

pub trait QueueStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Lowest key starting with `prefix`, with its value.
    fn first_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Returns whether the key was present.
    fn delete(&self, key: &[u8]) -> Result<bool>;

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn flush(&self) -> Result<()>;
}

/// Open the store the config asks for. The rocksdb store lives under
/// `data_dir/queues`.
pub fn open(config: &Config) -> Result<Arc<dyn QueueStore>> {
    Ok(match config.store {
        StoreKind::Memory => Arc::new(MemStore::new()),
        StoreKind::Rocksdb => {
            std::fs::create_dir_all(&config.data_dir)?;
            let path = Path::new(&config.data_dir).join("queues");
            Arc::new(RocksStore::open(path)?)
        }
    })
}

pub fn queue_prefix(class_key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(class_key.len() + 1);
    prefix.extend_from_slice(class_key.as_bytes());
    prefix.push(0);
    prefix
}

pub fn ordering_word(curi: &CrawlUri) -> u64 {
    let directive = curi.scheduling_directive as u64;
    let precedence = curi.precedence.clamp(0, MAX_KEY_PRECEDENCE) as u64;
    directive << 56 | precedence << 48 | (curi.ordinal & ORDINAL_MASK)
}

pub fn item_key(class_key: &str, curi: &CrawlUri) -> Vec<u8> {
    let mut key = queue_prefix(class_key);
    key.extend_from_slice(&ordering_word(curi).to_be_bytes());
    key
}

/// Split a stored key back into class key and ordering word.
pub fn split_item_key(key: &[u8]) -> Option<(&str, u64)> {
    let nul = key.iter().position(|b| *b == 0)?;
    let class_key = std::str::from_utf8(&key[..nul]).ok()?;
    let mut rest = &key[nul + 1..];
    let word = util::read_be_u64(&mut rest)?;
    Some((class_key, word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::SchedulingDirective;

    fn curi(directive: SchedulingDirective, precedence: i32, ordinal: u64) -> CrawlUri {
        let mut curi = CrawlUri::new("http://a.example/").unwrap();
        curi.scheduling_directive = directive;
        curi.precedence = precedence;
        curi.ordinal = ordinal;
        curi
    }

    #[test]
    fn keys_sort_by_directive_then_precedence_then_ordinal() {
        let high_late = item_key("a", &curi(SchedulingDirective::High, 5, 90));
        let normal_early = item_key("a", &curi(SchedulingDirective::Normal, 1, 1));
        let normal_early_p2 = item_key("a", &curi(SchedulingDirective::Normal, 2, 0));
        let normal_late = item_key("a", &curi(SchedulingDirective::Normal, 1, 2));
        assert!(high_late < normal_early);
        assert!(normal_early < normal_late);
        assert!(normal_late < normal_early_p2);
    }

    #[test]
    fn prefixes_do_not_collide() {
        let a = item_key("a.example", &curi(SchedulingDirective::Normal, 1, 1));
        assert!(a.starts_with(&queue_prefix("a.example")));
        assert!(!a.starts_with(&queue_prefix("a.example+1")));
        assert!(!a.starts_with(&queue_prefix("a.exampl")));
    }

    #[test]
    fn split_recovers_parts() {
        let key = item_key("b.example", &curi(SchedulingDirective::Medium, 300, 7));
        let (class_key, word) = split_item_key(&key).unwrap();
        assert_eq!(class_key, "b.example");
        assert_eq!(word >> 56, 2);
        assert_eq!((word >> 48) & 0xFF, 127);
        assert_eq!(word & ORDINAL_MASK, 7);
    }
}
