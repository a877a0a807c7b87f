use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frontier::lifecycle::{LifecycleSnapshot, QueueLifecycle};
use crate::frontier::work_queue::WorkQueue;
use crate::frontier::{lock_queue, WorkQueueFrontier};
use crate::stats::CounterSnapshot;

pub const COUNTERS_FILENAME: &str = "frontier.json";
pub const QUEUES_FILENAME: &str = "queues.json";

#[derive(Serialize, Deserialize)]
struct QueuesSnapshot {
    queues: Vec<WorkQueue>,
    lifecycle: LifecycleSnapshot,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

impl WorkQueueFrontier {
    /// Write counters and queue state to `dir` and flush the journal, store
    /// and uniqueness filter. Waits for in-flight dispositions to complete.
    ///
    /// Queue contents stay in the store; a restore needs the same store.
    pub fn checkpoint<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let _disposition = self.disposition.write().unwrap_or_else(|e| e.into_inner());
        let lc = self.lock_lifecycle();
        let counters = self.stats.snapshot();
        let mut queues: Vec<WorkQueue> = self
            .all_queues()
            .iter()
            .map(|queue| lock_queue(queue).clone())
            .collect();
        queues.sort_by(|a, b| a.class_key().cmp(b.class_key()));
        let count = queues.len();
        let snapshot = QueuesSnapshot {
            queues,
            lifecycle: lc.snapshot(),
        };

        write_json(&dir.join(COUNTERS_FILENAME), &counters)?;
        write_json(&dir.join(QUEUES_FILENAME), &snapshot)?;
        self.flush()?;
        log::info!("checkpointed {} queues to {:?}", count, dir);
        Ok(())
    }

    /// Replace counters and queue state with a checkpoint written by
    /// [`checkpoint`](Self::checkpoint). Queues that were in process go
    /// back to ready.
    pub fn restore<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let counters: CounterSnapshot = read_json(&dir.join(COUNTERS_FILENAME))?;
        let snapshot: QueuesSnapshot = read_json(&dir.join(QUEUES_FILENAME))?;

        let _disposition = self.disposition.write().unwrap_or_else(|e| e.into_inner());
        let mut lc = self.lock_lifecycle();
        let count = snapshot.queues.len();
        {
            let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
            *queues = snapshot
                .queues
                .into_iter()
                .map(|wq| (wq.class_key().to_owned(), Arc::new(Mutex::new(wq))))
                .collect::<HashMap<_, _>>();
        }
        *lc = QueueLifecycle::from_snapshot(snapshot.lifecycle);
        self.stats.restore(&counters);
        log::info!(
            "restored {} queues, {} URIs queued, from {:?}",
            count,
            counters.queued_uri_count,
            dir
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::Config;
    use crate::frontier::{QueueState, WorkQueueFrontier};
    use crate::storage::{MemStore, QueueStore};
    use crate::uri::CrawlUri;

    fn frontier(store: Arc<dyn QueueStore>) -> WorkQueueFrontier {
        WorkQueueFrontier::builder(Config {
            recovery_log_enabled: false,
            ..Config::default()
        })
        .store(store)
        .build()
        .unwrap()
    }

    #[test]
    fn restore_resumes_where_checkpoint_left_off() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(MemStore::new());

        let before = frontier(store.clone());
        for uri in ["http://a.example/1", "http://a.example/2", "http://b.example/1"] {
            before.schedule(CrawlUri::new(uri).unwrap()).unwrap();
        }
        let in_hand = before.find_eligible_uri().unwrap().unwrap();
        assert_eq!(in_hand.uri(), "http://a.example/1");
        before.checkpoint(dir.path()).unwrap();
        assert!(dir.path().join(super::COUNTERS_FILENAME).exists());

        let after = frontier(store);
        after.restore(dir.path()).unwrap();
        assert_eq!(after.queued_uri_count(), 3);
        assert_eq!(after.queue_state("a.example"), Some(QueueState::Ready));
        assert_eq!(after.queue_state("b.example"), Some(QueueState::Inactive(3)));
        assert!(after.consistency_check().is_clean());

        // the unfinished head is handed out again
        let again = after.find_eligible_uri().unwrap().unwrap();
        assert_eq!(again.uri(), "http://a.example/1");
        assert!(after.stats().take_ordinal() > in_hand.ordinal);
    }
}
