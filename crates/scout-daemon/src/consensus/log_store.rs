//! Raft log storage backed by redb.
//!
//! Every write goes to disk before it is acknowledged; reads are served from an
//! in-memory mirror loaded at open. The store is `Clone` so the engine and the
//! owner can hold it at the same time, which lets a reset rebuild the engine
//! on top of the same durable log.

use super::storage::{
    self, COMMITTED_KEY, LAST_PURGED_KEY, LOGS, StoreError, VOTE_KEY,
};
use super::typ::{NodeId, TypeConfig};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Membership, OptionalSend,
    RaftLogReader, StorageError, Vote,
};
use redb::Database;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct LogCache {
    logs: BTreeMap<u64, Entry<TypeConfig>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
}

impl LogCache {
    fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.logs
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(self.last_purged)
    }
}

#[derive(Clone)]
pub struct LogStore {
    db: Arc<Database>,
    cache: Arc<Mutex<LogCache>>,
}

impl LogStore {
    /// Load the log from `db`.
    pub fn open(db: Arc<Database>) -> Result<Self, StoreError> {
        let mut cache = LogCache {
            vote: storage::read_meta(&db, VOTE_KEY)?,
            committed: storage::read_meta(&db, COMMITTED_KEY)?,
            last_purged: storage::read_meta(&db, LAST_PURGED_KEY)?,
            ..Default::default()
        };
        for (index, entry) in storage::read_log_range::<Entry<TypeConfig>>(&db)? {
            cache.logs.insert(index, entry);
        }
        debug!(
            "Opened log store: {} entries, last {:?}",
            cache.logs.len(),
            cache.last_log_id()
        );

        Ok(Self {
            db,
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    fn cache(&self) -> MutexGuard<'_, LogCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when nothing was ever written: no entries, no vote.
    pub fn is_pristine(&self) -> bool {
        let cache = self.cache();
        cache.last_log_id().is_none() && cache.vote.is_none()
    }

    pub fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.cache().last_log_id()
    }

    /// Force the configuration down to `node_id` alone.
    ///
    /// Appends a membership entry right after the last log id, reusing its
    /// leader id, so a freshly built engine sees a single-voter configuration
    /// and elects itself. Returns false when the log is empty and there is
    /// nothing to recover; the caller should initialize instead.
    pub fn recover_single_member(&self, node_id: NodeId, node: BasicNode) -> Result<bool, StoreError> {
        let Some(last) = self.last_log_id() else {
            return Ok(false);
        };

        let membership = Membership::new(
            vec![BTreeSet::from([node_id])],
            BTreeMap::from([(node_id, node)]),
        );
        let entry = Entry::<TypeConfig> {
            log_id: LogId::new(last.leader_id, last.index + 1),
            payload: EntryPayload::Membership(membership),
        };
        info!("Recovering single-member configuration at index {}", entry.log_id.index);
        self.persist_entries(vec![entry])?;
        Ok(true)
    }

    fn persist_entries(&self, entries: Vec<Entry<TypeConfig>>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOGS)?;
            for entry in &entries {
                let bytes = serde_json::to_vec(entry)?;
                table.insert(entry.log_id.index, bytes.as_slice())?;
            }
        }
        txn.commit()?;

        let mut cache = self.cache();
        for entry in entries {
            cache.logs.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    /// Remove every entry whose index falls in `range` (disk first, then cache).
    fn delete_range(&self, range: impl RangeBounds<u64> + Clone) -> Result<(), StoreError> {
        let indexes: Vec<u64> = self.cache().logs.range(range).map(|(i, _)| *i).collect();
        if indexes.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOGS)?;
            for index in &indexes {
                table.remove(*index)?;
            }
        }
        txn.commit()?;

        let mut cache = self.cache();
        for index in indexes {
            cache.logs.remove(&index);
        }
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let cache = self.cache();
        Ok(cache.logs.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let cache = self.cache();
        Ok(LogState {
            last_purged_log_id: cache.last_purged,
            last_log_id: cache.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        storage::write_meta(&self.db, VOTE_KEY, vote)
            .map_err(|e| e.into_storage(ErrorSubject::Vote, ErrorVerb::Write))?;
        self.cache().vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.cache().vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        let result = match &committed {
            Some(log_id) => storage::write_meta(&self.db, COMMITTED_KEY, log_id),
            None => storage::remove_meta(&self.db, COMMITTED_KEY),
        };
        result.map_err(|e| e.into_storage(ErrorSubject::Store, ErrorVerb::Write))?;
        self.cache().committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.cache().committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        self.persist_entries(entries)
            .map_err(|e| e.into_storage(ErrorSubject::Logs, ErrorVerb::Write))?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("Truncating log from {}", log_id.index);
        self.delete_range(log_id.index..)
            .map_err(|e| e.into_storage(ErrorSubject::Logs, ErrorVerb::Delete))
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("Purging log up to {}", log_id.index);
        storage::write_meta(&self.db, LAST_PURGED_KEY, &log_id)
            .map_err(|e| e.into_storage(ErrorSubject::Store, ErrorVerb::Write))?;
        self.cache().last_purged = Some(log_id);
        self.delete_range(..=log_id.index)
            .map_err(|e| e.into_storage(ErrorSubject::Logs, ErrorVerb::Delete))
    }
}
