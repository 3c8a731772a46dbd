//! Raft state machine wrapper.
//!
//! Tracks what the engine needs (last applied id, last membership) and hands
//! normal entries to the pluggable `scout_core::StateMachine`. Only the latest
//! snapshot is persisted; on open the application state is restored from it
//! and the engine replays committed entries past it.

use super::storage::{self, SNAPSHOT_KEY, StoreError};
use super::typ::{NodeId, Response, TypeConfig};
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend,
    RaftSnapshotBuilder, SnapshotMeta, StorageError, StoredMembership,
};
use redb::Database;
use scout_core::StateMachine;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Applied {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_idx: u64,
    current_snapshot: Option<StoredSnapshot>,
}

#[derive(Clone)]
pub struct StateMachineStore {
    db: Arc<Database>,
    app: Arc<dyn StateMachine>,
    applied: Arc<Mutex<Applied>>,
}

impl StateMachineStore {
    /// Restore from the persisted snapshot, if any.
    pub fn open(db: Arc<Database>, app: Arc<dyn StateMachine>) -> Result<Self, StoreError> {
        let mut applied = Applied::default();
        if let Some(snapshot) = storage::read_meta::<StoredSnapshot>(&db, SNAPSHOT_KEY)? {
            app.restore(&snapshot.data).map_err(StoreError::Restore)?;
            info!(
                "Restored state machine from snapshot {}",
                snapshot.meta.snapshot_id
            );
            applied.last_applied = snapshot.meta.last_log_id;
            applied.last_membership = snapshot.meta.last_membership.clone();
            applied.current_snapshot = Some(snapshot);
        }
        Ok(Self {
            db,
            app,
            applied: Arc::new(Mutex::new(applied)),
        })
    }

    fn applied(&self) -> MutexGuard<'_, Applied> {
        self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), StorageError<NodeId>> {
        storage::write_meta(&self.db, SNAPSHOT_KEY, snapshot).map_err(|e| {
            e.into_storage(
                ErrorSubject::Snapshot(Some(snapshot.meta.signature())),
                ErrorVerb::Write,
            )
        })
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self.app.snapshot();
        let stored = {
            let mut applied = self.applied();
            applied.snapshot_idx += 1;
            let snapshot_id = match applied.last_applied {
                Some(last) => format!("{}-{}-{}", last.leader_id, last.index, applied.snapshot_idx),
                None => format!("--{}", applied.snapshot_idx),
            };
            StoredSnapshot {
                meta: SnapshotMeta {
                    last_log_id: applied.last_applied,
                    last_membership: applied.last_membership.clone(),
                    snapshot_id,
                },
                data,
            }
        };

        self.save_snapshot(&stored)?;
        debug!("Built snapshot {}", stored.meta.snapshot_id);
        self.applied().current_snapshot = Some(stored.clone());

        Ok(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let applied = self.applied();
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut replies = Vec::new();
        let mut applied = self.applied();

        for entry in entries {
            applied.last_applied = Some(entry.log_id);
            match entry.payload {
                EntryPayload::Blank => replies.push(Response::default()),
                EntryPayload::Normal(request) => {
                    let out = self.app.apply(entry.log_id.index, &request.0);
                    replies.push(Response(out));
                }
                EntryPayload::Membership(membership) => {
                    applied.last_membership = StoredMembership::new(Some(entry.log_id), membership);
                    replies.push(Response::default());
                }
            }
        }
        Ok(replies)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        self.app.restore(&stored.data).map_err(|e| {
            StoreError::Restore(e).into_storage(
                ErrorSubject::Snapshot(Some(meta.signature())),
                ErrorVerb::Read,
            )
        })?;
        self.save_snapshot(&stored)?;

        info!("Installed snapshot {}", meta.snapshot_id);
        let mut applied = self.applied();
        applied.last_applied = meta.last_log_id;
        applied.last_membership = meta.last_membership.clone();
        applied.current_snapshot = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let applied = self.applied();
        Ok(applied.current_snapshot.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}
