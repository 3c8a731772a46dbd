//! Incoming raft RPCs.
//!
//! An axum router that feeds requests into the local engine and returns the
//! engine's `Result` as JSON. Accepted replication from a leader refreshes the
//! `LeaderContact` clock, which is what the reconciler's staleness check reads.

use super::network::{APPEND_PATH, SNAPSHOT_PATH, VOTE_PATH};
use super::typ::{NodeId, ScoutRaft, TypeConfig};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for in-flight requests before aborting the task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// When a leader last reached this node.
#[derive(Debug, Clone)]
pub struct LeaderContact(Arc<Mutex<Instant>>);

impl LeaderContact {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }
}

impl Default for LeaderContact {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct RpcState {
    raft: ScoutRaft,
    contact: LeaderContact,
}

/// Running RPC listener.
pub struct RaftServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RaftServer {
    /// Start serving on an already bound listener.
    pub fn serve(listener: TcpListener, raft: ScoutRaft, contact: LeaderContact) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let app = router(RpcState { raft, contact });
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Raft RPC server error: {}", e);
            }
        });

        info!("Raft RPC server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and release the port.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.handle).await.is_err() {
            warn!("Raft RPC server did not stop in time, aborting");
            abort.abort();
            let _ = self.handle.await;
        }
        debug!("Raft RPC server on {} stopped", self.local_addr);
    }
}

fn router(state: RpcState) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(snapshot))
        .with_state(state)
}

async fn append(
    State(state): State<RpcState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    let result = state.raft.append_entries(req).await;
    if matches!(
        &result,
        Ok(resp) if !matches!(resp, AppendEntriesResponse::HigherVote(_))
    ) {
        state.contact.touch();
    }
    Json(result)
}

async fn vote(
    State(state): State<RpcState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.raft.vote(req).await)
}

async fn snapshot(
    State(state): State<RpcState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    let result = state.raft.install_snapshot(req).await;
    if result.is_ok() {
        state.contact.touch();
    }
    Json(result)
}
