//! Participant state machine
//!
//! Mirrors the coordinator's transaction lifecycle against the local
//! store: statements arrive as EXECUTEs into a BEGUN transaction, PREPARE
//! turns it into a named prepared transaction and votes, COMMIT/ABORT
//! finalize it and acknowledge with DONE.
//!
//! State per transaction: BEGUN -> PREPARED -> {COMMITTED, ABORTED}.
//! Every transition at or past PREPARED is persisted to the decision log
//! before the store is touched, so a crash can always be replayed.

use crate::commit_log::CommitLog;
use crate::node::TxnLedger;
use crate::rpc::{Request, RequestHandler, RpcClient};
use crate::store::{SqlStore, StoreError};
use crate::types::{NodeId, SqlValue, TransId, TxnStatus, Vote};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything guarded by the participant's single state lock
struct ParticipantInner {
    ledger: TxnLedger,
    current_trans_id: Option<TransId>,
    store: SqlStore,
}

impl ParticipantInner {
    /// Open a local transaction for `trans_id`. Refuses ids that already
    /// ran past BEGUN; a superseded BEGUN transaction is aborted first.
    fn begin(&mut self, trans_id: TransId) -> bool {
        if self.current_trans_id == Some(trans_id) {
            return true;
        }
        if let Some(status) = self.ledger.status(trans_id) {
            if status != TxnStatus::Begun {
                warn!(
                    trans_id,
                    status = %status,
                    "refusing to reopen a transaction that is already past BEGUN"
                );
                return false;
            }
        }

        if let Some(previous_id) = self.current_trans_id {
            if self.ledger.status(previous_id) == Some(TxnStatus::Begun) {
                info!(previous_id, "aborting begun transaction superseded by a new one");
                self.do_abort(previous_id);
            }
        }

        if let Err(e) = self.store.begin() {
            warn!(trans_id, error = %e, "BEGIN failed in store");
            return false;
        }
        self.ledger.set_status(trans_id, TxnStatus::Begun);
        self.current_trans_id = Some(trans_id);
        debug!(trans_id, "began new local transaction");
        true
    }

    /// Idempotently abort `trans_id`: no-op when already aborted, refused
    /// when already committed. Rolls the store back according to how far
    /// the transaction got.
    fn do_abort(&mut self, trans_id: TransId) {
        let prior = self.ledger.status(trans_id);
        match prior {
            Some(TxnStatus::Aborted) => {
                debug!(trans_id, "abort already recorded");
                return;
            }
            Some(TxnStatus::Committed) => {
                warn!(trans_id, "cannot abort an already committed transaction");
                return;
            }
            _ => {}
        }

        self.ledger.set_status(trans_id, TxnStatus::Aborted);
        self.ledger
            .persist()
            .expect("decision log must remain writable");

        let result = match prior {
            Some(TxnStatus::Prepared) => self.store.rollback_prepared(&trans_id.to_string()),
            Some(TxnStatus::Begun) => {
                self.store.rollback();
                Ok(())
            }
            // Nothing ever reached the store for this id.
            _ => Ok(()),
        };
        match result {
            Ok(()) => info!(trans_id, "aborted transaction in store"),
            Err(StoreError::UnknownGid(_)) => {
                debug!(trans_id, "rollback for already-finalized prepared transaction")
            }
            Err(e) => warn!(trans_id, error = %e, "store rollback failed"),
        }

        if self.current_trans_id == Some(trans_id) {
            self.current_trans_id = None;
        }
    }

    fn persist(&self) {
        self.ledger
            .persist()
            .expect("decision log must remain writable");
    }
}

/// A transactional data node driven by the coordinator
pub struct Participant {
    node_id: NodeId,
    coordinator: RpcClient,
    inner: Mutex<ParticipantInner>,
}

impl Participant {
    pub fn new(node_id: NodeId, coordinator: RpcClient, store: SqlStore, log: CommitLog) -> Self {
        Participant {
            node_id,
            coordinator,
            inner: Mutex::new(ParticipantInner {
                ledger: TxnLedger::new(log),
                current_trans_id: None,
                store,
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Create the decision log. The data table itself is fixed-schema and
    /// exists as soon as the store is opened.
    pub fn setup(&self) -> io::Result<()> {
        self.inner.lock().ledger.initialize()
    }

    /// Replay every logged transaction from its last recorded state. Each
    /// continuation re-runs the idempotent handler for that state; all of
    /// them run concurrently.
    pub async fn recover(self: Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.ledger.load().expect("decision log must be readable");
        }
        let snapshot = self.inner.lock().ledger.snapshot();
        info!(count = snapshot.len(), "recovering transactions from log");

        let mut tasks = Vec::new();
        for (trans_id, status) in snapshot {
            let node = Arc::clone(&self);
            let task = match status {
                TxnStatus::Prepared => tokio::spawn(async move {
                    node.recv_prepare(trans_id).await;
                }),
                TxnStatus::Committed => tokio::spawn(async move {
                    node.recv_commit(trans_id).await;
                }),
                TxnStatus::Aborted => tokio::spawn(async move {
                    node.recv_abort(trans_id).await;
                }),
                _ => continue,
            };
            tasks.push(task);
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// EXECUTE handler: run one statement inside the transaction,
    /// beginning it if this id is new. A store failure aborts the whole
    /// transaction locally.
    pub async fn recv_execute(&self, trans_id: TransId, query: &str, args: &[SqlValue]) -> bool {
        let mut inner = self.inner.lock();

        if inner.current_trans_id != Some(trans_id) && !inner.begin(trans_id) {
            return false;
        }

        match inner.store.execute(query, args) {
            Ok(()) => {
                debug!(trans_id, query, "executed statement");
                true
            }
            Err(e) => {
                warn!(trans_id, query, error = %e, "EXECUTE failed in store; aborting");
                inner.do_abort(trans_id);
                false
            }
        }
    }

    /// PREPARE handler: prepare the local transaction and vote. Replies
    /// are idempotent for transactions already PREPARED or ABORTED; a
    /// PREPARE for a COMMITTED transaction is a protocol error.
    pub async fn recv_prepare(&self, trans_id: TransId) -> bool {
        let (ok, vote) = {
            let mut inner = self.inner.lock();
            match inner.ledger.status(trans_id) {
                Some(TxnStatus::Prepared) => {
                    debug!(trans_id, "re-voting COMMIT for prepared transaction");
                    (true, Some(Vote::Commit))
                }
                Some(TxnStatus::Aborted) => {
                    debug!(trans_id, "re-voting ABORT for aborted transaction");
                    (true, Some(Vote::Abort))
                }
                Some(TxnStatus::Committed) | Some(TxnStatus::Done) => {
                    warn!(
                        trans_id,
                        "invalid PREPARE; coordinator already decided commit"
                    );
                    (false, None)
                }
                status @ (Some(TxnStatus::Begun) | None) => {
                    // An id we never saw an EXECUTE for prepares an empty
                    // transaction.
                    if status.is_none() && !inner.begin(trans_id) {
                        return false;
                    }
                    match inner.store.prepare_transaction(&trans_id.to_string()) {
                        Ok(()) => {
                            inner.ledger.set_status(trans_id, TxnStatus::Prepared);
                            inner.persist();
                            inner.current_trans_id = None;
                            info!(trans_id, "prepared transaction; voting COMMIT");
                            (true, Some(Vote::Commit))
                        }
                        Err(e) => {
                            warn!(trans_id, error = %e, "PREPARE failed in store");
                            inner.do_abort(trans_id);
                            (false, Some(Vote::Abort))
                        }
                    }
                }
            }
        };

        if let Some(vote) = vote {
            let sent = self
                .coordinator
                .send_timeout(&Request::Vote {
                    node_id: self.node_id,
                    trans_id,
                    vote,
                })
                .await;
            if !sent {
                debug!(trans_id, vote = vote.as_str(), "vote did not reach coordinator");
            }
        }
        ok
    }

    /// COMMIT handler: legal only for PREPARED or COMMITTED transactions.
    /// The log is written before the store; a missing gid means a prior
    /// incarnation already committed and is swallowed.
    pub async fn recv_commit(&self, trans_id: TransId) -> bool {
        let ok = {
            let mut inner = self.inner.lock();
            match inner.ledger.status(trans_id) {
                Some(TxnStatus::Prepared) | Some(TxnStatus::Committed) => {
                    inner.ledger.set_status(trans_id, TxnStatus::Committed);
                    inner.persist();
                    match inner.store.commit_prepared(&trans_id.to_string()) {
                        Ok(()) => info!(trans_id, "committed prepared transaction"),
                        Err(StoreError::UnknownGid(_)) => {
                            debug!(trans_id, "redundant COMMIT; already committed")
                        }
                        Err(e) => warn!(trans_id, error = %e, "store commit failed"),
                    }
                    true
                }
                status => {
                    warn!(trans_id, ?status, "received illegal COMMIT");
                    false
                }
            }
        };

        if ok {
            self.send_done(trans_id).await;
        }
        ok
    }

    /// ABORT handler: legal only for PREPARED or ABORTED transactions.
    pub async fn recv_abort(&self, trans_id: TransId) -> bool {
        let ok = {
            let mut inner = self.inner.lock();
            match inner.ledger.status(trans_id) {
                Some(TxnStatus::Prepared) | Some(TxnStatus::Aborted) => {
                    inner.do_abort(trans_id);
                    true
                }
                status => {
                    warn!(trans_id, ?status, "received illegal ABORT");
                    false
                }
            }
        };

        if ok {
            self.send_done(trans_id).await;
        }
        ok
    }

    async fn send_done(&self, trans_id: TransId) {
        let sent = self
            .coordinator
            .send_timeout(&Request::Done {
                node_id: self.node_id,
                trans_id,
            })
            .await;
        if sent {
            debug!(trans_id, "sent DONE to coordinator");
        } else {
            debug!(trans_id, "DONE did not reach coordinator");
        }
    }

    /// Current status of a transaction, if known.
    pub fn transaction_status(&self, trans_id: TransId) -> Option<TxnStatus> {
        self.inner.lock().ledger.status(trans_id)
    }

    /// Committed value in the local data table.
    pub fn data_value(&self, sensor_id: &str) -> Option<i64> {
        self.inner.lock().store.get(sensor_id)
    }

    /// Number of committed rows in the local data table.
    pub fn data_rows(&self) -> usize {
        self.inner.lock().store.row_count()
    }
}

#[async_trait]
impl RequestHandler for Participant {
    async fn handle(&self, request: Request) -> bool {
        match request {
            Request::Execute {
                trans_id,
                query,
                args,
            } => self.recv_execute(trans_id, &query, &args).await,
            Request::Prepare { trans_id } => self.recv_prepare(trans_id).await,
            Request::Commit { trans_id } => self.recv_commit(trans_id).await,
            Request::Abort { trans_id } => self.recv_abort(trans_id).await,
            other => {
                warn!(kind = other.kind(), "unexpected request at participant");
                false
            }
        }
    }
}
