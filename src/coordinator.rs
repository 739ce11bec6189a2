//! Coordinator state machine
//!
//! Batches client statements into distributed transactions and drives the
//! participants through the PREPARE/COMMIT/ABORT phases:
//!
//! 1. Client EXECUTEs are forwarded to the addressed participant; after
//!    `batch_size` statements the transaction seals and PREPARE fans out.
//! 2. Votes are tallied as they arrive; the decision is COMMIT iff every
//!    participant voted COMMIT within the timeout, else ABORT.
//! 3. The decision is logged, broadcast, and acknowledged with DONEs;
//!    when all DONEs are in, the transaction's bookkeeping is dropped.
//!
//! The decision log is written before any decision is broadcast, so a
//! crashed coordinator replays the same decision on restart.

use crate::commit_log::CommitLog;
use crate::node::TxnLedger;
use crate::rpc::{Request, RequestHandler, RpcClient};
use crate::types::{NodeId, SqlValue, TransId, TxnStatus, Vote};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Statements per distributed transaction unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Everything guarded by the coordinator's single state lock.
///
/// The vote and done vectors are tied to the ledger by the same lock: for
/// any live transaction both have exactly one slot per participant.
struct CoordinatorInner {
    ledger: TxnLedger,
    current_trans_id: Option<TransId>,
    exec_counter: usize,
    /// Vote per participant, filled by incoming PREPARE replies
    prepared_to_commit: HashMap<TransId, Vec<Option<Vote>>>,
    /// DONE flag per participant
    done: HashMap<TransId, Vec<bool>>,
    /// Signal set once a transaction's vote vector has no unset slots
    prepared_signals: HashMap<TransId, watch::Sender<bool>>,
    /// (trans_id, node_id) pairs already re-sent the decision, so a
    /// rebooting participant cannot loop us
    redelivered: HashSet<(TransId, NodeId)>,
}

impl CoordinatorInner {
    /// Pick the next transaction id: one past the highest id on record,
    /// refusing while that id is still open.
    fn begin_transaction(&mut self) -> Option<TransId> {
        let last = match self.current_trans_id {
            Some(id) => id,
            None => self.ledger.max_trans_id().unwrap_or(0),
        };

        if let Some(status) = self.ledger.status(last) {
            if !status.allows_new_batch() {
                warn!(
                    trans_id = last,
                    "may not begin a new transaction; previous one has not completed"
                );
                return None;
            }
        }

        let trans_id = last + 1;
        self.current_trans_id = Some(trans_id);
        info!(trans_id, "began new distributed transaction");
        Some(trans_id)
    }

    /// Record a vote; returns true when the vector has no unset slots.
    fn set_prepared(&mut self, trans_id: TransId, node_id: NodeId, vote: Vote, n: usize) {
        let complete = {
            let votes = self
                .prepared_to_commit
                .entry(trans_id)
                .or_insert_with(|| vec![None; n]);
            votes[node_id] = Some(vote);
            votes.iter().all(|v| v.is_some())
        };
        if complete {
            if let Some(signal) = self.prepared_signals.get(&trans_id) {
                let _ = signal.send(true);
            }
        }
    }

    /// Record a DONE; returns true when every participant has acknowledged.
    fn set_done(&mut self, trans_id: TransId, node_id: NodeId, n: usize) -> bool {
        let acks = self
            .done
            .entry(trans_id)
            .or_insert_with(|| vec![false; n]);
        acks[node_id] = true;
        acks.iter().all(|&a| a)
    }

    fn persist(&self) {
        self.ledger
            .persist()
            .expect("decision log must remain writable");
    }
}

/// Drives distributed transactions across an ordered list of participants
pub struct Coordinator {
    participants: Vec<RpcClient>,
    timeout: Duration,
    batch_size: usize,
    inner: Mutex<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(
        participants: Vec<RpcClient>,
        log: CommitLog,
        timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Coordinator {
            participants,
            timeout,
            batch_size,
            inner: Mutex::new(CoordinatorInner {
                ledger: TxnLedger::new(log),
                current_trans_id: None,
                exec_counter: 0,
                prepared_to_commit: HashMap::new(),
                done: HashMap::new(),
                prepared_signals: HashMap::new(),
                redelivered: HashSet::new(),
            }),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Create the decision log. Idempotent.
    pub fn setup(&self) -> io::Result<()> {
        self.inner.lock().ledger.initialize()
    }

    /// Replay every logged transaction from its last recorded state. The
    /// RPC server should already be serving so that solicited votes and
    /// DONEs are received. All continuations run concurrently.
    pub async fn recover(self: Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.ledger.load().expect("decision log must be readable");
        }
        let snapshot = self.inner.lock().ledger.snapshot();
        info!(count = snapshot.len(), "recovering transactions from log");

        let mut tasks = Vec::new();
        for (trans_id, status) in snapshot {
            let coordinator = Arc::clone(&self);
            let task = match status {
                TxnStatus::Prepared => tokio::spawn(async move {
                    coordinator.run_prepare_phase(trans_id).await;
                }),
                TxnStatus::Committed => tokio::spawn(async move {
                    info!(trans_id, "re-broadcasting COMMIT after restart");
                    coordinator.send_all(Request::Commit { trans_id }).await;
                }),
                TxnStatus::Aborted => tokio::spawn(async move {
                    info!(trans_id, "re-broadcasting ABORT after restart");
                    coordinator.send_all(Request::Abort { trans_id }).await;
                }),
                _ => continue,
            };
            tasks.push(task);
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Client EXECUTE handler: forward the statement to the addressed
    /// participant and count it into the current batch. Sealing the batch
    /// runs the whole prepare/decide cycle before replying.
    pub async fn recv_client_execute(
        &self,
        node_id: NodeId,
        query: String,
        args: Vec<SqlValue>,
    ) -> bool {
        if node_id >= self.participants.len() {
            warn!(node_id, "EXECUTE for unknown participant");
            return false;
        }

        let trans_id = {
            let mut inner = self.inner.lock();
            if inner.exec_counter == 0 {
                match inner.begin_transaction() {
                    Some(id) => id,
                    None => return false,
                }
            } else {
                match inner.current_trans_id {
                    Some(id) => id,
                    None => {
                        warn!("statement counter out of step with current transaction");
                        return false;
                    }
                }
            }
        };

        let forwarded = self.participants[node_id]
            .send_timeout(&Request::Execute {
                trans_id,
                query: query.clone(),
                args,
            })
            .await;
        if forwarded {
            debug!(trans_id, node_id, %query, "forwarded EXECUTE to participant");
        } else {
            // The statement still counts into the batch: the participant
            // aborted (or never saw) it, and its vote settles the outcome
            // at prepare time.
            warn!(
                trans_id,
                node_id, "EXECUTE did not reach participant or was not successful"
            );
        }

        let sealed = {
            let mut inner = self.inner.lock();
            inner.exec_counter += 1;
            if inner.exec_counter == self.batch_size {
                inner.exec_counter = 0;
                inner.ledger.set_status(trans_id, TxnStatus::Prepared);
                inner.persist();
                true
            } else {
                false
            }
        };

        if sealed {
            self.run_prepare_phase(trans_id).await;
        }
        forwarded
    }

    /// Broadcast PREPARE, wait for the full vote vector (or the timeout),
    /// then log and broadcast the decision.
    async fn run_prepare_phase(&self, trans_id: TransId) {
        let mut all_voted_rx = {
            let mut inner = self.inner.lock();
            let (tx, rx) = watch::channel(false);
            // Votes solicited by a previous incarnation may already be in.
            if let Some(votes) = inner.prepared_to_commit.get(&trans_id) {
                if votes.iter().all(|v| v.is_some()) {
                    let _ = tx.send(true);
                }
            }
            inner.prepared_signals.insert(trans_id, tx);
            rx
        };

        self.send_all(Request::Prepare { trans_id }).await;
        info!(trans_id, "sent PREPARE to all participants");

        let everyone_voted =
            tokio::time::timeout(self.timeout, all_voted_rx.wait_for(|&ready| ready))
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);

        let decision = {
            let mut inner = self.inner.lock();
            inner.prepared_signals.remove(&trans_id);

            let do_commit = everyone_voted
                && inner
                    .prepared_to_commit
                    .get(&trans_id)
                    .map(|votes| votes.iter().all(|v| *v == Some(Vote::Commit)))
                    .unwrap_or(false);

            let decision = if do_commit {
                TxnStatus::Committed
            } else {
                TxnStatus::Aborted
            };
            inner.ledger.set_status(trans_id, decision);
            inner.persist();
            decision
        };

        match decision {
            TxnStatus::Committed => {
                info!(trans_id, "every participant voted COMMIT; committing");
                self.send_all(Request::Commit { trans_id }).await;
            }
            _ => {
                info!(
                    trans_id,
                    "at least one participant voted ABORT or timed out; aborting"
                );
                self.send_all(Request::Abort { trans_id }).await;
            }
        }
    }

    /// Vote arrival. Stragglers voting for an already-decided transaction
    /// get the decision re-sent, once per (trans_id, node_id).
    pub async fn recv_vote(&self, node_id: NodeId, trans_id: TransId, vote: Vote) -> bool {
        if node_id >= self.participants.len() {
            warn!(node_id, "vote from unknown participant");
            return false;
        }

        let resend = {
            let mut inner = self.inner.lock();
            match inner.ledger.status(trans_id) {
                None => {
                    warn!(trans_id, node_id, "PREPARE reply for unknown transaction");
                    return false;
                }
                Some(TxnStatus::Committed) => {
                    info!(
                        trans_id,
                        node_id, "straggler vote for committed transaction"
                    );
                    if inner.redelivered.insert((trans_id, node_id)) {
                        Some(Request::Commit { trans_id })
                    } else {
                        debug!(trans_id, node_id, "decision already re-sent; suppressing");
                        None
                    }
                }
                Some(TxnStatus::Aborted) => {
                    info!(trans_id, node_id, "straggler vote for aborted transaction");
                    if inner.redelivered.insert((trans_id, node_id)) {
                        Some(Request::Abort { trans_id })
                    } else {
                        debug!(trans_id, node_id, "decision already re-sent; suppressing");
                        None
                    }
                }
                Some(TxnStatus::Prepared) => {
                    let n = self.participants.len();
                    inner.set_prepared(trans_id, node_id, vote, n);
                    info!(trans_id, node_id, vote = vote.as_str(), "recorded vote");
                    None
                }
                Some(status) => {
                    warn!(trans_id, node_id, %status, "illegal PREPARE reply");
                    return false;
                }
            }
        };

        if let Some(request) = resend {
            let _ = self.participants[node_id].send_timeout(&request).await;
        }
        true
    }

    /// DONE arrival. Legal only once the transaction is decided; when the
    /// last participant acknowledges, the transaction completes and its
    /// bookkeeping is dropped.
    pub async fn recv_done(&self, node_id: NodeId, trans_id: TransId) -> bool {
        if node_id >= self.participants.len() {
            warn!(node_id, "DONE from unknown participant");
            return false;
        }

        let mut inner = self.inner.lock();
        match inner.ledger.status(trans_id) {
            Some(TxnStatus::Done) => {
                debug!(trans_id, node_id, "DONE for already completed transaction");
                true
            }
            Some(TxnStatus::Committed) | Some(TxnStatus::Aborted) => {
                let n = self.participants.len();
                let everyone_done = inner.set_done(trans_id, node_id, n);
                info!(trans_id, node_id, "received DONE");
                if everyone_done {
                    info!(trans_id, "everyone DONE; completing transaction");
                    inner.ledger.set_status(trans_id, TxnStatus::Done);
                    inner.persist();
                    inner.done.remove(&trans_id);
                    inner.prepared_to_commit.remove(&trans_id);
                    inner.redelivered.retain(|(id, _)| *id != trans_id);
                }
                true
            }
            status => {
                warn!(trans_id, node_id, ?status, "illegal DONE message");
                false
            }
        }
    }

    /// Fan a request out to every participant concurrently and wait for
    /// all of the sends to finish.
    async fn send_all(&self, request: Request) -> Vec<bool> {
        let mut sends = Vec::with_capacity(self.participants.len());
        for participant in &self.participants {
            let participant = participant.clone();
            let request = request.clone();
            sends.push(tokio::spawn(
                async move { participant.send_timeout(&request).await },
            ));
        }

        let mut results = Vec::with_capacity(sends.len());
        for send in sends {
            results.push(send.await.unwrap_or(false));
        }
        results
    }

    /// Current status of a transaction, if known.
    pub fn transaction_status(&self, trans_id: TransId) -> Option<TxnStatus> {
        self.inner.lock().ledger.status(trans_id)
    }

    /// Number of transactions on record.
    pub fn transaction_count(&self) -> usize {
        self.inner.lock().ledger.len()
    }
}

#[async_trait]
impl RequestHandler for Coordinator {
    async fn handle(&self, request: Request) -> bool {
        match request {
            Request::ClientExecute {
                node_id,
                query,
                args,
            } => self.recv_client_execute(node_id, query, args).await,
            Request::Vote {
                node_id,
                trans_id,
                vote,
            } => self.recv_vote(node_id, trans_id, vote).await,
            Request::Done { node_id, trans_id } => self.recv_done(node_id, trans_id).await,
            other => {
                warn!(kind = other.kind(), "unexpected request at coordinator");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// A coordinator whose participants are all unreachable; every
    /// outbound call fails fast.
    fn offline_coordinator(
        dir: &TempDir,
        n: usize,
        batch_size: usize,
    ) -> Arc<Coordinator> {
        let participants = (0..n)
            .map(|_| RpcClient::new("127.0.0.1:9".to_string(), Duration::from_millis(100)))
            .collect();
        let log = CommitLog::new(dir.path().join("coordinator.log"));
        let coordinator = Arc::new(Coordinator::new(
            participants,
            log,
            Duration::from_millis(200),
            batch_size,
        ));
        coordinator.setup().unwrap();
        coordinator
    }

    fn seed_log(dir: &TempDir, entries: &[(TransId, TxnStatus)]) {
        let log = CommitLog::new(dir.path().join("coordinator.log"));
        let map: BTreeMap<TransId, TxnStatus> = entries.iter().copied().collect();
        log.write_all(&map).unwrap();
    }

    #[tokio::test]
    async fn test_vote_for_unknown_transaction_is_ignored() {
        let dir = TempDir::new().unwrap();
        let coordinator = offline_coordinator(&dir, 2, 2);

        assert!(!coordinator.recv_vote(0, 99, Vote::Commit).await);
    }

    #[tokio::test]
    async fn test_done_before_decision_is_illegal() {
        let dir = TempDir::new().unwrap();
        let coordinator = offline_coordinator(&dir, 2, 2);

        assert!(!coordinator.recv_done(0, 99).await);
    }

    #[tokio::test]
    async fn test_vote_from_unknown_node_is_rejected() {
        let dir = TempDir::new().unwrap();
        let coordinator = offline_coordinator(&dir, 2, 2);

        assert!(!coordinator.recv_vote(7, 1, Vote::Commit).await);
        assert!(!coordinator.recv_done(7, 1).await);
    }

    #[tokio::test]
    async fn test_ids_continue_past_logged_maximum() {
        let dir = TempDir::new().unwrap();
        seed_log(&dir, &[(5, TxnStatus::Done)]);

        let coordinator = offline_coordinator(&dir, 1, 1);
        coordinator.clone().recover().await;

        // batch_size 1: the lone statement seals the batch; with its
        // participant unreachable the vote wait times out and the
        // decision is ABORT, under the freshly allocated id 6.
        let ok = coordinator
            .recv_client_execute(0, "insert into data values ('s1', 1)".to_string(), vec![])
            .await;
        assert!(!ok);
        assert_eq!(
            coordinator.transaction_status(6),
            Some(TxnStatus::Aborted)
        );
        assert_eq!(coordinator.transaction_status(5), Some(TxnStatus::Done));
    }

    #[tokio::test]
    async fn test_unreachable_participant_times_out_to_abort() {
        let dir = TempDir::new().unwrap();
        let coordinator = offline_coordinator(&dir, 2, 1);

        let ok = coordinator
            .recv_client_execute(0, "insert into data values ('s1', 1)".to_string(), vec![])
            .await;
        assert!(!ok);
        assert_eq!(
            coordinator.transaction_status(1),
            Some(TxnStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn test_straggler_vote_and_done_after_recovery() {
        let dir = TempDir::new().unwrap();
        seed_log(&dir, &[(3, TxnStatus::Committed)]);

        let coordinator = offline_coordinator(&dir, 1, 1);
        coordinator.clone().recover().await;
        assert_eq!(
            coordinator.transaction_status(3),
            Some(TxnStatus::Committed)
        );

        // A late vote for the decided transaction is answered with a
        // re-sent COMMIT, not treated as an error. The re-send happens
        // only once per node.
        assert!(coordinator.recv_vote(0, 3, Vote::Commit).await);
        assert!(coordinator.recv_vote(0, 3, Vote::Commit).await);

        // The DONE completes the transaction.
        assert!(coordinator.recv_done(0, 3).await);
        assert_eq!(coordinator.transaction_status(3), Some(TxnStatus::Done));

        // Duplicate DONE after completion stays legal.
        assert!(coordinator.recv_done(0, 3).await);
    }

    #[tokio::test]
    async fn test_decisions_survive_in_log() {
        let dir = TempDir::new().unwrap();
        let coordinator = offline_coordinator(&dir, 1, 1);

        let _ = coordinator
            .recv_client_execute(0, "insert into data values ('s1', 1)".to_string(), vec![])
            .await;
        assert_eq!(
            coordinator.transaction_status(1),
            Some(TxnStatus::Aborted)
        );

        // What the next incarnation would read.
        let log = CommitLog::new(dir.path().join("coordinator.log"));
        let entries = log.read_all().unwrap();
        assert_eq!(entries.get(&1), Some(&TxnStatus::Aborted));
    }
}
