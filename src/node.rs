//! Shared node state
//!
//! Both roles keep an in-memory `trans_id -> status` table mirrored to the
//! durable decision log. `TxnLedger` owns that pair; the coordinator and
//! participant embed one inside their state lock.

use crate::commit_log::CommitLog;
use crate::types::{TransId, TxnStatus};
use std::collections::BTreeMap;
use std::io;

pub struct TxnLedger {
    transactions: BTreeMap<TransId, TxnStatus>,
    log: CommitLog,
}

impl TxnLedger {
    pub fn new(log: CommitLog) -> Self {
        TxnLedger {
            transactions: BTreeMap::new(),
            log,
        }
    }

    /// Create the backing log file if needed. Idempotent.
    pub fn initialize(&self) -> io::Result<()> {
        self.log.initialize()
    }

    pub fn status(&self, trans_id: TransId) -> Option<TxnStatus> {
        self.transactions.get(&trans_id).copied()
    }

    pub fn set_status(&mut self, trans_id: TransId, status: TxnStatus) {
        self.transactions.insert(trans_id, status);
    }

    /// Reconcile the log to the in-memory table. `Begun` is volatile and
    /// never written.
    pub fn persist(&self) -> io::Result<()> {
        let durable: BTreeMap<TransId, TxnStatus> = self
            .transactions
            .iter()
            .filter(|(_, status)| !matches!(status, TxnStatus::Begun))
            .map(|(&id, &status)| (id, status))
            .collect();
        self.log.write_all(&durable)
    }

    /// Replace the in-memory table with the log contents.
    pub fn load(&mut self) -> io::Result<()> {
        self.transactions = self.log.read_all()?;
        Ok(())
    }

    /// Highest transaction id on record, if any.
    pub fn max_trans_id(&self) -> Option<TransId> {
        self.transactions.keys().next_back().copied()
    }

    pub fn snapshot(&self) -> BTreeMap<TransId, TxnStatus> {
        self.transactions.clone()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
