//! Pact - Two-Phase Commit Engine
//!
//! A classical 2PC coordinator/participant system over independent
//! transactional data nodes. A client submits statements addressed to
//! named participants through a single coordinator; the coordinator
//! batches them into distributed transactions and drives the participants
//! through PREPARE/COMMIT/ABORT, recovering in-flight transactions from a
//! durable decision log after a crash.
//!
//! # Architecture
//!
//! - RPC Layer: length-framed request/response over TCP with Tokio
//! - Log Layer: atomic snapshot of every transaction's decided status
//! - Store Layer: embedded single-table store with prepared transactions
//! - Coordinator: batching, vote tally, decision, DONE collection
//! - Participant: mirror state machine driving the local store

pub mod commit_log;
pub mod coordinator;
pub mod node;
pub mod participant;
pub mod rpc;
pub mod sql;
pub mod store;
pub mod types;

pub use commit_log::CommitLog;
pub use coordinator::{Coordinator, DEFAULT_BATCH_SIZE};
pub use node::TxnLedger;
pub use participant::Participant;
pub use rpc::{Reply, Request, RequestHandler, RpcClient, RpcError, RpcServer};
pub use sql::{SqlError, Statement};
pub use store::{RowOp, SqlStore, StoreError};
pub use types::{NodeAddress, NodeId, SqlValue, TransId, TxnStatus, Vote, DEFAULT_PORT};
