//! Core type definitions for the two-phase commit protocol

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transaction identifier, allocated by the coordinator.
///
/// Monotonically increasing within a coordinator incarnation and
/// non-decreasing across restarts (the next id is one greater than the
/// maximum id found in the decision log).
pub type TransId = u64;

/// Zero-based dense index into the coordinator's ordered participant list
pub type NodeId = usize;

/// Default RPC port when an address is given without one
pub const DEFAULT_PORT: u16 = 12345;

/// Transaction status (same vocabulary on both roles, subset per role)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Local store transaction open, nothing durable yet (participant only, never logged)
    Begun,
    /// Prepared and waiting for the decision
    Prepared,
    /// Decision: commit
    Committed,
    /// Decision: abort
    Aborted,
    /// All participants acknowledged the decision (coordinator only)
    Done,
}

impl TxnStatus {
    /// Short string form used in the decision log
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnStatus::Begun => "BEGUN",
            TxnStatus::Prepared => "PREPARED",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::Aborted => "ABORTED",
            TxnStatus::Done => "DONE",
        }
    }

    /// A decided or sealed status; a new batch may begin after this one
    pub fn allows_new_batch(&self) -> bool {
        matches!(
            self,
            TxnStatus::Done | TxnStatus::Prepared | TxnStatus::Committed | TxnStatus::Aborted
        )
    }
}

impl FromStr for TxnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BEGUN" => Ok(TxnStatus::Begun),
            "PREPARED" => Ok(TxnStatus::Prepared),
            "COMMITTED" => Ok(TxnStatus::Committed),
            "ABORTED" => Ok(TxnStatus::Aborted),
            "DONE" => Ok(TxnStatus::Done),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant's PREPARE reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort,
}

impl Vote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Commit => "COMMIT",
            Vote::Abort => "ABORT",
        }
    }
}

/// Statement argument values (heterogeneous types)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Text(String),
    Int(i64),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Text(s) => write!(f, "'{}'", s),
            SqlValue::Int(v) => write!(f, "{}", v),
        }
    }
}

/// Network address of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    /// Parse `host:port`; a bare host gets the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(format!("empty host in address: {}", s));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|e| format!("bad port in address {}: {}", s, e))?;
                Ok(NodeAddress::new(host.to_string(), port))
            }
            None if !s.is_empty() => Ok(NodeAddress::new(s.to_string(), DEFAULT_PORT)),
            None => Err("empty address".to_string()),
        }
    }
}
