//! Crash Recovery Tests
//!
//! Rebuilds nodes over pre-seeded decision logs and stores, the state a
//! crash would leave behind, and checks that recovery replays every
//! transaction to the same final outcome.

use pact_core::*;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(2);

fn seed_log(path: &Path, entries: &[(TransId, TxnStatus)]) {
    let log = CommitLog::new(path);
    let map: BTreeMap<TransId, TxnStatus> = entries.iter().copied().collect();
    log.write_all(&map).unwrap();
}

/// Leave a store the way a crashed participant would: a prepared
/// transaction named after the trans id, holding one insert.
fn seed_prepared_store(path: &Path, gid: &str, sensor_id: &str, measurement: i64) {
    let mut store = SqlStore::open(path).unwrap();
    store.begin().unwrap();
    store
        .execute(
            &format!(
                "insert into data values ('{}', {})",
                sensor_id, measurement
            ),
            &[],
        )
        .unwrap();
    store.prepare_transaction(gid).unwrap();
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

struct RecoveredPair {
    coordinator: Arc<Coordinator>,
    participant: Arc<Participant>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Start a one-participant cluster over whatever state is already on
/// disk, participant recovery first, then coordinator recovery.
async fn restart_pair(dir: &TempDir) -> RecoveredPair {
    let coordinator_server = RpcServer::bind("127.0.0.1:0").await.unwrap();
    let coordinator_addr = coordinator_server.local_addr().to_string();
    let participant_server = RpcServer::bind("127.0.0.1:0").await.unwrap();
    let participant_addr = participant_server.local_addr().to_string();

    let coordinator = Arc::new(Coordinator::new(
        vec![RpcClient::new(participant_addr, TIMEOUT)],
        CommitLog::new(dir.path().join("coordinator.log")),
        TIMEOUT,
        2,
    ));
    coordinator.setup().unwrap();

    let participant = Arc::new(Participant::new(
        0,
        RpcClient::new(coordinator_addr, TIMEOUT),
        SqlStore::open(dir.path().join("data-0.db")).unwrap(),
        CommitLog::new(dir.path().join("participant-0.log")),
    ));
    participant.setup().unwrap();

    let handles = vec![
        coordinator_server.spawn(coordinator.clone()),
        participant_server.spawn(participant.clone()),
    ];

    participant.clone().recover().await;
    coordinator.clone().recover().await;

    RecoveredPair {
        coordinator,
        participant,
        handles,
    }
}

/// Coordinator logged COMMITTED and crashed before broadcasting; the
/// participant crashed after voting. Both restart: the participant
/// re-votes, the coordinator re-broadcasts COMMIT, and the transaction
/// finishes.
#[tokio::test]
async fn test_commit_replayed_after_double_crash() {
    let dir = TempDir::new().unwrap();
    seed_log(&dir.path().join("coordinator.log"), &[(1, TxnStatus::Committed)]);
    seed_log(&dir.path().join("participant-0.log"), &[(1, TxnStatus::Prepared)]);
    seed_prepared_store(&dir.path().join("data-0.db"), "1", "s1", 10);

    let pair = restart_pair(&dir).await;

    wait_until("coordinator to complete the transaction", || {
        pair.coordinator.transaction_status(1) == Some(TxnStatus::Done)
    })
    .await;

    assert_eq!(
        pair.participant.transaction_status(1),
        Some(TxnStatus::Committed)
    );
    assert_eq!(pair.participant.data_value("s1"), Some(10));

    let entries = CommitLog::new(dir.path().join("coordinator.log"))
        .read_all()
        .unwrap();
    assert_eq!(entries.get(&1), Some(&TxnStatus::Done));

    for handle in pair.handles {
        handle.abort();
    }
}

/// Same crash points, but the logged decision was ABORT: the recovered
/// participant's COMMIT re-vote must be answered with ABORT and the
/// prepared data discarded.
#[tokio::test]
async fn test_abort_replayed_after_double_crash() {
    let dir = TempDir::new().unwrap();
    seed_log(&dir.path().join("coordinator.log"), &[(1, TxnStatus::Aborted)]);
    seed_log(&dir.path().join("participant-0.log"), &[(1, TxnStatus::Prepared)]);
    seed_prepared_store(&dir.path().join("data-0.db"), "1", "s1", 10);

    let pair = restart_pair(&dir).await;

    wait_until("coordinator to complete the transaction", || {
        pair.coordinator.transaction_status(1) == Some(TxnStatus::Done)
    })
    .await;

    assert_eq!(
        pair.participant.transaction_status(1),
        Some(TxnStatus::Aborted)
    );
    assert_eq!(pair.participant.data_value("s1"), None);
    assert_eq!(pair.participant.data_rows(), 0);

    for handle in pair.handles {
        handle.abort();
    }
}

/// Coordinator crashed after logging PREPARED but before any votes were
/// tallied. Recovery re-enters the prepare phase, re-solicits votes, and
/// drives the transaction to a decision.
#[tokio::test]
async fn test_prepare_phase_reentered_after_crash() {
    let dir = TempDir::new().unwrap();
    seed_log(&dir.path().join("coordinator.log"), &[(1, TxnStatus::Prepared)]);

    let pair = restart_pair(&dir).await;

    wait_until("coordinator to complete the transaction", || {
        pair.coordinator.transaction_status(1) == Some(TxnStatus::Done)
    })
    .await;

    // The participant never saw an EXECUTE, so it prepared and committed
    // an empty transaction.
    assert_eq!(
        pair.participant.transaction_status(1),
        Some(TxnStatus::Committed)
    );
    assert_eq!(pair.participant.data_rows(), 0);

    for handle in pair.handles {
        handle.abort();
    }
}

/// Running recovery over a post-recovery log must leave every state
/// unchanged.
#[tokio::test]
async fn test_recovery_is_a_fixed_point() {
    let dir = TempDir::new().unwrap();
    seed_log(&dir.path().join("coordinator.log"), &[(1, TxnStatus::Committed)]);
    seed_log(&dir.path().join("participant-0.log"), &[(1, TxnStatus::Prepared)]);
    seed_prepared_store(&dir.path().join("data-0.db"), "1", "s1", 10);

    {
        let pair = restart_pair(&dir).await;
        wait_until("first recovery to finish", || {
            pair.coordinator.transaction_status(1) == Some(TxnStatus::Done)
        })
        .await;
        for handle in pair.handles {
            handle.abort();
        }
    }

    let first = CommitLog::new(dir.path().join("coordinator.log"))
        .read_all()
        .unwrap();

    // Crash again, recover again: nothing may change.
    let pair = restart_pair(&dir).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(pair.coordinator.transaction_status(1), Some(TxnStatus::Done));
    assert_eq!(
        pair.participant.transaction_status(1),
        Some(TxnStatus::Committed)
    );
    assert_eq!(pair.participant.data_value("s1"), Some(10));

    let second = CommitLog::new(dir.path().join("coordinator.log"))
        .read_all()
        .unwrap();
    assert_eq!(first, second);

    for handle in pair.handles {
        handle.abort();
    }
}

/// A batch interrupted before it sealed leaves nothing in either log;
/// restart starts cleanly and allocates fresh ids above the old maximum.
#[tokio::test]
async fn test_ids_stay_monotonic_across_restart() {
    let dir = TempDir::new().unwrap();
    seed_log(
        &dir.path().join("coordinator.log"),
        &[(1, TxnStatus::Done), (2, TxnStatus::Done)],
    );
    seed_log(
        &dir.path().join("participant-0.log"),
        &[(1, TxnStatus::Committed), (2, TxnStatus::Committed)],
    );

    let pair = restart_pair(&dir).await;

    // batch_size is 2 in restart_pair; the next batch must get id 3.
    assert!(
        pair.coordinator
            .recv_client_execute(0, "insert into data values ('s3', 30)".to_string(), vec![])
            .await
    );
    assert!(
        pair.coordinator
            .recv_client_execute(0, "insert into data values ('s4', 40)".to_string(), vec![])
            .await
    );

    wait_until("new transaction to complete", || {
        pair.coordinator.transaction_status(3) == Some(TxnStatus::Done)
    })
    .await;
    assert_eq!(pair.participant.data_value("s3"), Some(30));
    assert_eq!(pair.participant.data_value("s4"), Some(40));

    for handle in pair.handles {
        handle.abort();
    }
}
