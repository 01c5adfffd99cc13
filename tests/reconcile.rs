//! Reconciler invariants: a clean shutdown reconciles to nothing, and rows
//! that never reached broadcast are closed out as failed without touching
//! the network.

use std::sync::Arc;
use tokio_util::task::TaskTracker;

use hdpay::chain::{Chain, Network, UnixTimestamp};
use hdpay::engine::reconciler::{Reconciler, orphaned_sweeps};
use hdpay::providers::ProviderPool;
use hdpay::providers::bsc::BscRpcProvider;
use hdpay::providers::btc::EsploraProvider;
use hdpay::providers::sol::SolRpcProvider;
use hdpay::store::{Store, TxStateKind, TxStateRow, TxStateStatus};

fn empty_pools() -> (
    Arc<ProviderPool<EsploraProvider>>,
    Arc<ProviderPool<BscRpcProvider>>,
    Arc<ProviderPool<SolRpcProvider>>,
) {
    (
        Arc::new(ProviderPool::new(Chain::Btc, Vec::new(), None)),
        Arc::new(ProviderPool::new(Chain::Bsc, Vec::new(), None)),
        Arc::new(ProviderPool::new(Chain::Sol, Vec::new(), None)),
    )
}

fn state_row(sweep_id: &str, index: u32, status: TxStateStatus, tx_hash: Option<&str>, age_secs: i64) -> TxStateRow {
    let at = UnixTimestamp(UnixTimestamp::now().0 - age_secs);
    TxStateRow {
        sweep_id: sweep_id.to_string(),
        chain: Chain::Bsc,
        address_index: index,
        kind: TxStateKind::Sweep,
        nonce: None,
        tx_hash: tx_hash.map(String::from),
        status,
        attempt: 1,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn clean_shutdown_reconciles_to_nothing() {
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
    // Only terminal rows on disk.
    store
        .insert_tx_state(&state_row("s1", 0, TxStateStatus::Confirmed, Some("0x1"), 10))
        .await
        .unwrap();
    store
        .insert_tx_state(&state_row("s1", 1, TxStateStatus::Failed, None, 10))
        .await
        .unwrap();

    let (btc, bsc, sol) = empty_pools();
    let reconciler = Reconciler::new(store.clone(), btc, bsc, sol, TaskTracker::new());
    let summary = reconciler.run().await.unwrap();
    assert_eq!(summary.examined, 0);

    // Nothing changed.
    let rows = store.tx_states_for_sweep("s1").await.unwrap();
    assert_eq!(rows[0].status, TxStateStatus::Confirmed);
    assert_eq!(rows[1].status, TxStateStatus::Failed);
}

#[tokio::test]
async fn unbroadcast_rows_close_as_failed() {
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
    store
        .insert_tx_state(&state_row("s2", 3, TxStateStatus::Building, None, 30))
        .await
        .unwrap();
    store
        .insert_tx_state(&state_row("s2", 4, TxStateStatus::Signed, None, 30))
        .await
        .unwrap();

    let (btc, bsc, sol) = empty_pools();
    let reconciler = Reconciler::new(store.clone(), btc, bsc, sol, TaskTracker::new());
    let summary = reconciler.run().await.unwrap();
    assert_eq!(summary.examined, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.confirmed, 0);
    assert_eq!(summary.repolling, 0);

    let rows = store.tx_states_for_sweep("s2").await.unwrap();
    assert!(rows.iter().all(|r| r.status == TxStateStatus::Failed));
}

#[tokio::test]
async fn stale_broadcasts_surface_as_orphans() {
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
    // Broadcast two hours ago, still open.
    store
        .insert_tx_state(&state_row("s3", 7, TxStateStatus::Broadcast, Some("0xdead"), 2 * 3600))
        .await
        .unwrap();
    // Fresh broadcast: not an orphan.
    store
        .insert_tx_state(&state_row("s4", 8, TxStateStatus::Broadcast, Some("0xbeef"), 60))
        .await
        .unwrap();

    let orphans = orphaned_sweeps(&store).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].sweep_id, "s3");
    assert_eq!(orphans[0].open_tx_count, 1);

    // Dismissal closes the stale rows and repeat dismissal finds nothing.
    assert_eq!(store.dismiss_sweep("s3").await.unwrap(), 1);
    assert_eq!(store.dismiss_sweep("s3").await.unwrap(), 0);
    assert!(orphaned_sweeps(&store).await.unwrap().is_empty());
}
