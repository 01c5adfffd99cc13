//! The tier → ledger composition, end to end through the store: confirmed
//! transfers credit `unclaimed` and `total`, claims zero only `unclaimed`,
//! pending amounts convert on confirmation, and `total` is monotonic.

use rust_decimal::Decimal;

use hdpay::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};
use hdpay::poller::tiers::TierSchedule;
use hdpay::store::{Direction, Store, TxRecord, TxStatus};

const SCHEDULE: &str = r#"[
    {"min_usd": "0",  "max_usd": "1",  "multiplier": "0"},
    {"min_usd": "1",  "max_usd": "10", "multiplier": "1.0"},
    {"min_usd": "10", "max_usd": "25", "multiplier": "1.1"},
    {"min_usd": "25", "max_usd": null, "multiplier": "1.2"}
]"#;

fn incoming(hash: &str, amount: RawAmount, status: TxStatus) -> TxRecord {
    TxRecord {
        chain: Chain::Bsc,
        tx_hash: hash.to_string(),
        direction: Direction::In,
        token: Token::Usdt,
        amount,
        from_addr: "0xsender".to_string(),
        to_addr: "A".to_string(),
        block_number: Some(1),
        block_time: Some(UnixTimestamp::now()),
        gas: None,
        status,
        created_at: UnixTimestamp::now(),
    }
}

#[tokio::test]
async fn points_follow_the_spec_scenario() {
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
    let tiers = TierSchedule::parse(SCHEDULE).unwrap();

    // Two confirmed transfers: $5 (tier mul 1.0 -> 500) and $50 (mul 1.2 ->
    // 6000). USDT is a constant $1.00, so amounts map directly.
    let five = tiers.points_for(Decimal::from(5));
    assert_eq!(five, 500);
    store
        .record_transaction(&incoming(
            "0xaaa",
            "5000000000000000000".parse().unwrap(),
            TxStatus::Confirmed,
        ))
        .await
        .unwrap();
    store.confirm_points(Chain::Bsc, "A", five, 0).await.unwrap();

    let fifty = tiers.points_for(Decimal::from(50));
    assert_eq!(fifty, 6_000);
    store
        .record_transaction(&incoming(
            "0xbbb",
            "50000000000000000000".parse().unwrap(),
            TxStatus::Confirmed,
        ))
        .await
        .unwrap();
    store.confirm_points(Chain::Bsc, "A", fifty, 0).await.unwrap();

    let account = store.points_account(Chain::Bsc, "A").await.unwrap();
    assert_eq!(account.unclaimed, 6_500);
    assert_eq!(account.total, 6_500);
    assert_eq!(account.pending, 0);

    // Claim: unclaimed resets, total untouched.
    store
        .claim_points(&[(Chain::Bsc, "A".to_string())])
        .await
        .unwrap();
    let account = store.points_account(Chain::Bsc, "A").await.unwrap();
    assert_eq!(account.unclaimed, 0);
    assert_eq!(account.total, 6_500);

    // New $20 transfer detected below threshold: pending only.
    let twenty = tiers.points_for(Decimal::from(20));
    assert_eq!(twenty, 2_200);
    store
        .record_transaction(&incoming(
            "0xccc",
            "20000000000000000000".parse().unwrap(),
            TxStatus::Pending,
        ))
        .await
        .unwrap();
    store.add_pending_points(Chain::Bsc, "A", twenty).await.unwrap();
    let account = store.points_account(Chain::Bsc, "A").await.unwrap();
    assert_eq!(account.pending, 2_200);
    assert_eq!(account.unclaimed, 0);
    assert_eq!(account.total, 6_500);

    // On confirmation: pending -> unclaimed, total grows.
    store
        .record_transaction(&incoming(
            "0xccc",
            "20000000000000000000".parse().unwrap(),
            TxStatus::Confirmed,
        ))
        .await
        .unwrap();
    store
        .confirm_points(Chain::Bsc, "A", twenty, twenty)
        .await
        .unwrap();
    let account = store.points_account(Chain::Bsc, "A").await.unwrap();
    assert_eq!(account.pending, 0);
    assert_eq!(account.unclaimed, 2_200);
    assert_eq!(account.total, 8_700);
    assert!(account.unclaimed <= account.total);
}

#[tokio::test]
async fn pending_rows_are_visible_for_repolls() {
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
    store
        .record_transaction(&incoming(
            "0xddd",
            RawAmount::from_u64(1),
            TxStatus::Pending,
        ))
        .await
        .unwrap();
    let pending = store.pending_incoming(Chain::Bsc, "A").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tx_hash, "0xddd");

    store
        .record_transaction(&incoming(
            "0xddd",
            RawAmount::from_u64(1),
            TxStatus::Confirmed,
        ))
        .await
        .unwrap();
    assert!(store.pending_incoming(Chain::Bsc, "A").await.unwrap().is_empty());
}

#[tokio::test]
async fn claims_touch_only_the_listed_addresses() {
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();
    store.confirm_points(Chain::Bsc, "A", 100, 0).await.unwrap();
    store.confirm_points(Chain::Sol, "B", 200, 0).await.unwrap();
    store
        .claim_points(&[(Chain::Bsc, "A".to_string())])
        .await
        .unwrap();
    assert_eq!(store.points_account(Chain::Bsc, "A").await.unwrap().unclaimed, 0);
    assert_eq!(store.points_account(Chain::Sol, "B").await.unwrap().unclaimed, 200);
}
