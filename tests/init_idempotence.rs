//! Bulk derivation + storage: running init twice is a no-op, and every
//! stored address re-derives to the same string.

use std::io::Write;

use hdpay::chain::{Chain, Network};
use hdpay::derive::Wallet;
use hdpay::store::Store;

const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn test_wallet() -> (tempfile::NamedTempFile, Wallet) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{MNEMONIC}").unwrap();
    let wallet = Wallet::new(file.path().to_path_buf(), Network::Mainnet);
    (file, wallet)
}

async fn derive_batch(wallet: &Wallet, chain: Chain, count: u32) -> Vec<(u32, String)> {
    (0..count)
        .map(|index| (index, wallet.address(chain, index).unwrap()))
        .collect()
}

#[tokio::test]
async fn init_twice_is_a_no_op() {
    let (_file, wallet) = test_wallet();
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();

    for chain in Chain::ALL {
        let rows = derive_batch(&wallet, chain, 8).await;
        let first = store.insert_addresses(chain, &rows).await.unwrap();
        assert_eq!(first, 8);
        let second = store.insert_addresses(chain, &rows).await.unwrap();
        assert_eq!(second, 0, "{chain} re-init inserted rows");
        assert_eq!(store.address_count(chain).await.unwrap(), 8);
    }
}

#[tokio::test]
async fn stored_addresses_rederive_identically() {
    let (_file, wallet) = test_wallet();
    let store = Store::open_in_memory(Network::Mainnet).await.unwrap();

    for chain in Chain::ALL {
        let rows = derive_batch(&wallet, chain, 5).await;
        store.insert_addresses(chain, &rows).await.unwrap();

        let stored = store.addresses_in_range(chain, 4).await.unwrap();
        assert_eq!(stored.len(), 5);
        for row in stored {
            let derived = wallet.address(chain, row.index).unwrap();
            assert_eq!(derived, row.address, "{chain} index {} drifted", row.index);
        }
    }
}

#[tokio::test]
async fn chains_never_share_addresses() {
    let (_file, wallet) = test_wallet();
    let btc = wallet.address(Chain::Btc, 0).unwrap();
    let bsc = wallet.address(Chain::Bsc, 0).unwrap();
    let sol = wallet.address(Chain::Sol, 0).unwrap();
    assert_ne!(btc, bsc);
    assert_ne!(bsc, sol);
    assert_ne!(btc, sol);
}
