//! Deterministic address and key derivation.
//!
//! One mnemonic drives three derivation schemes:
//!
//! - BTC: BIP-84, `m/84'/coin'/0'/0/index` (coin 0 mainnet, 1 testnet),
//!   pubkey → HASH160 → bech32 P2WPKH.
//! - BSC: BIP-44, `m/44'/60'/0'/0/index`, secp256k1 pubkey → keccak-256 →
//!   EIP-55 checksummed hex.
//! - SOL: SLIP-10 ed25519, `m/44'/501'/index'/0'`, all segments hardened,
//!   base58 of the 32-byte public key.
//!
//! The mnemonic file is read on every derivation call; neither the seed nor
//! any private key outlives the call that needed it. Key buffers are wrapped
//! in [`Zeroizing`] so they are overwritten on every exit path.

mod slip10;

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Address as BtcAddress, CompressedPublicKey};
use solana_keypair::Keypair;
use solana_signer::Signer as _;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::chain::{Chain, Network};

/// Derivation failures.
#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    /// The mnemonic file could not be read.
    #[error("mnemonic file is not readable: {0}")]
    MnemonicUnreadable(#[from] std::io::Error),
    /// Word count or checksum failure.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] bip39::Error),
    /// BIP-32 child derivation failure (not reachable for indexes < 2^31).
    #[error("bip32 derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
    /// The derived secp256k1 scalar was rejected by the EVM signer.
    #[error("invalid derived key: {0}")]
    InvalidKey(String),
}

/// Stateless deriver. Holds only the mnemonic path and the network; the seed
/// is recomputed per call and never cached.
#[derive(Clone, Debug)]
pub struct Wallet {
    mnemonic_file: PathBuf,
    network: Network,
    secp: Secp256k1<All>,
}

/// A freshly derived BTC signing key with its compressed public key.
///
/// Dropped (and the secret wiped) as soon as the input it signs is witnessed.
pub struct BtcSigningKey {
    pub secret: Zeroizing<[u8; 32]>,
    pub public: CompressedPublicKey,
}

impl BtcSigningKey {
    pub fn secret_key(&self) -> Result<SecretKey, DeriveError> {
        SecretKey::from_slice(self.secret.as_ref())
            .map_err(|e| DeriveError::InvalidKey(e.to_string()))
    }
}

impl Wallet {
    pub fn new(mnemonic_file: PathBuf, network: Network) -> Self {
        Self {
            mnemonic_file,
            network,
            secp: Secp256k1::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Reads and validates the mnemonic, returning the 64-byte BIP-39 seed.
    fn seed(&self) -> Result<Zeroizing<[u8; 64]>, DeriveError> {
        let raw = std::fs::read_to_string(&self.mnemonic_file)?;
        let mnemonic = bip39::Mnemonic::parse_normalized(raw.trim())?;
        Ok(Zeroizing::new(mnemonic.to_seed_normalized("")))
    }

    /// Derives the public receive address for (chain, index).
    ///
    /// Total for any valid mnemonic and any index below 2^31.
    pub fn address(&self, chain: Chain, index: u32) -> Result<String, DeriveError> {
        match chain {
            Chain::Btc => {
                let key = self.btc_signing_key(index)?;
                Ok(BtcAddress::p2wpkh(&key.public, self.network.btc_network()).to_string())
            }
            Chain::Bsc => {
                let signer = self.bsc_signing_key(index)?;
                Ok(signer.address().to_string())
            }
            Chain::Sol => {
                let keypair = self.sol_signing_key(index)?;
                Ok(keypair.pubkey().to_string())
            }
        }
    }

    /// BTC key at `m/84'/coin'/0'/0/index`.
    pub fn btc_signing_key(&self, index: u32) -> Result<BtcSigningKey, DeriveError> {
        let seed = self.seed()?;
        let master = Xpriv::new_master(self.network.btc_network(), seed.as_ref())?;
        let path = [
            ChildNumber::from_hardened_idx(84)?,
            ChildNumber::from_hardened_idx(self.network.btc_coin_type())?,
            ChildNumber::from_hardened_idx(0)?,
            ChildNumber::from_normal_idx(0)?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = master.derive_priv(&self.secp, &path)?;
        let secret = Zeroizing::new(child.private_key.secret_bytes());
        let public = CompressedPublicKey(child.private_key.public_key(&self.secp));
        Ok(BtcSigningKey { secret, public })
    }

    /// BSC signer at `m/44'/60'/0'/0/index`.
    pub fn bsc_signing_key(&self, index: u32) -> Result<PrivateKeySigner, DeriveError> {
        let seed = self.seed()?;
        // NetworkKind only affects xpub/xprv serialization, which never happens here.
        let master = Xpriv::new_master(self.network.btc_network(), seed.as_ref())?;
        let path = [
            ChildNumber::from_hardened_idx(44)?,
            ChildNumber::from_hardened_idx(60)?,
            ChildNumber::from_hardened_idx(0)?,
            ChildNumber::from_normal_idx(0)?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = master.derive_priv(&self.secp, &path)?;
        let secret = Zeroizing::new(child.private_key.secret_bytes());
        let signer = PrivateKeySigner::from_bytes(&B256::from_slice(secret.as_ref()))
            .map_err(|e| DeriveError::InvalidKey(e.to_string()))?;
        Ok(signer)
    }

    /// SOL keypair at `m/44'/501'/index'/0'` (all hardened).
    pub fn sol_signing_key(&self, index: u32) -> Result<Keypair, DeriveError> {
        let seed = self.seed()?;
        let secret = slip10::derive_seed(seed.as_ref(), &[44, 501, index, 0]);
        Ok(Keypair::new_from_array(*secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // The BIP-39 reference mnemonic; addresses below are the published
    // BIP-84 and BIP-44 test vectors for it.
    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn wallet(network: Network) -> (tempfile::NamedTempFile, Wallet) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{MNEMONIC}").unwrap();
        let wallet = Wallet::new(file.path().to_path_buf(), network);
        (file, wallet)
    }

    #[test]
    fn btc_bip84_vectors() {
        let (_file, wallet) = wallet(Network::Mainnet);
        assert_eq!(
            wallet.address(Chain::Btc, 0).unwrap(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            wallet.address(Chain::Btc, 1).unwrap(),
            "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g"
        );
    }

    #[test]
    fn bsc_bip44_vector() {
        let (_file, wallet) = wallet(Network::Mainnet);
        assert_eq!(
            wallet.address(Chain::Bsc, 0).unwrap(),
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        );
    }

    #[test]
    fn sol_derivation_is_deterministic_and_hardened_per_index() {
        let (_file, wallet) = wallet(Network::Mainnet);
        let a0 = wallet.address(Chain::Sol, 0).unwrap();
        let a0_again = wallet.address(Chain::Sol, 0).unwrap();
        let a1 = wallet.address(Chain::Sol, 1).unwrap();
        assert_eq!(a0, a0_again);
        assert_ne!(a0, a1);
        // Base58-decodes to a 32-byte ed25519 public key.
        assert_eq!(bs58::decode(&a0).into_vec().unwrap().len(), 32);
    }

    #[test]
    fn testnet_addresses_differ_from_mainnet() {
        let (_f1, mainnet) = wallet(Network::Mainnet);
        let (_f2, testnet) = wallet(Network::Testnet);
        let main = mainnet.address(Chain::Btc, 0).unwrap();
        let test = testnet.address(Chain::Btc, 0).unwrap();
        assert!(main.starts_with("bc1"));
        assert!(test.starts_with("tb1"));
        assert_ne!(main, test);
    }

    #[test]
    fn invalid_mnemonic_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "abandon abandon abandon").unwrap();
        let wallet = Wallet::new(file.path().to_path_buf(), Network::Mainnet);
        assert!(matches!(
            wallet.address(Chain::Btc, 0),
            Err(DeriveError::InvalidMnemonic(_))
        ));
    }
}
