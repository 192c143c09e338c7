//! Key material seam. The chain core only ever sees opaque verifying-key
//! bytes and a yes/no verification answer; everything curve-specific lives
//! behind [`CryptoProvider`].

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use lode_core::{sha256, Address};

/// Verifying-key bytes for every address a validator can check.
pub type Keychain = HashMap<Address, Vec<u8>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

pub trait CryptoProvider {
    fn address_from_public_key(&self, public_key: &[u8]) -> Result<Address>;
    fn verify_signature(&self, public_key: &[u8], message: &[u8], signature: &[u8])
        -> Result<bool>;
    fn sign_message(&self, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>>;
}

pub fn generate_ed25519() -> KeyMaterial {
    let mut csprng = OsRng;
    let signing = SigningKey::generate(&mut csprng);
    KeyMaterial {
        public_key: signing.verifying_key().to_bytes().to_vec(),
        secret_key: signing.to_bytes().to_vec(),
    }
}

/// Ed25519-backed provider. Addresses are the SHA-256 of the raw verifying
/// key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Provider;

impl Ed25519Provider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for Ed25519Provider {
    fn address_from_public_key(&self, public_key: &[u8]) -> Result<Address> {
        Ok(sha256(public_key))
    }

    fn verify_signature(
        &self,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| anyhow::anyhow!("bad public key length"))?;
        let verifying = VerifyingKey::from_bytes(&key_bytes)?;
        let signature_bytes: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| anyhow::anyhow!("bad signature length"))?;
        let signature = Signature::from_bytes(&signature_bytes);
        Ok(verifying.verify(message, &signature).is_ok())
    }

    fn sign_message(&self, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let key_bytes: [u8; 32] = secret_key
            .try_into()
            .map_err(|_| anyhow::anyhow!("bad secret key length"))?;
        let signing = SigningKey::from_bytes(&key_bytes);
        Ok(signing.sign(message).to_bytes().to_vec())
    }
}

pub const DEMO_WALLET_IDS: [u16; 3] = [7000, 8000, 9000];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoWallet {
    pub id: u16,
    pub address: Address,
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

/// Deterministic wallets for demos and tests, keyed by a small id. The seed
/// is the id itself, so the same wallets come back on every call. Never hold
/// real value with these.
pub fn demo_wallets() -> BTreeMap<u16, DemoWallet> {
    let provider = Ed25519Provider::new();
    DEMO_WALLET_IDS
        .iter()
        .map(|&id| {
            let mut seed = [0u8; 32];
            seed[..2].copy_from_slice(&id.to_be_bytes());
            let signing = SigningKey::from_bytes(&seed);
            let public_key = signing.verifying_key().to_bytes().to_vec();
            let address = provider
                .address_from_public_key(&public_key)
                .expect("ed25519 keys always derive an address");
            (
                id,
                DemoWallet {
                    id,
                    address,
                    public_key,
                    secret_key: signing.to_bytes().to_vec(),
                },
            )
        })
        .collect()
}

/// Keychain covering every demo wallet.
pub fn demo_keychain() -> Keychain {
    demo_wallets()
        .values()
        .map(|wallet| (wallet.address, wallet.public_key.clone()))
        .collect()
}
