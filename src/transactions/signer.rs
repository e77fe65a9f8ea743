use async_trait::async_trait;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::database::types::WalletRow;
use crate::error::{ServiceError, ServiceResult};

/// Produces signed transaction bytes for a service wallet. Nonce
/// allocation is the caller's responsibility; the signer only turns
/// unsigned bytes into broadcastable bytes.
///
/// The bundled implementation signs locally over key material stored
/// encrypted in the wallet row. An attested TEE or HSM signer drops in
/// behind the same trait.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    async fn sign(&self, wallet: &WalletRow, unsigned: &[u8]) -> ServiceResult<Vec<u8>>;
}

const NONCE_LEN: usize = 12;

pub struct LocalSigner {
    cipher: Aes256Gcm,
}

impl LocalSigner {
    pub fn new(master_key_hex: &str) -> anyhow::Result<Self> {
        let key = hex::decode(master_key_hex)
            .map_err(|_| anyhow::anyhow!("wallet master key is not valid hex"))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("wallet master key must be 32 bytes"))?;

        Ok(Self { cipher })
    }

    /// Generates fresh wallet key material: the encrypted private key, the
    /// derived public key and the derived address.
    pub fn generate_key_material(&self) -> ServiceResult<(Vec<u8>, String, String)> {
        let mut private_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key);

        let public_key = hex::encode(Sha256::digest(private_key));
        let address = derive_address(&public_key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, private_key.as_slice())
            .map_err(|_| ServiceError::internal("failed to encrypt wallet key"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok((blob, public_key, address))
    }

    fn decrypt_key(&self, wallet: &WalletRow) -> ServiceResult<Vec<u8>> {
        if wallet.encrypted_private_key.len() < NONCE_LEN {
            return Err(ServiceError::internal("wallet key blob is truncated"));
        }

        let (nonce_bytes, ciphertext) = wallet.encrypted_private_key.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ServiceError::internal("failed to decrypt wallet key"))
    }
}

#[async_trait]
impl WalletSigner for LocalSigner {
    async fn sign(&self, wallet: &WalletRow, unsigned: &[u8]) -> ServiceResult<Vec<u8>> {
        let private_key = self.decrypt_key(wallet)?;

        let mut hasher = Sha256::new();
        hasher.update(&private_key);
        hasher.update(unsigned);
        let witness = hasher.finalize();

        let mut signed = Vec::with_capacity(unsigned.len() + witness.len());
        signed.extend_from_slice(unsigned);
        signed.extend_from_slice(&witness);

        Ok(signed)
    }
}

fn derive_address(public_key: &str) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    format!("N{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn signer() -> LocalSigner {
        LocalSigner::new(&hex::encode([9u8; 32])).unwrap()
    }

    fn wallet_with(blob: Vec<u8>, public_key: String, address: String) -> WalletRow {
        WalletRow {
            id: Uuid::new_v4(),
            service: "functions".to_string(),
            address,
            encrypted_private_key: blob,
            public_key,
            next_nonce: 0,
            is_primary: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn signing_is_deterministic_per_wallet() -> ServiceResult<()> {
        let signer = signer();
        let (blob, public_key, address) = signer.generate_key_material()?;
        let wallet = wallet_with(blob, public_key, address);

        let a = signer.sign(&wallet, b"unsigned").await?;
        let b = signer.sign(&wallet, b"unsigned").await?;
        assert_eq!(a, b);

        let c = signer.sign(&wallet, b"other").await?;
        assert_ne!(a, c);

        Ok(())
    }

    #[tokio::test]
    async fn different_wallets_produce_different_witnesses() -> ServiceResult<()> {
        let signer = signer();

        let (blob_a, pk_a, addr_a) = signer.generate_key_material()?;
        let (blob_b, pk_b, addr_b) = signer.generate_key_material()?;
        assert_ne!(addr_a, addr_b);

        let wallet_a = wallet_with(blob_a, pk_a, addr_a);
        let wallet_b = wallet_with(blob_b, pk_b, addr_b);

        let a = signer.sign(&wallet_a, b"unsigned").await?;
        let b = signer.sign(&wallet_b, b"unsigned").await?;
        assert_ne!(a, b);

        Ok(())
    }

    #[test]
    fn addresses_have_the_network_prefix() {
        let signer = signer();
        let (_, _, address) = signer.generate_key_material().unwrap();
        assert!(address.starts_with('N'));
        assert_eq!(address.len(), 33);
    }
}
