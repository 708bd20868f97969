//! Signing coordinator
//!
//! Signs through the hardware wallet manager when a device is connected,
//! otherwise with the software key kept in the vault. Both paths go through
//! the manager's payload preview first.

use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::{derive_address, derive_public_key, sign_hash};
use crate::hardware::transaction::{combine_signature, SignatureResult, TransactionFields, UnsignedTransaction};
use crate::hardware::HardwareWalletManager;
use crate::vault::SecureVault;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Vault key of the 32-byte software signing key.
pub const SIGNING_KEY: &str = "signing_key";

/// Which trust boundary produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signer {
    Hardware,
    Software,
}

/// A signed, submittable transaction.
#[derive(Debug, Clone, Serialize)]
pub struct SignedTransaction {
    pub signer: Signer,
    pub transaction: Value,
    pub result: SignatureResult,
}

pub struct SigningCoordinator {
    vault: SecureVault,
    manager: Arc<HardwareWalletManager>,
}

impl SigningCoordinator {
    pub fn new(vault: SecureVault, manager: Arc<HardwareWalletManager>) -> Self {
        Self { vault, manager }
    }

    /// Store the software signing key. The vault must be accessible.
    pub async fn import_signing_key(&self, private_key: &[u8]) -> CustodyResult<String> {
        let public_key = derive_public_key(private_key, true)?;
        self.vault.set(SIGNING_KEY, private_key).await?;
        derive_address(&public_key)
    }

    /// Address of the software signing key.
    pub async fn software_address(&self) -> CustodyResult<String> {
        let key = self.signing_key().await?;
        derive_address(&derive_public_key(&key, true)?)
    }

    pub async fn sign_transaction(&self, fields: &TransactionFields) -> CustodyResult<SignedTransaction> {
        let unsigned = UnsignedTransaction::build(fields)?;
        let (signer, result) = if self.manager.is_connected() {
            (Signer::Hardware, self.manager.sign_unsigned(&unsigned).await?)
        } else {
            (Signer::Software, self.sign_in_software(&unsigned).await?)
        };
        let transaction = combine_signature(&unsigned, &result)?;
        info!("Transaction signed ({:?})", signer);
        Ok(SignedTransaction {
            signer,
            transaction,
            result,
        })
    }

    async fn signing_key(&self) -> CustodyResult<crate::security::secret::SecretVec> {
        let key = self
            .vault
            .get(SIGNING_KEY)
            .await?
            .ok_or_else(|| CustodyError::Validation("no software signing key in the vault".to_string()))?;
        if key.len() != 32 {
            return Err(CustodyError::Validation("stored signing key has the wrong length".to_string()));
        }
        Ok(key)
    }

    /// The software key is not path-derived; the result reports the default path.
    async fn sign_in_software(&self, unsigned: &UnsignedTransaction) -> CustodyResult<SignatureResult> {
        self.manager.confirm_payload(&unsigned.canonical, &unsigned.hash).await?;
        let key = self.signing_key().await?;
        Ok(SignatureResult {
            signature: sign_hash(&unsigned.hash, &key)?,
            public_key: derive_public_key(&key, true)?,
            path: DerivationPath::default(),
            payload_hash: unsigned.hash.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::VaultConfig;
    use crate::crypto::verify;
    use crate::hardware::manager::PayloadPreview;
    use crate::hardware::HardwareEvent;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fields() -> TransactionFields {
        TransactionFields {
            from: "ax01".into(),
            to: "ax02".into(),
            amount: "5".into(),
            extra: Default::default(),
        }
    }

    fn coordinator() -> SigningCoordinator {
        let vault = SecureVault::open(
            Arc::new(MemoryStore::new()),
            VaultConfig {
                kdf_iterations: 1_000,
                ..VaultConfig::default()
            },
        )
        .unwrap();
        SigningCoordinator::new(vault, Arc::new(HardwareWalletManager::default()))
    }

    #[tokio::test]
    async fn test_software_signing() {
        let coordinator = coordinator();
        let address = coordinator.import_signing_key(&[4u8; 32]).await.unwrap();
        assert_eq!(coordinator.software_address().await.unwrap(), address);

        let signed = coordinator.sign_transaction(&fields()).await.unwrap();
        assert_eq!(signed.signer, Signer::Software);
        let r = &signed.result;
        assert!(verify(r.signature.as_bytes(), &r.payload_hash, &r.public_key));
        assert_eq!(signed.transaction["signature"], r.signature.to_hex());
        assert_eq!(signed.transaction["type"], "transfer");
    }

    #[tokio::test]
    async fn test_declined_preview_blocks_software_signing() {
        struct Decline(AtomicUsize);

        #[async_trait::async_trait]
        impl PayloadPreview for Decline {
            async fn confirm(&self, _payload: &[u8], _hash: &[u8; 32]) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                false
            }
        }

        let coordinator = coordinator();
        coordinator.import_signing_key(&[4u8; 32]).await.unwrap();
        let decline = Arc::new(Decline(AtomicUsize::new(0)));
        coordinator.manager.set_preview(decline.clone());
        let mut rx = coordinator.manager.subscribe();

        let err = coordinator.sign_transaction(&fields()).await.unwrap_err();
        assert_eq!(err.code(), "USER_REJECTED");
        assert_eq!(decline.0.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.try_recv(), Ok(HardwareEvent::Error { kind: None, .. })));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let err = coordinator().sign_transaction(&fields()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_rejects_bad_key() {
        let err = coordinator().import_signing_key(&[0u8; 32]).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
