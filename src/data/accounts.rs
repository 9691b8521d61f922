//! Local account registry
//!
//! Accounts own an RSA keypair for HTTP signatures plus the settings the
//! inbox pipeline consults (follow approval, capability flags).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::FsStore;
use crate::error::AppError;

const DEFAULT_KEY_BITS: usize = 4096;

/// A local account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAccount {
    pub nickname: String,
    pub display_name: Option<String>,
    /// RSA private key (PKCS#8 PEM) for signing outbound requests
    pub private_key_pem: String,
    /// RSA public key (PEM) advertised in the actor document
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Per-account inbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Incoming follows land in the pending queue instead of auto-accepting
    #[serde(default)]
    pub manual_approval: bool,
    /// Accept Create activities that reply to this account's posts
    #[serde(default = "default_true")]
    pub allow_replies: bool,
    /// Accept Like activities for this account's posts
    #[serde(default = "default_true")]
    pub allow_likes: bool,
    /// Accept Announce activities for this account's posts
    #[serde(default = "default_true")]
    pub allow_announces: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            manual_approval: false,
            allow_replies: true,
            allow_likes: true,
            allow_announces: true,
        }
    }
}

/// Account registry backed by the object store
#[derive(Debug, Clone)]
pub struct AccountStore {
    store: FsStore,
    key_bits: usize,
}

impl AccountStore {
    pub fn new(store: FsStore) -> Self {
        Self {
            store,
            key_bits: DEFAULT_KEY_BITS,
        }
    }

    /// Smaller keys for tests where 4096-bit generation is too slow.
    #[cfg(test)]
    pub fn with_key_bits(store: FsStore, key_bits: usize) -> Self {
        Self { store, key_bits }
    }

    fn namespace(nickname: &str) -> String {
        format!("accounts/{}", nickname)
    }

    /// Load an account if it exists.
    pub async fn get(&self, nickname: &str) -> Result<Option<LocalAccount>, AppError> {
        let Some(value) = self
            .store
            .get_json(&Self::namespace(nickname), "account")
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| AppError::Storage(format!("Failed to decode account: {}", e)))
    }

    /// Ensure an account exists, generating a keypair on first boot.
    pub async fn ensure_account(
        &self,
        nickname: &str,
        display_name: &str,
        manual_approval: bool,
    ) -> Result<LocalAccount, AppError> {
        if let Some(account) = self.get(nickname).await? {
            tracing::info!(nickname = %account.nickname, "Local account exists");
            return Ok(account);
        }

        tracing::info!(%nickname, "Creating local account...");

        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, self.key_bits)
            .map_err(|e| AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?;

        let account = LocalAccount {
            nickname: nickname.to_string(),
            display_name: Some(display_name.to_string()),
            private_key_pem,
            public_key_pem,
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&account)
            .map_err(|e| AppError::Storage(format!("Failed to encode account: {}", e)))?;
        self.store
            .put_json(&Self::namespace(nickname), "account", &value)
            .await?;

        self.put_settings(
            nickname,
            &AccountSettings {
                manual_approval,
                ..AccountSettings::default()
            },
        )
        .await?;

        tracing::info!(%nickname, "Local account created");
        Ok(account)
    }

    /// Load an account's settings, defaulting when absent.
    pub async fn settings(&self, nickname: &str) -> Result<AccountSettings, AppError> {
        let Some(value) = self
            .store
            .get_json(&Self::namespace(nickname), "settings")
            .await?
        else {
            return Ok(AccountSettings::default());
        };

        serde_json::from_value(value)
            .map_err(|e| AppError::Storage(format!("Failed to decode settings: {}", e)))
    }

    /// Replace an account's settings.
    pub async fn put_settings(
        &self,
        nickname: &str,
        settings: &AccountSettings,
    ) -> Result<(), AppError> {
        let value = serde_json::to_value(settings)
            .map_err(|e| AppError::Storage(format!("Failed to encode settings: {}", e)))?;
        self.store
            .put_json(&Self::namespace(nickname), "settings", &value)
            .await
    }
}
