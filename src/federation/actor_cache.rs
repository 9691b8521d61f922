//! Remote actor cache
//!
//! Caches fetched actor documents in memory and on disk. Entries carry a
//! UTC timestamp of the last retrieval; a hot read refreshes it, the
//! periodic sweep purges entries past the TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::data::FsStore;
use crate::error::AppError;

const ACTOR_NAMESPACE: &str = "cache/actors";

/// Key material for signing outbound fetches
#[derive(Debug, Clone)]
pub struct RequestSigner {
    pub key_id: String,
    pub private_key_pem: String,
}

/// Parsed view of a remote actor document
#[derive(Debug, Clone)]
pub struct RemoteActor {
    pub id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub preferred_username: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub avatar_url: Option<String>,
}

impl RemoteActor {
    /// Parse an actor document. `id` and `inbox` are required.
    pub fn from_document(document: &serde_json::Value) -> Result<Self, AppError> {
        let id = document
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("Actor document missing id".to_string()))?;
        let inbox = document
            .get("inbox")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("Actor document missing inbox".to_string()))?;

        let shared_inbox = document
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Self {
            id: id.to_string(),
            inbox: inbox.to_string(),
            shared_inbox,
            outbox: document
                .get("outbox")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            preferred_username: document
                .get("preferredUsername")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            public_key_id: document
                .get("publicKey")
                .and_then(|k| k.get("id"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            public_key_pem: document
                .get("publicKey")
                .and_then(|k| k.get("publicKeyPem"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            avatar_url: document
                .get("icon")
                .and_then(|i| i.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// Preferred delivery inbox: the shared inbox when advertised.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    document: serde_json::Value,
    fetched_at: DateTime<Utc>,
}

/// True for URLs that are not person documents and must never be cached.
fn is_cacheable_actor_url(actor_url: &str) -> bool {
    !actor_url.ends_with("/actor") && !actor_url.contains("statuses")
}

/// Actor document cache (memory + disk)
pub struct ActorCache {
    memory: RwLock<HashMap<String, CacheEntry>>,
    store: FsStore,
    http_client: Arc<reqwest::Client>,
    ttl: Duration,
    probe_timeout: Duration,
    local_domain: String,
    signer: RwLock<Option<RequestSigner>>,
}

impl ActorCache {
    pub fn new(
        store: FsStore,
        http_client: Arc<reqwest::Client>,
        ttl: Duration,
        probe_timeout: Duration,
        local_domain: String,
    ) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            store,
            http_client,
            ttl,
            probe_timeout,
            local_domain,
            signer: RwLock::new(None),
        }
    }

    /// Install the key used to sign outbound actor fetches.
    pub async fn set_signer(&self, signer: RequestSigner) {
        *self.signer.write().await = Some(signer);
    }

    /// Get an actor document, from memory, disk, or the remote server.
    pub async fn get(&self, actor_url: &str) -> Result<serde_json::Value, AppError> {
        if !is_cacheable_actor_url(actor_url) {
            return self.fetch_remote(actor_url).await;
        }

        // Memory hit refreshes the timestamp so hot entries stay alive.
        {
            let mut memory = self.memory.write().await;
            if let Some(entry) = memory.get_mut(actor_url) {
                entry.fetched_at = Utc::now();
                crate::metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["actor"])
                    .inc();
                return Ok(entry.document.clone());
            }
        }
        crate::metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["actor"])
            .inc();

        // A disk load populates memory but takes no hot-read refresh on
        // this call; the entry ages from its insertion time.
        if let Some(document) = self.store.get_json(ACTOR_NAMESPACE, actor_url).await? {
            self.insert_memory(actor_url, document.clone()).await;
            return Ok(document);
        }

        let document = self.fetch_remote(actor_url).await?;
        self.put(actor_url, document.clone()).await?;
        Ok(document)
    }

    /// Get a parsed actor view.
    pub async fn get_actor(&self, actor_url: &str) -> Result<RemoteActor, AppError> {
        let document = self.get(actor_url).await?;
        RemoteActor::from_document(&document)
    }

    /// Store an actor document in memory and (write-once) on disk.
    pub async fn put(
        &self,
        actor_url: &str,
        document: serde_json::Value,
    ) -> Result<(), AppError> {
        if !is_cacheable_actor_url(actor_url) {
            return Ok(());
        }

        self.insert_memory(actor_url, document.clone()).await;
        // The disk copy is write-once; invalidation removes it so the next
        // reference stores a fresh document.
        self.store
            .put_json_new(ACTOR_NAMESPACE, actor_url, &document)
            .await?;
        Ok(())
    }

    async fn insert_memory(&self, actor_url: &str, document: serde_json::Value) {
        let mut memory = self.memory.write().await;
        memory.insert(
            actor_url.to_string(),
            CacheEntry {
                document,
                fetched_at: Utc::now(),
            },
        );
        crate::metrics::CACHE_SIZE
            .with_label_values(&["actor"])
            .set(memory.len() as i64);
    }

    /// Remove an actor from memory and disk.
    pub async fn invalidate(&self, actor_url: &str) -> Result<(), AppError> {
        {
            let mut memory = self.memory.write().await;
            memory.remove(actor_url);
        }
        self.store.delete(ACTOR_NAMESPACE, actor_url).await
    }

    /// Purge memory entries older than `max_age`.
    ///
    /// Run periodically, not per request.
    pub async fn expire_older_than(&self, max_age: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(2));
        let mut memory = self.memory.write().await;
        let before = memory.len();
        memory.retain(|_, entry| entry.fetched_at > cutoff);
        let removed = before - memory.len();
        if removed > 0 {
            tracing::info!("{} actors were expired from the cache", removed);
        }
        crate::metrics::CACHE_SIZE
            .with_label_values(&["actor"])
            .set(memory.len() as i64);
    }

    /// Purge entries older than the configured TTL.
    pub async fn run_expiry_sweep(&self) {
        self.expire_older_than(self.ttl).await;
    }

    /// Detect an actor that changed without sending an Update.
    ///
    /// If the cached avatar URL no longer resolves and it is not hosted on
    /// our own domain, the profile likely changed; invalidate so the next
    /// reference re-fetches.
    pub async fn check_for_changed_actor(
        &self,
        actor_url: &str,
        avatar_url: &str,
    ) -> Result<(), AppError> {
        if avatar_url.is_empty() || avatar_url.contains(&self.local_domain) {
            return Ok(());
        }

        let probe = self
            .http_client
            .head(avatar_url)
            .timeout(self.probe_timeout)
            .send()
            .await;

        let exists = matches!(probe, Ok(response) if response.status().is_success());
        if exists {
            return Ok(());
        }

        tracing::debug!(%actor_url, %avatar_url, "Avatar unreachable, invalidating cached actor");
        self.invalidate(actor_url).await
    }

    async fn fetch_remote(&self, actor_url: &str) -> Result<serde_json::Value, AppError> {
        let mut request = self
            .http_client
            .get(actor_url)
            .header("Accept", "application/activity+json");

        if let Some(signer) = self.signer.read().await.as_ref() {
            let signed = super::signature::sign_request(
                "GET",
                actor_url,
                None,
                &signer.private_key_pem,
                &signer.key_id,
            )?;
            request = request
                .header("Date", signed.date)
                .header("Signature", signed.signature);
        }

        let response = request.send().await.map_err(|e| {
            AppError::ResolutionFailed(format!("Failed to fetch actor {}: {}", actor_url, e))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::GONE
        {
            return Err(AppError::ActorNotFound);
        }
        if !response.status().is_success() {
            return Err(AppError::ResolutionFailed(format!(
                "Actor fetch {} returned HTTP {}",
                actor_url,
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            AppError::ResolutionFailed(format!("Invalid actor document from {}: {}", actor_url, e))
        })
    }

    #[cfg(test)]
    async fn backdate_entry(&self, actor_url: &str, fetched_at: DateTime<Utc>) {
        let mut memory = self.memory.write().await;
        if let Some(entry) = memory.get_mut(actor_url) {
            entry.fetched_at = fetched_at;
        }
    }

    #[cfg(test)]
    async fn memory_len(&self) -> usize {
        self.memory.read().await.len()
    }
}
