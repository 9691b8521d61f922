//! Federation admission policy
//!
//! Decides whether a verified inbound activity is accepted. Checks run in
//! order and short-circuit on the first failure; `admit` never mutates
//! state. Counter increments happen separately via `record_accepted`,
//! after an activity has actually been applied.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

use super::rate_limit::{RateLimiter, extract_domain};
use crate::data::{AccountSettings, FsStore};
use crate::error::AppError;

const POLICY_NAMESPACE: &str = "policy";
const POLICY_KEY: &str = "federation";

/// Persisted federation policy lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Domains to federate with; empty or containing "*" federates with all
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Blocked instance domains
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Blocked actor handles (nickname@domain)
    #[serde(default)]
    pub blocked_handles: Vec<String>,
    /// Blocked words and hashtags for Create content
    #[serde(default)]
    pub blocked_words: Vec<String>,
}

impl PolicyDocument {
    fn federates_with_all(&self) -> bool {
        self.allowed_domains.is_empty() || self.allowed_domains.iter().any(|d| d == "*")
    }
}

/// Admission policy with persisted lists and rolling daily counters
pub struct AdmissionPolicy {
    store: FsStore,
    doc: RwLock<PolicyDocument>,
    domain_limiter: RateLimiter,
    account_limiter: RateLimiter,
}

impl AdmissionPolicy {
    /// Load the persisted policy, seeding the allow-list from configuration
    /// on first boot.
    pub async fn load(
        store: FsStore,
        configured_allowed_domains: &[String],
        per_domain_daily: u32,
        per_account_daily: u32,
    ) -> Result<Self, AppError> {
        let doc = match store.get_json(POLICY_NAMESPACE, POLICY_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| AppError::Storage(format!("Failed to decode policy: {}", e)))?,
            None => PolicyDocument {
                allowed_domains: configured_allowed_domains.to_vec(),
                ..PolicyDocument::default()
            },
        };

        let window = Duration::from_secs(24 * 3600);
        Ok(Self {
            store,
            doc: RwLock::new(doc),
            domain_limiter: RateLimiter::new(per_domain_daily, window),
            account_limiter: RateLimiter::new(per_account_daily, window),
        })
    }

    /// Decide whether an activity from a verified sender is admitted.
    ///
    /// Side-effect-free; checks short-circuit in order:
    /// shape, allow-list, blocks, daily ceilings, capabilities.
    pub async fn admit(
        &self,
        activity: &serde_json::Value,
        sender_actor_url: &str,
        target_settings: &AccountSettings,
    ) -> Result<(), AppError> {
        let activity_type = check_shape(activity)?;

        let domain = extract_domain(sender_actor_url);
        let handle = sender_handle(sender_actor_url);
        let doc = self.doc.read().await;

        if !doc.federates_with_all() && !domain_listed(&doc.allowed_domains, &domain) {
            return Err(AppError::DomainNotFederated);
        }

        if domain_listed(&doc.blocked_domains, &domain)
            || doc.blocked_handles.iter().any(|h| h.eq_ignore_ascii_case(&handle))
        {
            return Err(AppError::Blocked);
        }
        if activity_type == "Create" && contains_blocked_content(activity, &doc.blocked_words) {
            return Err(AppError::Blocked);
        }
        drop(doc);

        if self.domain_limiter.is_limited(&domain).await
            || self.account_limiter.is_limited(&handle).await
        {
            return Err(AppError::RateLimited);
        }

        check_capabilities(&activity_type, activity, target_settings)?;
        Ok(())
    }

    /// Count an applied activity against the sender's daily ceilings.
    pub async fn record_accepted(&self, sender_actor_url: &str) {
        self.domain_limiter
            .record(&extract_domain(sender_actor_url))
            .await;
        self.account_limiter
            .record(&sender_handle(sender_actor_url))
            .await;
    }

    /// Prune expired counter windows (background sweep).
    pub async fn prune_counters(&self) {
        self.domain_limiter.prune_expired().await;
        self.account_limiter.prune_expired().await;
    }

    /// Current policy lists (admin surface).
    pub async fn snapshot(&self) -> PolicyDocument {
        self.doc.read().await.clone()
    }

    async fn persist(&self) -> Result<(), AppError> {
        let doc = self.doc.read().await.clone();
        let value = serde_json::to_value(&doc)
            .map_err(|e| AppError::Storage(format!("Failed to encode policy: {}", e)))?;
        self.store.put_json(POLICY_NAMESPACE, POLICY_KEY, &value).await
    }

    /// Add a domain to the federation allow-list.
    pub async fn allow_domain(&self, domain: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            let normalized = domain.trim().to_ascii_lowercase();
            if !doc.allowed_domains.contains(&normalized) {
                doc.allowed_domains.push(normalized);
            }
        }
        self.persist().await
    }

    /// Remove a domain from the federation allow-list.
    pub async fn disallow_domain(&self, domain: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            doc.allowed_domains
                .retain(|d| !d.eq_ignore_ascii_case(domain.trim()));
        }
        self.persist().await
    }

    /// Block an instance domain.
    pub async fn block_domain(&self, domain: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            let normalized = domain.trim().to_ascii_lowercase();
            if !doc.blocked_domains.contains(&normalized) {
                doc.blocked_domains.push(normalized);
            }
        }
        self.persist().await
    }

    /// Unblock an instance domain.
    pub async fn unblock_domain(&self, domain: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            doc.blocked_domains
                .retain(|d| !d.eq_ignore_ascii_case(domain.trim()));
        }
        self.persist().await
    }

    /// Block an actor handle (nickname@domain).
    pub async fn block_actor(&self, handle: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            let normalized = handle.trim().to_ascii_lowercase();
            if !doc.blocked_handles.contains(&normalized) {
                doc.blocked_handles.push(normalized);
            }
        }
        self.persist().await
    }

    /// Unblock an actor handle.
    pub async fn unblock_actor(&self, handle: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            doc.blocked_handles
                .retain(|h| !h.eq_ignore_ascii_case(handle.trim()));
        }
        self.persist().await
    }

    /// Block a word or hashtag in incoming Create content.
    pub async fn block_word(&self, word: &str) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            let normalized = word.trim().to_ascii_lowercase();
            if !normalized.is_empty() && !doc.blocked_words.contains(&normalized) {
                doc.blocked_words.push(normalized);
            }
        }
        self.persist().await
    }
}

/// Validate required fields and the object shape for the declared type.
fn check_shape(activity: &serde_json::Value) -> Result<String, AppError> {
    let activity_type = activity
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| AppError::MalformedActivity("missing type".to_string()))?;

    if activity.get("id").and_then(|v| v.as_str()).is_none() {
        return Err(AppError::MalformedActivity("missing id".to_string()));
    }
    if activity.get("actor").and_then(|v| v.as_str()).is_none() {
        return Err(AppError::MalformedActivity("missing actor".to_string()));
    }

    let object = activity
        .get("object")
        .ok_or_else(|| AppError::MalformedActivity("missing object".to_string()))?;

    match activity_type {
        // Create and Update carry the full embedded object.
        "Create" | "Update" => {
            if !object.is_object() || object.get("type").is_none() {
                return Err(AppError::MalformedActivity(
                    "Create object must be an embedded typed object".to_string(),
                ));
            }
        }
        _ => {
            let has_reference = object.is_string()
                || object
                    .get("id")
                    .and_then(|v| v.as_str())
                    .is_some()
                || object.is_object();
            if !has_reference {
                return Err(AppError::MalformedActivity(format!(
                    "{} object must be a reference or embedded object",
                    activity_type
                )));
            }
        }
    }

    Ok(activity_type.to_string())
}

fn domain_listed(list: &[String], domain: &str) -> bool {
    let bare = domain.split(':').next().unwrap_or(domain);
    list.iter()
        .any(|entry| entry.eq_ignore_ascii_case(domain) || entry.eq_ignore_ascii_case(bare))
}

/// Derive `nickname@domain` from an actor URL, falling back to the URL.
fn sender_handle(actor_url: &str) -> String {
    match super::webfinger::parse_handle(actor_url) {
        Ok((nickname, domain)) => format!(
            "{}@{}",
            nickname.to_ascii_lowercase(),
            domain.to_ascii_lowercase()
        ),
        Err(_) => actor_url.to_ascii_lowercase(),
    }
}

fn contains_blocked_content(activity: &serde_json::Value, blocked_words: &[String]) -> bool {
    if blocked_words.is_empty() {
        return false;
    }
    let Some(object) = activity.get("object") else {
        return false;
    };

    let content = object
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if blocked_words.iter().any(|word| content.contains(word)) {
        return true;
    }

    // Hashtags arrive as tag entries named "#word".
    object
        .get("tag")
        .and_then(|t| t.as_array())
        .is_some_and(|tags| {
            tags.iter().any(|tag| {
                tag.get("name")
                    .and_then(|n| n.as_str())
                    .map(|name| name.trim_start_matches('#').to_ascii_lowercase())
                    .is_some_and(|name| blocked_words.iter().any(|word| word == &name))
            })
        })
}

fn check_capabilities(
    activity_type: &str,
    activity: &serde_json::Value,
    settings: &AccountSettings,
) -> Result<(), AppError> {
    match activity_type {
        "Like" if !settings.allow_likes => {
            Err(AppError::CapabilityDenied("likes are not accepted".to_string()))
        }
        "Announce" if !settings.allow_announces => Err(AppError::CapabilityDenied(
            "announces are not accepted".to_string(),
        )),
        "Create" if !settings.allow_replies => {
            let is_reply = activity
                .get("object")
                .and_then(|o| o.get("inReplyTo"))
                .and_then(|r| r.as_str())
                .is_some();
            if is_reply {
                Err(AppError::CapabilityDenied(
                    "replies are not accepted".to_string(),
                ))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SENDER: &str = "https://remote.example/users/bob";

    fn create_activity() -> serde_json::Value {
        json!({
            "type": "Create",
            "id": "https://remote.example/statuses/1/activity",
            "actor": SENDER,
            "object": {
                "type": "Note",
                "id": "https://remote.example/statuses/1",
                "content": "<p>hello fediverse</p>"
            }
        })
    }

    async fn open_policy(allowed: &[&str]) -> (AdmissionPolicy, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        let policy = AdmissionPolicy::load(store, &allowed, 8640, 8640)
            .await
            .unwrap();
        (policy, temp_dir)
    }

    #[tokio::test]
    async fn empty_allow_list_federates_with_all() {
        let (policy, _temp_dir) = open_policy(&[]).await;
        let settings = AccountSettings::default();

        policy
            .admit(&create_activity(), SENDER, &settings)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unlisted_domain_is_rejected_before_anything_else() {
        let (policy, _temp_dir) = open_policy(&["friendly.example"]).await;
        let settings = AccountSettings::default();

        // Also blocked and over its ceiling; the allow-list check decides first.
        policy.block_domain("remote.example").await.unwrap();
        let result = policy.admit(&create_activity(), SENDER, &settings).await;
        assert!(matches!(result, Err(AppError::DomainNotFederated)));
    }

    #[tokio::test]
    async fn wildcard_entry_federates_with_all() {
        let (policy, _temp_dir) = open_policy(&["*"]).await;
        let settings = AccountSettings::default();

        policy
            .admit(&create_activity(), SENDER, &settings)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_fields_are_malformed() {
        let (policy, _temp_dir) = open_policy(&[]).await;
        let settings = AccountSettings::default();

        for broken in [
            json!({"actor": SENDER, "object": "x", "id": "https://remote.example/1"}),
            json!({"type": "Like", "object": "x", "id": "https://remote.example/1"}),
            json!({"type": "Like", "actor": SENDER, "id": "https://remote.example/1"}),
            json!({"type": "Like", "actor": SENDER, "object": "x"}),
            json!({"type": "Create", "actor": SENDER, "object": "not-embedded", "id": "https://remote.example/1"}),
        ] {
            let result = policy.admit(&broken, SENDER, &settings).await;
            assert!(
                matches!(result, Err(AppError::MalformedActivity(_))),
                "expected malformed for {broken}"
            );
        }
    }

    #[tokio::test]
    async fn blocked_domain_and_handle_are_rejected() {
        let (policy, _temp_dir) = open_policy(&[]).await;
        let settings = AccountSettings::default();

        policy.block_domain("remote.example").await.unwrap();
        let result = policy.admit(&create_activity(), SENDER, &settings).await;
        assert!(matches!(result, Err(AppError::Blocked)));

        policy.unblock_domain("remote.example").await.unwrap();
        policy.block_actor("bob@remote.example").await.unwrap();
        let result = policy.admit(&create_activity(), SENDER, &settings).await;
        assert!(matches!(result, Err(AppError::Blocked)));
    }

    #[tokio::test]
    async fn blocked_word_rejects_create_content() {
        let (policy, _temp_dir) = open_policy(&[]).await;
        let settings = AccountSettings::default();
        policy.block_word("spam").await.unwrap();

        let mut activity = create_activity();
        activity["object"]["content"] = json!("<p>Buy SPAM now</p>");
        let result = policy.admit(&activity, SENDER, &settings).await;
        assert!(matches!(result, Err(AppError::Blocked)));
    }

    #[tokio::test]
    async fn blocked_hashtag_rejects_create() {
        let (policy, _temp_dir) = open_policy(&[]).await;
        let settings = AccountSettings::default();
        policy.block_word("crypto").await.unwrap();

        let mut activity = create_activity();
        activity["object"]["tag"] = json!([{"type": "Hashtag", "name": "#Crypto"}]);
        let result = policy.admit(&activity, SENDER, &settings).await;
        assert!(matches!(result, Err(AppError::Blocked)));
    }

    #[tokio::test]
    async fn daily_ceiling_rejects_after_recording() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let policy = AdmissionPolicy::load(store, &[], 2, 8640).await.unwrap();
        let settings = AccountSettings::default();

        policy.admit(&create_activity(), SENDER, &settings).await.unwrap();
        policy.record_accepted(SENDER).await;
        policy.admit(&create_activity(), SENDER, &settings).await.unwrap();
        policy.record_accepted(SENDER).await;

        let result = policy.admit(&create_activity(), SENDER, &settings).await;
        assert!(matches!(result, Err(AppError::RateLimited)));
    }

    #[tokio::test]
    async fn admit_alone_never_consumes_budget() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let policy = AdmissionPolicy::load(store, &[], 1, 1).await.unwrap();
        let settings = AccountSettings::default();

        for _ in 0..5 {
            policy.admit(&create_activity(), SENDER, &settings).await.unwrap();
        }
    }

    #[tokio::test]
    async fn capability_flags_deny_matching_types() {
        let (policy, _temp_dir) = open_policy(&[]).await;
        let settings = AccountSettings {
            allow_likes: false,
            allow_announces: false,
            allow_replies: false,
            ..AccountSettings::default()
        };

        let like = json!({
            "type": "Like",
            "id": "https://remote.example/likes/1",
            "actor": SENDER,
            "object": "http://localhost/users/alice/statuses/1"
        });
        assert!(matches!(
            policy.admit(&like, SENDER, &settings).await,
            Err(AppError::CapabilityDenied(_))
        ));

        let mut reply = create_activity();
        reply["object"]["inReplyTo"] = json!("http://localhost/users/alice/statuses/1");
        assert!(matches!(
            policy.admit(&reply, SENDER, &settings).await,
            Err(AppError::CapabilityDenied(_))
        ));

        // A plain Create is still fine with replies disabled.
        policy.admit(&create_activity(), SENDER, &settings).await.unwrap();
    }

    #[tokio::test]
    async fn policy_lists_survive_reload() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FsStore::open(temp_dir.path()).await.unwrap();
            let policy = AdmissionPolicy::load(store, &[], 8640, 8640).await.unwrap();
            policy.block_domain("remote.example").await.unwrap();
        }

        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let policy = AdmissionPolicy::load(store, &[], 8640, 8640).await.unwrap();
        let snapshot = policy.snapshot().await;
        assert!(snapshot.blocked_domains.contains(&"remote.example".to_string()));
    }
}
