//! Inbox activity processing
//!
//! Applies verified, admitted activities. Every activity moves through
//! `Received → Verified → Admitted → Applied` or ends in `Rejected` /
//! `Failed`; there are no backward transitions. Applying the same
//! activity id twice is a no-op, and activities touching the same post or
//! follow edge apply one at a time under a per-resource lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::actor_cache::ActorCache;
use super::admission::AdmissionPolicy;
use super::delivery::OutboxDispatcher;
use super::webfinger::parse_handle;
use crate::data::{AccountStore, EntityId, FollowStore, FsStore};
use crate::error::AppError;

const ACTIVITY_NAMESPACE: &str = "activities";
const OBJECT_NAMESPACE: &str = "objects";
const INTERACTION_NAMESPACE: &str = "interactions";
const HASHTAG_NAMESPACE: &str = "hashtags";

/// Terminal and intermediate states of one inbound activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Received,
    Verified,
    Admitted,
    Applied,
    Rejected,
    Failed,
}

impl ProcessingState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Received => "received",
            ProcessingState::Verified => "verified",
            ProcessingState::Admitted => "admitted",
            ProcessingState::Applied => "applied",
            ProcessingState::Rejected => "rejected",
            ProcessingState::Failed => "failed",
        }
    }
}

/// Record a pipeline state transition for an activity type.
pub fn record_state(activity_type: &str, state: ProcessingState) {
    crate::metrics::INBOX_ACTIVITIES_TOTAL
        .with_label_values(&[activity_type, state.as_str()])
        .inc();
}

/// Inbox processor
///
/// Owns the admitted-activity side effects: storing posts, follow state,
/// like/announce marks, tombstones.
pub struct InboxProcessor {
    store: FsStore,
    accounts: AccountStore,
    follows: FollowStore,
    policy: Arc<AdmissionPolicy>,
    /// Local instance authority (domain, possibly with port)
    local_domain: String,
    /// Nickname receiving shared-inbox deliveries
    primary_nickname: String,
    dispatcher: Option<Arc<OutboxDispatcher>>,
    actor_cache: Option<Arc<ActorCache>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InboxProcessor {
    pub fn new(
        store: FsStore,
        accounts: AccountStore,
        follows: FollowStore,
        policy: Arc<AdmissionPolicy>,
        local_domain: String,
        primary_nickname: String,
    ) -> Self {
        Self {
            store,
            accounts,
            follows,
            policy,
            local_domain,
            primary_nickname,
            dispatcher: None,
            actor_cache: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the dispatcher used for Accept/Reject responses.
    pub fn with_dispatcher(mut self, dispatcher: Arc<OutboxDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Attach the actor cache refreshed by Update activities.
    pub fn with_actor_cache(mut self, actor_cache: Arc<ActorCache>) -> Self {
        self.actor_cache = Some(actor_cache);
        self
    }

    async fn resource_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process a verified activity through admission and application.
    ///
    /// `nickname` is the target account (the primary account for
    /// shared-inbox deliveries). Admission rejections propagate as
    /// errors; semantic no-ops end `Applied`.
    pub async fn process(
        &self,
        activity: Value,
        actor_url: &str,
        nickname: Option<&str>,
    ) -> Result<ProcessingState, AppError> {
        let nickname = nickname.unwrap_or(&self.primary_nickname).to_string();
        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown")
            .to_string();

        let settings = self.accounts.settings(&nickname).await?;
        if let Err(rejection) = self.policy.admit(&activity, actor_url, &settings).await {
            record_state(&activity_type, ProcessingState::Rejected);
            tracing::info!(%actor_url, %activity_type, %rejection, "Activity rejected");
            return Err(rejection);
        }
        record_state(&activity_type, ProcessingState::Admitted);

        match self.apply(&activity, actor_url, &nickname).await {
            Ok(newly_applied) => {
                record_state(&activity_type, ProcessingState::Applied);
                if newly_applied {
                    self.policy.record_accepted(actor_url).await;
                }
                Ok(ProcessingState::Applied)
            }
            Err(error) => {
                record_state(&activity_type, ProcessingState::Failed);
                Err(error)
            }
        }
    }

    /// Apply an admitted activity's side effects.
    ///
    /// Returns `false` when the activity id was already applied. The
    /// activity document is stored last so a failed application retries
    /// cleanly; the individual side effects are themselves idempotent.
    async fn apply(
        &self,
        activity: &Value,
        actor_url: &str,
        nickname: &str,
    ) -> Result<bool, AppError> {
        let activity_id = activity
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::MalformedActivity("missing id".to_string()))?;

        let lock = self.resource_lock(activity_id).await;
        let _guard = lock.lock().await;

        if self.store.exists(ACTIVITY_NAMESPACE, activity_id).await {
            tracing::debug!(%activity_id, "Duplicate delivery, already applied");
            return Ok(false);
        }

        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default();
        match activity_type {
            "Create" => self.apply_create(activity, actor_url, nickname).await?,
            "Update" => self.apply_update(activity, actor_url).await?,
            "Delete" => self.apply_delete(activity, actor_url).await?,
            "Follow" => self.apply_follow(activity, actor_url).await?,
            "Accept" => self.apply_follow_response(activity, nickname, true).await?,
            "Reject" => self.apply_follow_response(activity, nickname, false).await?,
            "Like" => self.apply_like(activity, actor_url, nickname).await?,
            "Announce" => self.apply_announce(activity, actor_url, nickname).await?,
            "Undo" => self.apply_undo(activity, actor_url).await?,
            other => {
                tracing::debug!(activity_type = other, "Ignoring unhandled activity type");
            }
        }

        self.store
            .put_json_new(ACTIVITY_NAMESPACE, activity_id, activity)
            .await?;
        Ok(true)
    }

    // =========================================================================
    // Activity type handlers
    // =========================================================================

    async fn apply_create(
        &self,
        activity: &Value,
        actor_url: &str,
        nickname: &str,
    ) -> Result<(), AppError> {
        let object = activity
            .get("object")
            .ok_or_else(|| AppError::MalformedActivity("Create without object".to_string()))?;
        let object_type = object
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown");
        if object_type != "Note" && object_type != "Article" {
            return Ok(());
        }
        let Some(object_id) = object.get("id").and_then(|v| v.as_str()) else {
            return Err(AppError::MalformedActivity(
                "Create object without id".to_string(),
            ));
        };

        let mut stored_object = object.clone();
        if let Some(content) = object.get("content").and_then(|c| c.as_str()) {
            stored_object["content"] = json!(ammonia::clean(content));
        }

        // Write-once by object id; a redelivered or replayed Create is a
        // no-op, and a tombstoned object stays tombstoned.
        let newly_stored = self
            .store
            .put_json_new(OBJECT_NAMESPACE, object_id, &stored_object)
            .await?;
        if !newly_stored {
            return Ok(());
        }

        for tag in hashtag_names(object) {
            self.index_hashtag(&tag, object_id).await?;
        }

        if mentions_local_account(object, &self.local_domain, nickname) {
            self.append_notification(nickname, "mention", actor_url, Some(object_id))
                .await?;
        }

        Ok(())
    }

    async fn apply_update(&self, activity: &Value, actor_url: &str) -> Result<(), AppError> {
        let Some(object) = activity.get("object") else {
            return Ok(());
        };

        // Actor profile updates refresh the stored object; post edits
        // overwrite the stored copy when the sender owns it.
        let object_type = object.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let Some(object_id) = object.get("id").and_then(|v| v.as_str()) else {
            return Ok(());
        };

        if object_type == "Person" || object_type == "Service" {
            // Profile update: replace the cached actor document so the
            // next reference sees the new keys and endpoints.
            if same_origin(object_id, actor_url) {
                if let Some(actor_cache) = &self.actor_cache {
                    actor_cache.invalidate(object_id).await?;
                    actor_cache.put(object_id, object.clone()).await?;
                }
            }
            return Ok(());
        }

        let Some(existing) = self.store.get_json(OBJECT_NAMESPACE, object_id).await? else {
            return Ok(());
        };
        if !same_origin(
            existing
                .get("attributedTo")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
            actor_url,
        ) {
            tracing::debug!(%object_id, %actor_url, "Update actor does not own object, ignoring");
            return Ok(());
        }

        let mut updated = object.clone();
        if let Some(content) = object.get("content").and_then(|c| c.as_str()) {
            updated["content"] = json!(ammonia::clean(content));
        }
        self.store
            .put_json(OBJECT_NAMESPACE, object_id, &updated)
            .await
    }

    async fn apply_delete(&self, activity: &Value, actor_url: &str) -> Result<(), AppError> {
        let Some(target_uri) = delete_target_uri(activity) else {
            return Ok(());
        };

        let lock = self.resource_lock(&target_uri).await;
        let _guard = lock.lock().await;

        let Some(existing) = self.store.get_json(OBJECT_NAMESPACE, &target_uri).await? else {
            return Ok(());
        };
        if existing.get("type").and_then(|t| t.as_str()) == Some("Tombstone") {
            return Ok(());
        }
        if !same_origin(
            existing
                .get("attributedTo")
                .and_then(|v| v.as_str())
                .unwrap_or(&target_uri),
            actor_url,
        ) {
            tracing::debug!(%target_uri, %actor_url, "Delete actor does not own object, ignoring");
            return Ok(());
        }

        // Tombstone in place: the key stays occupied so a late duplicate
        // Create cannot resurrect the object.
        let tombstone = json!({
            "type": "Tombstone",
            "id": target_uri,
            "formerType": existing.get("type").cloned().unwrap_or(json!("Note")),
            "deleted": chrono::Utc::now().to_rfc3339(),
        });
        self.store
            .put_json(OBJECT_NAMESPACE, &target_uri, &tombstone)
            .await
    }

    async fn apply_follow(&self, activity: &Value, actor_url: &str) -> Result<(), AppError> {
        let target = follow_target(activity)?;
        let Some(nickname) = self.local_nickname_for(&target) else {
            return Err(AppError::Validation(
                "Follow target is not a local account".to_string(),
            ));
        };

        let follower_handle = handle_for_actor(actor_url);
        let settings = self.accounts.settings(&nickname).await?;

        if settings.manual_approval {
            if self.follows.add_pending(&nickname, &follower_handle).await? {
                self.append_notification(&nickname, "follow_request", actor_url, None)
                    .await?;
            }
            return Ok(());
        }

        if self.follows.add_follower(&nickname, &follower_handle).await? {
            self.append_notification(&nickname, "follow", actor_url, None)
                .await?;
        }

        // Auto-accept: echo the Follow back wrapped in an Accept. A
        // delivery failure never fails the inbox operation.
        if let Some(dispatcher) = &self.dispatcher {
            let follower_inbox = format!("{}/inbox", actor_url.trim_end_matches('/'));
            match dispatcher
                .send_accept(activity.clone(), &follower_inbox)
                .await
            {
                Ok(()) => tracing::info!(%follower_inbox, "Sent Accept for follow"),
                Err(error) => {
                    tracing::error!(%follower_inbox, %error, "Failed to send Accept")
                }
            }
        } else {
            tracing::warn!("No dispatcher configured, cannot send Accept");
        }

        Ok(())
    }

    /// Accept/Reject of a Follow we sent earlier.
    async fn apply_follow_response(
        &self,
        activity: &Value,
        nickname: &str,
        accepted: bool,
    ) -> Result<(), AppError> {
        let Some(object) = activity.get("object") else {
            return Ok(());
        };
        let reference = object
            .as_str()
            .or_else(|| object.get("id").and_then(|v| v.as_str()));
        let Some(reference) = reference else {
            return Ok(());
        };

        match self
            .follows
            .resolve_sent_request(nickname, reference, accepted)
            .await?
        {
            Some(handle) if accepted => {
                tracing::info!(%handle, "Follow accepted");
            }
            Some(handle) => {
                tracing::info!(%handle, "Follow rejected");
            }
            // A response for a Follow we never sent (or already resolved).
            None => {
                tracing::debug!(%reference, "Follow response matched no pending request");
            }
        }
        Ok(())
    }

    async fn apply_like(
        &self,
        activity: &Value,
        actor_url: &str,
        nickname: &str,
    ) -> Result<(), AppError> {
        let Some(target) = activity.get("object").and_then(|o| o.as_str()) else {
            return Ok(());
        };

        if self.mark_interaction(target, "likes", actor_url).await?
            && self.is_local_object(target)
        {
            self.append_notification(nickname, "favourite", actor_url, Some(target))
                .await?;
        }
        Ok(())
    }

    async fn apply_announce(
        &self,
        activity: &Value,
        actor_url: &str,
        nickname: &str,
    ) -> Result<(), AppError> {
        let Some(target) = activity.get("object").and_then(|o| o.as_str()) else {
            // Quote-style announces with embedded objects are ignored here.
            return Ok(());
        };

        if self.mark_interaction(target, "announces", actor_url).await?
            && self.is_local_object(target)
        {
            self.append_notification(nickname, "reblog", actor_url, Some(target))
                .await?;
        }
        Ok(())
    }

    async fn apply_undo(&self, activity: &Value, actor_url: &str) -> Result<(), AppError> {
        let Some(object) = activity.get("object") else {
            return Ok(());
        };

        // The undone activity arrives embedded or as a bare id; a bare id
        // is looked up among stored activities. Nothing found is a no-op.
        let (undone_type, undone_target) = match object {
            Value::String(reference) => match self.lookup_stored_activity(reference).await? {
                Some((t, target)) => (t, target),
                None => return Ok(()),
            },
            Value::Object(_) => {
                let undone_type = object
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
                let target = object
                    .get("object")
                    .and_then(|o| o.as_str())
                    .map(str::to_string);
                match (undone_type, target) {
                    (Some(t), Some(target)) => (t, target),
                    (Some(t), None) => {
                        let reference = object.get("id").and_then(|v| v.as_str());
                        match reference {
                            Some(reference) => {
                                match self.lookup_stored_activity(reference).await? {
                                    Some((_, target)) => (t, target),
                                    None => return Ok(()),
                                }
                            }
                            None => return Ok(()),
                        }
                    }
                    _ => return Ok(()),
                }
            }
            _ => return Ok(()),
        };

        match undone_type.as_str() {
            "Follow" => {
                if let Some(nickname) = self.local_nickname_for(&undone_target) {
                    let handle = handle_for_actor(actor_url);
                    if self.follows.remove_follower(&nickname, &handle).await? {
                        tracing::info!(%handle, "Unfollowed via Undo");
                    }
                }
            }
            "Like" => {
                self.unmark_interaction(&undone_target, "likes", actor_url)
                    .await?;
            }
            "Announce" => {
                self.unmark_interaction(&undone_target, "announces", actor_url)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Interaction marks (likes / announces)
    // =========================================================================

    /// Record one actor's like/announce on a post. Returns `false` when
    /// the mark already existed.
    async fn mark_interaction(
        &self,
        post_uri: &str,
        kind: &str,
        actor_url: &str,
    ) -> Result<bool, AppError> {
        let lock = self.resource_lock(post_uri).await;
        let _guard = lock.lock().await;

        let mut doc = self
            .store
            .get_json(INTERACTION_NAMESPACE, post_uri)
            .await?
            .unwrap_or_else(|| json!({"likes": [], "announces": []}));

        let list = doc
            .get_mut(kind)
            .and_then(|v| v.as_array_mut())
            .ok_or_else(|| AppError::Storage("malformed interaction record".to_string()))?;
        if list.iter().any(|v| v.as_str() == Some(actor_url)) {
            return Ok(false);
        }
        list.push(json!(actor_url));

        self.store
            .put_json(INTERACTION_NAMESPACE, post_uri, &doc)
            .await?;
        Ok(true)
    }

    /// Reverse a like/announce mark. Missing marks are a no-op.
    async fn unmark_interaction(
        &self,
        post_uri: &str,
        kind: &str,
        actor_url: &str,
    ) -> Result<(), AppError> {
        let lock = self.resource_lock(post_uri).await;
        let _guard = lock.lock().await;

        let Some(mut doc) = self.store.get_json(INTERACTION_NAMESPACE, post_uri).await? else {
            return Ok(());
        };
        let Some(list) = doc.get_mut(kind).and_then(|v| v.as_array_mut()) else {
            return Ok(());
        };
        let before = list.len();
        list.retain(|v| v.as_str() != Some(actor_url));
        if list.len() != before {
            self.store
                .put_json(INTERACTION_NAMESPACE, post_uri, &doc)
                .await?;
        }
        Ok(())
    }

    /// Number of recorded likes/announces for a post.
    pub async fn interaction_count(&self, post_uri: &str, kind: &str) -> Result<usize, AppError> {
        let Some(doc) = self.store.get_json(INTERACTION_NAMESPACE, post_uri).await? else {
            return Ok(0);
        };
        Ok(doc
            .get(kind)
            .and_then(|v| v.as_array())
            .map(|list| list.len())
            .unwrap_or(0))
    }

    /// Load a stored post object.
    pub async fn stored_object(&self, object_uri: &str) -> Result<Option<Value>, AppError> {
        self.store.get_json(OBJECT_NAMESPACE, object_uri).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn lookup_stored_activity(
        &self,
        activity_uri: &str,
    ) -> Result<Option<(String, String)>, AppError> {
        let Some(stored) = self.store.get_json(ACTIVITY_NAMESPACE, activity_uri).await? else {
            return Ok(None);
        };
        let stored_type = stored.get("type").and_then(|t| t.as_str());
        let target = stored.get("object").and_then(|o| o.as_str());
        Ok(match (stored_type, target) {
            (Some(t), Some(target)) => Some((t.to_string(), target.to_string())),
            _ => None,
        })
    }

    async fn index_hashtag(&self, tag: &str, object_id: &str) -> Result<(), AppError> {
        let normalized = tag.trim_start_matches('#').to_ascii_lowercase();
        if normalized.is_empty() {
            return Ok(());
        }

        let lock = self.resource_lock(&format!("hashtag:{}", normalized)).await;
        let _guard = lock.lock().await;

        let mut entries = self.store.read_lines(HASHTAG_NAMESPACE, &normalized).await?;
        if entries.iter().any(|line| line == object_id) {
            return Ok(());
        }
        entries.push(object_id.to_string());
        self.store
            .write_lines(HASHTAG_NAMESPACE, &normalized, &entries)
            .await
    }

    /// Posts indexed under a hashtag.
    pub async fn hashtag_index(&self, tag: &str) -> Result<Vec<String>, AppError> {
        self.store
            .read_lines(HASHTAG_NAMESPACE, &tag.trim_start_matches('#').to_ascii_lowercase())
            .await
    }

    async fn append_notification(
        &self,
        nickname: &str,
        kind: &str,
        actor_url: &str,
        object_uri: Option<&str>,
    ) -> Result<(), AppError> {
        let lock = self
            .resource_lock(&format!("notifications:{}", nickname))
            .await;
        let _guard = lock.lock().await;

        let namespace = format!("accounts/{}", nickname);
        let mut doc = self
            .store
            .get_json(&namespace, "notifications")
            .await?
            .unwrap_or_else(|| json!([]));
        let Some(entries) = doc.as_array_mut() else {
            return Err(AppError::Storage("malformed notification list".to_string()));
        };
        entries.push(json!({
            "id": EntityId::new().0,
            "type": kind,
            "actor": actor_url,
            "object": object_uri,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "read": false,
        }));

        self.store.put_json(&namespace, "notifications", &doc).await
    }

    /// Notifications recorded for an account.
    pub async fn notifications(&self, nickname: &str) -> Result<Vec<Value>, AppError> {
        let namespace = format!("accounts/{}", nickname);
        Ok(self
            .store
            .get_json(&namespace, "notifications")
            .await?
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default())
    }

    /// Map a follow target (URL, handle or acct: form) to a local nickname.
    fn local_nickname_for(&self, target: &str) -> Option<String> {
        let target = target.trim().trim_end_matches('/');
        if target.is_empty() {
            return None;
        }

        let (nickname, domain) = parse_handle(target).ok()?;
        if domain.eq_ignore_ascii_case(&self.local_domain) {
            Some(nickname)
        } else {
            None
        }
    }

    fn is_local_object(&self, object_uri: &str) -> bool {
        url::Url::parse(object_uri)
            .ok()
            .and_then(|url| {
                url.host_str().map(|host| {
                    let authority = match url.port() {
                        Some(port) => format!("{}:{}", host, port),
                        None => host.to_string(),
                    };
                    authority.eq_ignore_ascii_case(&self.local_domain)
                        || host.eq_ignore_ascii_case(&self.local_domain)
                })
            })
            .unwrap_or(false)
    }
}

/// Extract the Follow target (string or embedded `{id}` form).
fn follow_target(activity: &Value) -> Result<String, AppError> {
    let object = activity
        .get("object")
        .ok_or_else(|| AppError::MalformedActivity("Follow without object".to_string()))?;

    object
        .as_str()
        .or_else(|| object.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
        .ok_or_else(|| AppError::MalformedActivity("Follow object is not a reference".to_string()))
}

/// Extract the Delete target, tolerating Tombstone-wrapped objects.
fn delete_target_uri(activity: &Value) -> Option<String> {
    let object = activity.get("object")?;

    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    let is_tombstone = object
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|value| value.eq_ignore_ascii_case("Tombstone"));
    if is_tombstone {
        return object
            .get("object")
            .and_then(Value::as_str)
            .or_else(|| object.get("id").and_then(Value::as_str))
            .map(str::to_string);
    }

    object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `nickname@domain` for an actor URL, falling back to the URL itself.
fn handle_for_actor(actor_url: &str) -> String {
    parse_handle(actor_url)
        .map(|(nickname, domain)| {
            format!(
                "{}@{}",
                nickname.to_ascii_lowercase(),
                domain.to_ascii_lowercase()
            )
        })
        .unwrap_or_else(|_| actor_url.to_string())
}

fn same_origin(a: &str, b: &str) -> bool {
    let origin = |raw: &str| {
        url::Url::parse(raw).ok().and_then(|url| {
            url.host_str()
                .map(|host| (url.scheme().to_string(), host.to_ascii_lowercase(), url.port()))
        })
    };
    match (origin(a), origin(b)) {
        (Some(left), Some(right)) => left == right,
        _ => a == b,
    }
}

fn hashtag_names(object: &Value) -> Vec<String> {
    object
        .get("tag")
        .and_then(|t| t.as_array())
        .map(|tags| {
            tags.iter()
                .filter(|tag| tag.get("type").and_then(|t| t.as_str()) == Some("Hashtag"))
                .filter_map(|tag| tag.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a Create object mentions the given local account.
fn mentions_local_account(object: &Value, local_domain: &str, nickname: &str) -> bool {
    let needles = [
        format!("{}@{}", nickname, local_domain),
        format!("/users/{}", nickname),
        format!("/@{}", nickname),
    ];
    let matches_local = |value: &str| {
        needles.iter().any(|needle| value.contains(needle.as_str()))
            && (value.contains(local_domain) || value.contains('@'))
    };

    for field in ["to", "cc"] {
        if let Some(entries) = object.get(field).and_then(|v| v.as_array()) {
            if entries
                .iter()
                .filter_map(Value::as_str)
                .any(matches_local)
            {
                return true;
            }
        }
    }

    object
        .get("tag")
        .and_then(|t| t.as_array())
        .is_some_and(|tags| {
            tags.iter()
                .filter(|tag| tag.get("type").and_then(|t| t.as_str()) == Some("Mention"))
                .filter_map(|tag| tag.get("href").and_then(|h| h.as_str()))
                .any(matches_local)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AccountSettings, FollowList};
    use crate::federation::actor_cache::ActorCache;
    use crate::federation::delivery::DeliverySettings;
    use crate::federation::signature::test_support::generate_test_keypair;
    use crate::federation::webfinger::WebfingerResolver;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    const LOCAL_DOMAIN: &str = "localhost";
    const SENDER: &str = "https://remote.example/users/bob";

    struct TestHarness {
        processor: InboxProcessor,
        follows: FollowStore,
        accounts: AccountStore,
        _temp_dir: TempDir,
    }

    async fn harness() -> TestHarness {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let accounts = AccountStore::with_key_bits(store.clone(), 1024);
        let follows = FollowStore::new(store.clone());
        let policy = Arc::new(
            AdmissionPolicy::load(store.clone(), &[], 8640, 8640)
                .await
                .unwrap(),
        );

        let processor = InboxProcessor::new(
            store,
            accounts.clone(),
            follows.clone(),
            policy,
            LOCAL_DOMAIN.to_string(),
            "alice".to_string(),
        );

        TestHarness {
            processor,
            follows,
            accounts,
            _temp_dir: temp_dir,
        }
    }

    fn create_activity(id_suffix: &str) -> Value {
        json!({
            "type": "Create",
            "id": format!("https://remote.example/statuses/{}/activity", id_suffix),
            "actor": SENDER,
            "object": {
                "type": "Note",
                "id": format!("https://remote.example/statuses/{}", id_suffix),
                "attributedTo": SENDER,
                "content": "<p>hello</p>",
                "tag": [{"type": "Hashtag", "name": "#rustlang"}]
            }
        })
    }

    fn follow_activity(target: &str) -> Value {
        json!({
            "type": "Follow",
            "id": "https://remote.example/follows/1",
            "actor": SENDER,
            "object": target
        })
    }

    #[tokio::test]
    async fn duplicate_create_stores_exactly_one_post() {
        let h = harness().await;
        let activity = create_activity("1");

        let first = h.processor.process(activity.clone(), SENDER, None).await.unwrap();
        let second = h.processor.process(activity, SENDER, None).await.unwrap();

        assert_eq!(first, ProcessingState::Applied);
        assert_eq!(second, ProcessingState::Applied);

        let stored = h
            .processor
            .stored_object("https://remote.example/statuses/1")
            .await
            .unwrap()
            .expect("object stored");
        assert_eq!(stored["id"], "https://remote.example/statuses/1");
        // The hashtag index holds one entry despite the redelivery.
        let index = h.processor.hashtag_index("rustlang").await.unwrap();
        assert_eq!(index, vec!["https://remote.example/statuses/1".to_string()]);
    }

    #[tokio::test]
    async fn create_content_is_sanitized() {
        let h = harness().await;
        let mut activity = create_activity("2");
        activity["object"]["content"] = json!("<p>ok</p><script>alert(1)</script>");

        h.processor.process(activity, SENDER, None).await.unwrap();

        let stored = h
            .processor
            .stored_object("https://remote.example/statuses/2")
            .await
            .unwrap()
            .unwrap();
        let content = stored["content"].as_str().unwrap();
        assert!(!content.contains("script"));
        assert!(content.contains("ok"));
    }

    #[tokio::test]
    async fn mention_of_local_account_creates_notification() {
        let h = harness().await;
        let mut activity = create_activity("3");
        activity["object"]["tag"] = json!([
            {"type": "Mention", "href": "http://localhost/users/alice"}
        ]);

        h.processor.process(activity, SENDER, None).await.unwrap();

        let notifications = h.processor.notifications("alice").await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["type"], "mention");
    }

    #[tokio::test]
    async fn duplicate_follow_yields_single_follower_entry() {
        let h = harness().await;
        let activity = follow_activity("http://localhost/users/alice");

        h.processor.process(activity.clone(), SENDER, None).await.unwrap();
        h.processor.process(activity, SENDER, None).await.unwrap();

        let followers = h.follows.list("alice", FollowList::Followers).await.unwrap();
        assert_eq!(followers, vec!["bob@remote.example".to_string()]);
    }

    #[tokio::test]
    async fn follow_with_manual_approval_lands_in_pending() {
        let h = harness().await;
        h.accounts
            .put_settings(
                "alice",
                &AccountSettings {
                    manual_approval: true,
                    ..AccountSettings::default()
                },
            )
            .await
            .unwrap();

        h.processor
            .process(follow_activity("http://localhost/users/alice"), SENDER, None)
            .await
            .unwrap();

        let pending = h
            .follows
            .list("alice", FollowList::PendingRequests)
            .await
            .unwrap();
        let followers = h.follows.list("alice", FollowList::Followers).await.unwrap();
        assert_eq!(pending, vec!["bob@remote.example".to_string()]);
        assert!(followers.is_empty());
    }

    #[tokio::test]
    async fn follow_of_non_local_target_is_rejected() {
        let h = harness().await;
        let result = h
            .processor
            .process(
                follow_activity("https://elsewhere.example/users/zoe"),
                SENDER,
                None,
            )
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn follow_sends_accept_through_dispatcher() {
        use axum::{Router, routing::post};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::net::TcpListener;

        let deliveries = Arc::new(AtomicUsize::new(0));
        let deliveries_for_route = deliveries.clone();
        let app = Router::new().route(
            "/users/bob/inbox",
            post(move || {
                let deliveries = deliveries_for_route.clone();
                async move {
                    deliveries.fetch_add(1, Ordering::SeqCst);
                    http::StatusCode::ACCEPTED
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let accounts = AccountStore::with_key_bits(store.clone(), 1024);
        let follows = FollowStore::new(store.clone());
        let policy = Arc::new(
            AdmissionPolicy::load(store.clone(), &[], 8640, 8640)
                .await
                .unwrap(),
        );
        let http_client = Arc::new(reqwest::Client::new());
        let (private_key_pem, _) = generate_test_keypair();
        let dispatcher = Arc::new(OutboxDispatcher::new(
            http_client.clone(),
            "http://localhost/users/alice".to_string(),
            "http://localhost/users/alice#main-key".to_string(),
            private_key_pem,
            "alice".to_string(),
            Arc::new(WebfingerResolver::new(
                http_client.clone(),
                "http".to_string(),
                Duration::from_secs(300),
            )),
            Arc::new(ActorCache::new(
                store.clone(),
                http_client,
                Duration::from_secs(3600),
                Duration::from_secs(2),
                LOCAL_DOMAIN.to_string(),
            )),
            follows.clone(),
            DeliverySettings::default(),
        ));

        let processor = InboxProcessor::new(
            store,
            accounts,
            follows,
            policy,
            LOCAL_DOMAIN.to_string(),
            "alice".to_string(),
        )
        .with_dispatcher(dispatcher);

        let actor_url = format!("http://{}/users/bob", addr);
        let activity = json!({
            "type": "Follow",
            "id": format!("{}/follows/1", actor_url),
            "actor": actor_url,
            "object": "http://localhost/users/alice"
        });

        processor.process(activity, &actor_url, None).await.unwrap();
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn accept_of_sent_follow_moves_to_following() {
        let h = harness().await;
        let follow_uri = "http://localhost/users/alice/follow/1";
        h.follows
            .record_sent_request("alice", "carol@remote.example", follow_uri)
            .await
            .unwrap();

        let accept = json!({
            "type": "Accept",
            "id": "https://remote.example/accepts/1",
            "actor": "https://remote.example/users/carol",
            "object": {"type": "Follow", "id": follow_uri}
        });
        h.processor
            .process(accept, "https://remote.example/users/carol", None)
            .await
            .unwrap();

        let following = h.follows.list("alice", FollowList::Following).await.unwrap();
        assert_eq!(following, vec!["carol@remote.example".to_string()]);
    }

    #[tokio::test]
    async fn reject_of_sent_follow_drops_pending_entry() {
        let h = harness().await;
        let follow_uri = "http://localhost/users/alice/follow/2";
        h.follows
            .record_sent_request("alice", "carol@remote.example", follow_uri)
            .await
            .unwrap();

        let reject = json!({
            "type": "Reject",
            "id": "https://remote.example/rejects/1",
            "actor": "https://remote.example/users/carol",
            "object": follow_uri
        });
        h.processor
            .process(reject, "https://remote.example/users/carol", None)
            .await
            .unwrap();

        let following = h.follows.list("alice", FollowList::Following).await.unwrap();
        let sent = h.follows.list("alice", FollowList::SentRequests).await.unwrap();
        assert!(following.is_empty());
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn twenty_concurrent_likes_record_twenty_marks() {
        let h = Arc::new(harness().await);
        let post = "http://localhost/users/alice/statuses/1";

        let mut tasks = Vec::new();
        for n in 0..20 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                let actor = format!("https://remote{}.example/users/fan", n);
                let like = json!({
                    "type": "Like",
                    "id": format!("https://remote{}.example/likes/1", n),
                    "actor": actor,
                    "object": post
                });
                h.processor.process(like, &actor, None).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(h.processor.interaction_count(post, "likes").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn duplicate_like_from_same_actor_counts_once() {
        let h = harness().await;
        let post = "http://localhost/users/alice/statuses/1";
        let like = json!({
            "type": "Like",
            "id": "https://remote.example/likes/1",
            "actor": SENDER,
            "object": post
        });

        h.processor.process(like.clone(), SENDER, None).await.unwrap();
        h.processor.process(like, SENDER, None).await.unwrap();

        assert_eq!(h.processor.interaction_count(post, "likes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undo_of_unrecorded_like_is_applied_noop() {
        let h = harness().await;
        let undo = json!({
            "type": "Undo",
            "id": "https://remote.example/undos/1",
            "actor": SENDER,
            "object": {
                "type": "Like",
                "id": "https://remote.example/likes/never-sent",
                "object": "http://localhost/users/alice/statuses/1"
            }
        });

        let state = h.processor.process(undo, SENDER, None).await.unwrap();
        assert_eq!(state, ProcessingState::Applied);
        assert_eq!(
            h.processor
                .interaction_count("http://localhost/users/alice/statuses/1", "likes")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn undo_reverses_a_recorded_like() {
        let h = harness().await;
        let post = "http://localhost/users/alice/statuses/1";
        let like = json!({
            "type": "Like",
            "id": "https://remote.example/likes/1",
            "actor": SENDER,
            "object": post
        });
        h.processor.process(like, SENDER, None).await.unwrap();

        let undo = json!({
            "type": "Undo",
            "id": "https://remote.example/undos/2",
            "actor": SENDER,
            "object": {
                "type": "Like",
                "id": "https://remote.example/likes/1",
                "object": post
            }
        });
        h.processor.process(undo, SENDER, None).await.unwrap();

        assert_eq!(h.processor.interaction_count(post, "likes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undo_by_bare_id_locates_the_stored_activity() {
        let h = harness().await;
        let post = "http://localhost/users/alice/statuses/1";
        let like = json!({
            "type": "Like",
            "id": "https://remote.example/likes/1",
            "actor": SENDER,
            "object": post
        });
        h.processor.process(like, SENDER, None).await.unwrap();

        let undo = json!({
            "type": "Undo",
            "id": "https://remote.example/undos/3",
            "actor": SENDER,
            "object": "https://remote.example/likes/1"
        });
        h.processor.process(undo, SENDER, None).await.unwrap();

        assert_eq!(h.processor.interaction_count(post, "likes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undo_follow_removes_follower() {
        let h = harness().await;
        h.processor
            .process(follow_activity("http://localhost/users/alice"), SENDER, None)
            .await
            .unwrap();

        let undo = json!({
            "type": "Undo",
            "id": "https://remote.example/undos/4",
            "actor": SENDER,
            "object": {
                "type": "Follow",
                "id": "https://remote.example/follows/1",
                "object": "http://localhost/users/alice"
            }
        });
        h.processor.process(undo, SENDER, None).await.unwrap();

        let followers = h.follows.list("alice", FollowList::Followers).await.unwrap();
        assert!(followers.is_empty());
    }

    #[tokio::test]
    async fn delete_tombstones_and_blocks_resurrection() {
        let h = harness().await;
        h.processor
            .process(create_activity("9"), SENDER, None)
            .await
            .unwrap();

        let delete = json!({
            "type": "Delete",
            "id": "https://remote.example/deletes/1",
            "actor": SENDER,
            "object": {
                "type": "Tombstone",
                "id": "https://remote.example/statuses/9"
            }
        });
        h.processor.process(delete, SENDER, None).await.unwrap();

        let stored = h
            .processor
            .stored_object("https://remote.example/statuses/9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["type"], "Tombstone");

        // A late duplicate Create with a fresh activity id cannot
        // resurrect the tombstoned object.
        let mut replay = create_activity("9");
        replay["id"] = json!("https://remote.example/statuses/9/activity-replayed");
        h.processor.process(replay, SENDER, None).await.unwrap();

        let still_tombstone = h
            .processor
            .stored_object("https://remote.example/statuses/9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_tombstone["type"], "Tombstone");
    }

    #[tokio::test]
    async fn delete_from_non_owner_is_ignored() {
        let h = harness().await;
        h.processor
            .process(create_activity("10"), SENDER, None)
            .await
            .unwrap();

        let delete = json!({
            "type": "Delete",
            "id": "https://mallory.example/deletes/1",
            "actor": "https://mallory.example/users/mallory",
            "object": "https://remote.example/statuses/10"
        });
        h.processor
            .process(delete, "https://mallory.example/users/mallory", None)
            .await
            .unwrap();

        let stored = h
            .processor
            .stored_object("https://remote.example/statuses/10")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["type"], "Note");
    }

    #[tokio::test]
    async fn rejected_activity_reports_rejection() {
        let h = harness().await;
        h.processor.policy.block_domain("remote.example").await.unwrap();

        let result = h.processor.process(create_activity("11"), SENDER, None).await;
        assert!(matches!(result, Err(AppError::Blocked)));
        assert!(
            h.processor
                .stored_object("https://remote.example/statuses/11")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn follow_target_accepts_string_and_object_id_forms() {
        let string_form = json!({"object": "http://localhost/users/alice"});
        let object_form = json!({"object": {"id": "http://localhost/users/alice"}});
        assert_eq!(
            follow_target(&string_form).unwrap(),
            "http://localhost/users/alice"
        );
        assert_eq!(
            follow_target(&object_form).unwrap(),
            "http://localhost/users/alice"
        );
        assert!(follow_target(&json!({})).is_err());
    }

    #[test]
    fn delete_target_tolerates_tombstone_and_bare_forms() {
        assert_eq!(
            delete_target_uri(&json!({"object": "https://x.example/1"})).as_deref(),
            Some("https://x.example/1")
        );
        assert_eq!(
            delete_target_uri(
                &json!({"object": {"type": "Tombstone", "id": "https://x.example/2"}})
            )
            .as_deref(),
            Some("https://x.example/2")
        );
        assert!(delete_target_uri(&json!({})).is_none());
    }
}
