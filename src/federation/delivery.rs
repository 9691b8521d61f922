//! Outbound activity delivery
//!
//! Fans a locally-authored activity out to remote inboxes: recipient
//! tokens expand to a snapshot of the follower list, destinations
//! deduplicate by shared inbox, and each POST is signed. Failed
//! destinations retry in the background with exponential backoff until a
//! hard attempt/elapsed-time ceiling, then are abandoned with a log
//! entry. The retry queue is in-memory and does not survive restarts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Semaphore;

use super::actor_cache::ActorCache;
use super::webfinger::WebfingerResolver;
use crate::data::{EntityId, FollowList, FollowStore};
use crate::error::AppError;

/// Retry and concurrency bounds for the dispatcher
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub retry_window: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_attempts: 8,
            base_backoff: Duration::from_secs(30),
            retry_window: Duration::from_secs(1800),
        }
    }
}

/// Result of the first delivery attempt to one inbox
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_uri: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Outbound dispatcher for one local actor
pub struct OutboxDispatcher {
    http_client: Arc<reqwest::Client>,
    /// Local actor URI
    actor_uri: String,
    /// Key ID for signatures
    key_id: String,
    /// Private key for signing
    private_key_pem: String,
    nickname: String,
    resolver: Arc<WebfingerResolver>,
    actor_cache: Arc<ActorCache>,
    follows: FollowStore,
    settings: DeliverySettings,
    pool: Arc<Semaphore>,
}

impl OutboxDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http_client: Arc<reqwest::Client>,
        actor_uri: String,
        key_id: String,
        private_key_pem: String,
        nickname: String,
        resolver: Arc<WebfingerResolver>,
        actor_cache: Arc<ActorCache>,
        follows: FollowStore,
        settings: DeliverySettings,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            http_client,
            actor_uri,
            key_id,
            private_key_pem,
            nickname,
            resolver,
            actor_cache,
            follows,
            settings,
            pool,
        }
    }

    /// Deliver an activity to a recipient list.
    ///
    /// Recipients may be actor URLs, `nickname@domain` handles, or the
    /// special tokens `followers` (snapshot of the follower list at
    /// dispatch time) and `public` (no inbox of its own, skipped).
    /// Returns the first-attempt results; failures keep retrying in the
    /// background.
    pub async fn deliver(
        self: &Arc<Self>,
        activity: serde_json::Value,
        recipients: Vec<String>,
    ) -> Vec<DeliveryResult> {
        let inboxes = self.resolve_recipients(&recipients).await;
        tracing::info!(
            count = inboxes.len(),
            "Delivering activity to {} unique inboxes",
            inboxes.len()
        );

        let activity = Arc::new(activity);
        let mut tasks = Vec::new();
        for inbox_uri in inboxes {
            let dispatcher = self.clone();
            let activity = activity.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.run_job(inbox_uri, activity).await
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            if let Ok(result) = task.await {
                results.push(result);
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "First-attempt delivery complete: {} succeeded, {} pending retry",
            succeeded,
            results.len() - succeeded
        );
        results
    }

    /// Expand recipient tokens and resolve them to unique inbox URLs.
    ///
    /// Instances advertising a shared inbox collapse to one delivery.
    async fn resolve_recipients(&self, recipients: &[String]) -> Vec<String> {
        let mut expanded: Vec<String> = Vec::new();
        for recipient in recipients {
            match recipient.as_str() {
                // Public addressing has no inbox.
                "public" | "as:Public" | "https://www.w3.org/ns/activitystreams#Public" => {}
                "followers" => {
                    match self.follows.list(&self.nickname, FollowList::Followers).await {
                        Ok(handles) => expanded.extend(handles),
                        Err(error) => {
                            tracing::warn!(%error, "Failed to snapshot follower list");
                        }
                    }
                }
                other => expanded.push(other.to_string()),
            }
        }

        // Resolve destinations concurrently, bounded like the delivery
        // pool itself.
        use futures::stream::{self, StreamExt};
        let resolved: Vec<Option<String>> = stream::iter(expanded)
            .map(|target| async move {
                match self.inbox_for_target(&target).await {
                    Ok(inbox_uri) => Some(inbox_uri),
                    Err(error) => {
                        tracing::warn!(%target, %error, "Skipping unresolvable recipient");
                        None
                    }
                }
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;

        let mut seen = HashSet::new();
        let mut inboxes = Vec::new();
        for inbox_uri in resolved.into_iter().flatten() {
            if seen.insert(inbox_uri.clone()) {
                inboxes.push(inbox_uri);
            }
        }
        inboxes
    }

    /// Resolve one recipient (handle or actor URL) to its delivery inbox.
    async fn inbox_for_target(&self, target: &str) -> Result<String, AppError> {
        let actor_url = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            self.resolver.resolve(target).await?
        };

        let actor = self.actor_cache.get_actor(&actor_url).await?;
        Ok(actor.delivery_inbox().to_string())
    }

    /// Run one destination's delivery job: first attempt plus bounded
    /// background retries.
    async fn run_job(
        self: Arc<Self>,
        inbox_uri: String,
        activity: Arc<serde_json::Value>,
    ) -> DeliveryResult {
        let started = Instant::now();

        let first = self.attempt(&inbox_uri, &activity).await;
        match first {
            Ok(()) => DeliveryResult {
                inbox_uri,
                success: true,
                error: None,
            },
            Err(error) => {
                let result = DeliveryResult {
                    inbox_uri: inbox_uri.clone(),
                    success: false,
                    error: Some(error.to_string()),
                };
                let dispatcher = self.clone();
                crate::metrics::DELIVERY_QUEUE_DEPTH
                    .with_label_values(&["retry"])
                    .inc();
                tokio::spawn(async move {
                    dispatcher.retry_loop(inbox_uri, activity, started).await;
                    crate::metrics::DELIVERY_QUEUE_DEPTH
                        .with_label_values(&["retry"])
                        .dec();
                });
                result
            }
        }
    }

    /// Retry a failed destination until success, the attempt ceiling, or
    /// the elapsed-time window runs out.
    async fn retry_loop(
        &self,
        inbox_uri: String,
        activity: Arc<serde_json::Value>,
        started: Instant,
    ) {
        let mut attempt: u32 = 1;
        loop {
            if attempt >= self.settings.max_attempts
                || started.elapsed() >= self.settings.retry_window
            {
                crate::metrics::DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&["abandoned"])
                    .inc();
                tracing::warn!(
                    "{}",
                    AppError::DeliveryAbandoned {
                        inbox: inbox_uri.clone(),
                        attempts: attempt,
                    }
                );
                return;
            }

            tokio::time::sleep(next_backoff(attempt, self.settings.base_backoff)).await;
            attempt += 1;

            match self.attempt(&inbox_uri, &activity).await {
                Ok(()) => {
                    tracing::info!(%inbox_uri, attempt, "Delivery succeeded after retry");
                    return;
                }
                Err(error) => {
                    tracing::debug!(%inbox_uri, attempt, %error, "Delivery attempt failed");
                }
            }
        }
    }

    /// One signed POST to one inbox, bounded by the worker pool.
    async fn attempt(&self, inbox_uri: &str, activity: &serde_json::Value) -> Result<(), AppError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| AppError::DeliveryFailed("worker pool closed".to_string()))?;

        let result = self.post_signed(inbox_uri, activity).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        crate::metrics::DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        result
    }

    async fn post_signed(
        &self,
        inbox_uri: &str,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let signed = super::signature::sign_request(
            "POST",
            inbox_uri,
            Some(&body),
            &self.private_key_pem,
            &self.key_id,
        )?;

        let mut request = self
            .http_client
            .post(inbox_uri)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::DeliveryFailed(format!("Failed to deliver to {}: {}", inbox_uri, e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::DeliveryFailed(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_uri,
                response.status()
            )));
        }

        tracing::debug!(%inbox_uri, "Delivered activity");
        Ok(())
    }

    /// Send an Accept for an incoming Follow.
    pub async fn send_accept(
        self: &Arc<Self>,
        follow_activity: serde_json::Value,
        follower_inbox: &str,
    ) -> Result<(), AppError> {
        let accept_id = format!("{}/accept/{}", self.actor_uri, EntityId::new().0);
        let activity = builder::accept(&accept_id, &self.actor_uri, follow_activity);
        self.post_signed(follower_inbox, &activity).await?;
        tracing::info!(%follower_inbox, "Sent Accept");
        Ok(())
    }

    /// Send a Reject for a denied Follow request.
    pub async fn send_reject(
        self: &Arc<Self>,
        follow_activity: serde_json::Value,
        follower_inbox: &str,
    ) -> Result<(), AppError> {
        let reject_id = format!("{}/reject/{}", self.actor_uri, EntityId::new().0);
        let activity = builder::reject(&reject_id, &self.actor_uri, follow_activity);
        self.post_signed(follower_inbox, &activity).await?;
        tracing::info!(%follower_inbox, "Sent Reject");
        Ok(())
    }

    /// Follow a remote account: records the pending outbound follow and
    /// delivers the Follow activity.
    pub async fn send_follow(self: &Arc<Self>, handle: &str) -> Result<String, AppError> {
        let target_actor = self.resolver.resolve(handle).await?;
        let target_inbox = self.inbox_for_target(&target_actor).await?;

        let follow_id = format!("{}/follow/{}", self.actor_uri, EntityId::new().0);
        self.follows
            .record_sent_request(&self.nickname, handle, &follow_id)
            .await?;

        let activity = builder::follow(&follow_id, &self.actor_uri, &target_actor);
        self.post_signed(&target_inbox, &activity).await?;
        tracing::info!(%handle, %follow_id, "Sent Follow");
        Ok(follow_id)
    }

    /// Publish a Note to followers (and optionally the public audience).
    pub async fn send_create(
        self: &Arc<Self>,
        content: &str,
        visibility: &str,
    ) -> Result<(String, Vec<DeliveryResult>), AppError> {
        let note_id = format!("{}/statuses/{}", self.actor_uri, EntityId::new().0);
        let (to, cc) = builder::audience_for_visibility(&self.actor_uri, visibility);

        let note = builder::note(
            &note_id,
            &self.actor_uri,
            content,
            &chrono::Utc::now().to_rfc3339(),
            to.iter().map(String::as_str).collect(),
            cc.iter().map(String::as_str).collect(),
        );
        let create_id = format!("{}/activity", note_id);
        let activity = builder::create(
            &create_id,
            &self.actor_uri,
            note,
            to.iter().map(String::as_str).collect(),
            cc.iter().map(String::as_str).collect(),
        );

        let results = self
            .deliver(activity, vec!["followers".to_string()])
            .await;
        Ok((note_id, results))
    }
}

/// Exponential backoff with jitter for retry attempt `attempt` (1-based).
fn next_backoff(attempt: u32, base: Duration) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let capped = base.saturating_mul(1u32.checked_shl(pow).unwrap_or(u32::MAX));
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..=1000);
    capped + Duration::from_millis(jitter_ms)
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// to/cc audiences for a given visibility level.
    pub fn audience_for_visibility(actor_uri: &str, visibility: &str) -> (Vec<String>, Vec<String>) {
        let public_audience = "https://www.w3.org/ns/activitystreams#Public".to_string();
        let followers_audience = format!("{}/followers", actor_uri);

        match visibility {
            "public" => (vec![public_audience], vec![followers_audience]),
            "unlisted" => (vec![followers_audience], vec![public_audience]),
            "private" => (vec![followers_audience], Vec::new()),
            "direct" => (Vec::new(), Vec::new()),
            _ => (vec![public_audience], vec![followers_audience]),
        }
    }

    /// Build a Follow activity.
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity wrapping the original Follow.
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity.
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Delete activity with a Tombstone object.
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    /// Build a Like activity.
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Announce activity.
    pub fn announce(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Undo activity wrapping the original.
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Note object.
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        to: Vec<&str>,
        cc: Vec<&str>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": to,
            "cc": cc,
            "sensitive": false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FsStore;
    use crate::federation::signature::test_support::generate_test_keypair;
    use axum::{Router, routing::get, routing::post};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct TestHarness {
        dispatcher: Arc<OutboxDispatcher>,
        follows: FollowStore,
        _temp_dir: TempDir,
    }

    async fn harness(settings: DeliverySettings) -> TestHarness {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::open(temp_dir.path()).await.unwrap();
        let follows = FollowStore::new(store.clone());
        let http_client = Arc::new(reqwest::Client::new());
        let resolver = Arc::new(WebfingerResolver::new(
            http_client.clone(),
            "http".to_string(),
            Duration::from_secs(300),
        ));
        let actor_cache = Arc::new(ActorCache::new(
            store,
            http_client.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(2),
            "localhost".to_string(),
        ));
        let (private_key_pem, _) = generate_test_keypair();

        let dispatcher = Arc::new(OutboxDispatcher::new(
            http_client,
            "http://localhost/users/alice".to_string(),
            "http://localhost/users/alice#main-key".to_string(),
            private_key_pem,
            "alice".to_string(),
            resolver,
            actor_cache.clone(),
            follows.clone(),
            settings,
        ));

        TestHarness {
            dispatcher,
            follows,
            _temp_dir: temp_dir,
        }
    }

    fn remote_actor(id: &str, inbox: &str, shared_inbox: Option<&str>) -> serde_json::Value {
        let mut doc = json!({
            "id": id,
            "type": "Person",
            "inbox": inbox,
        });
        if let Some(shared) = shared_inbox {
            doc["endpoints"] = json!({"sharedInbox": shared});
        }
        doc
    }

    async fn spawn_counting_inbox() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_route = hits.clone();
        let app = Router::new().route(
            "/inbox",
            post(move || {
                let hits = hits_for_route.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    http::StatusCode::ACCEPTED
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/inbox", addr), hits)
    }

    #[tokio::test]
    async fn followers_expansion_dedupes_shared_inbox() {
        let h = harness(DeliverySettings {
            max_attempts: 1,
            base_backoff: Duration::from_millis(10),
            retry_window: Duration::from_millis(100),
            ..DeliverySettings::default()
        })
        .await;
        let (inbox_url, hits) = spawn_counting_inbox().await;

        // Two followers on the same instance advertising one shared inbox.
        for name in ["bob", "carol"] {
            let actor_url = format!("https://remote.example/users/{}", name);
            h.dispatcher
                .actor_cache
                .put(
                    &actor_url,
                    remote_actor(
                        &actor_url,
                        &format!("https://remote.example/users/{}/inbox", name),
                        Some(&inbox_url),
                    ),
                )
                .await
                .unwrap();
            h.follows.add_follower("alice", &actor_url).await.unwrap();
        }

        let activity = builder::like("http://localhost/likes/1", "http://localhost/users/alice", "x");
        let results = h
            .dispatcher
            .deliver(activity, vec!["followers".to_string()])
            .await;

        assert_eq!(results.len(), 1, "shared inbox collapses to one delivery");
        assert!(results[0].success);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn public_token_is_skipped() {
        let h = harness(DeliverySettings::default()).await;
        let activity = builder::like("http://localhost/likes/2", "http://localhost/users/alice", "x");

        let results = h
            .dispatcher
            .deliver(
                activity,
                vec![
                    "public".to_string(),
                    "https://www.w3.org/ns/activitystreams#Public".to_string(),
                ],
            )
            .await;

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_retries_until_success() {
        let h = harness(DeliverySettings {
            max_concurrent: 4,
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            retry_window: Duration::from_secs(10),
        })
        .await;

        // Inbox fails twice, then accepts.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_route = hits.clone();
        let app = Router::new().route(
            "/inbox",
            post(move || {
                let hits = hits_for_route.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        http::StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        http::StatusCode::ACCEPTED
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let inbox_url = format!("http://{}/inbox", addr);

        let actor_url = "https://remote.example/users/bob";
        h.dispatcher
            .actor_cache
            .put(actor_url, remote_actor(actor_url, &inbox_url, None))
            .await
            .unwrap();

        let activity = builder::like("http://localhost/likes/3", "http://localhost/users/alice", "x");
        let results = h
            .dispatcher
            .deliver(activity, vec![actor_url.to_string()])
            .await;
        assert!(!results[0].success, "first attempt fails");

        // Background retries drive the inbox to acceptance.
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(hits.load(Ordering::SeqCst) >= 3, "retries reached the inbox");
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_ceiling() {
        let h = harness(DeliverySettings {
            max_concurrent: 2,
            max_attempts: 2,
            base_backoff: Duration::from_millis(10),
            retry_window: Duration::from_secs(10),
        })
        .await;

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_route = hits.clone();
        let app = Router::new().route(
            "/inbox",
            post(move || {
                let hits = hits_for_route.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let inbox_url = format!("http://{}/inbox", addr);

        let actor_url = "https://remote.example/users/bob";
        h.dispatcher
            .actor_cache
            .put(actor_url, remote_actor(actor_url, &inbox_url, None))
            .await
            .unwrap();

        let activity = builder::like("http://localhost/likes/4", "http://localhost/users/alice", "x");
        h.dispatcher
            .deliver(activity, vec![actor_url.to_string()])
            .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let total = hits.load(Ordering::SeqCst);
        assert!(
            total <= 2,
            "attempts bounded by max_attempts, saw {}",
            total
        );
    }

    #[tokio::test]
    async fn send_follow_records_pending_outbound_request() {
        let h = harness(DeliverySettings::default()).await;
        let (inbox_url, hits) = spawn_counting_inbox().await;

        // A webfinger remote answering for bob, pointing at a cached actor.
        let actor_url = "https://remote.example/users/bob".to_string();
        h.dispatcher
            .actor_cache
            .put(&actor_url, remote_actor(&actor_url, &inbox_url, None))
            .await
            .unwrap();

        let actor_url_static: &'static str = "https://remote.example/users/bob";
        let app = Router::new().route(
            "/.well-known/webfinger",
            get(move || async move {
                axum::Json(json!({
                    "subject": "acct:bob@remote.example",
                    "links": [
                        {"rel": "self", "type": "application/activity+json", "href": actor_url_static}
                    ]
                }))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let follow_id = h
            .dispatcher
            .send_follow(&format!("bob@127.0.0.1:{}", addr.port()))
            .await
            .unwrap();

        assert!(follow_id.contains("/follow/"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let sent = h
            .follows
            .list("alice", FollowList::SentRequests)
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].ends_with(&follow_id));
    }

    #[test]
    fn audience_for_visibility_matches_contract() {
        let (to, cc) =
            builder::audience_for_visibility("https://example.com/users/alice", "public");
        assert_eq!(to, vec!["https://www.w3.org/ns/activitystreams#Public"]);
        assert_eq!(cc, vec!["https://example.com/users/alice/followers"]);

        let (to, cc) =
            builder::audience_for_visibility("https://example.com/users/alice", "direct");
        assert!(to.is_empty());
        assert!(cc.is_empty());
    }

    #[test]
    fn backoff_grows_and_is_jittered() {
        let base = Duration::from_secs(30);
        let first = next_backoff(1, base);
        let third = next_backoff(3, base);
        assert!(first >= base);
        assert!(third >= Duration::from_secs(120));
    }
}
