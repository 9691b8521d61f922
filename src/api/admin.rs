//! Admin API endpoints
//!
//! Federation administration: allow-list and block-list mutation, pending
//! follow approval, remote follows and local posting. All routes require
//! the configured bearer token; without one the router rejects everything.

use axum::{
    Router,
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::builder;

/// Create admin router
///
/// Routes:
/// - GET  /admin/policy - Current federation policy lists
/// - POST /admin/domains/allow - Add domain to the allow-list
/// - POST /admin/domains/disallow - Remove domain from the allow-list
/// - POST /admin/domains/block - Block a domain
/// - POST /admin/domains/unblock - Unblock a domain
/// - POST /admin/actors/block - Block an actor handle
/// - POST /admin/actors/unblock - Unblock an actor handle
/// - POST /admin/words/block - Block a word or hashtag
/// - POST /admin/follows/approve - Approve a pending follow request
/// - POST /admin/follows/deny - Deny a pending follow request
/// - POST /admin/follow - Follow a remote account
/// - POST /admin/post - Publish a local post
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/policy", get(policy))
        .route("/domains/allow", post(allow_domain))
        .route("/domains/disallow", post(disallow_domain))
        .route("/domains/block", post(block_domain))
        .route("/domains/unblock", post(unblock_domain))
        .route("/actors/block", post(block_actor))
        .route("/actors/unblock", post(unblock_actor))
        .route("/words/block", post(block_word))
        .route("/follows/approve", post(approve_follow))
        .route("/follows/deny", post(deny_follow))
        .route("/follow", post(follow_remote))
        .route("/post", post(publish_post))
}

/// Check the bearer token; admin routes are unusable when none is set.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.config.admin.token.as_deref() else {
        return Err(AppError::NotFound);
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Blocked),
    }
}

async fn policy(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;
    let snapshot = state.policy.snapshot().await;
    let value = serde_json::to_value(snapshot)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("policy encoding failed: {}", e)))?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
struct DomainRequest {
    domain: String,
}

#[derive(Debug, Deserialize)]
struct HandleRequest {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct WordRequest {
    word: String,
}

#[derive(Debug, Deserialize)]
struct FollowDecisionRequest {
    nickname: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
struct PostRequest {
    content: String,
    #[serde(default = "default_visibility")]
    visibility: String,
}

fn default_visibility() -> String {
    "public".to_string()
}

async fn allow_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DomainRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.allow_domain(&req.domain).await
}

async fn disallow_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DomainRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.disallow_domain(&req.domain).await
}

async fn block_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DomainRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.block_domain(&req.domain).await
}

async fn unblock_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DomainRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.unblock_domain(&req.domain).await
}

async fn block_actor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HandleRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.block_actor(&req.handle).await
}

async fn unblock_actor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HandleRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.unblock_actor(&req.handle).await
}

async fn block_word(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WordRequest>,
) -> Result<(), AppError> {
    authorize(&state, &headers)?;
    state.policy.block_word(&req.word).await
}

/// POST /admin/follows/approve
///
/// Moves a pending request to followers and notifies the remote actor
/// with an Accept. A failed Accept delivery does not undo the approval.
async fn approve_follow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FollowDecisionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;

    let approved = state
        .follows
        .approve_pending(&req.nickname, &req.handle)
        .await?;
    if !approved {
        return Err(AppError::NotFound);
    }

    if let Err(error) = respond_to_follow(&state, &req, true).await {
        tracing::error!(handle = %req.handle, %error, "Failed to deliver Accept");
    }
    Ok(Json(serde_json::json!({"approved": req.handle})))
}

/// POST /admin/follows/deny
async fn deny_follow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FollowDecisionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;

    let denied = state.follows.deny_pending(&req.nickname, &req.handle).await?;
    if !denied {
        return Err(AppError::NotFound);
    }

    if let Err(error) = respond_to_follow(&state, &req, false).await {
        tracing::error!(handle = %req.handle, %error, "Failed to deliver Reject");
    }
    Ok(Json(serde_json::json!({"denied": req.handle})))
}

/// Deliver the Accept/Reject for a manually decided follow request.
///
/// The original Follow activity id is not retained with the pending
/// entry, so the response wraps a reconstructed Follow.
async fn respond_to_follow(
    state: &AppState,
    req: &FollowDecisionRequest,
    accepted: bool,
) -> Result<(), AppError> {
    let remote_actor_url = state.webfinger.resolve(&req.handle).await?;
    let remote_actor = state.actor_cache.get_actor(&remote_actor_url).await?;
    let follow = serde_json::json!({
        "type": "Follow",
        "actor": remote_actor_url,
        "object": state.config.server.actor_url(&req.nickname),
    });

    if accepted {
        state
            .dispatcher
            .send_accept(follow, &remote_actor.inbox)
            .await
    } else {
        state
            .dispatcher
            .send_reject(follow, &remote_actor.inbox)
            .await
    }
}

/// POST /admin/follow
async fn follow_remote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HandleRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;
    let follow_id = state.dispatcher.send_follow(&req.handle).await?;
    Ok(Json(serde_json::json!({"follow_id": follow_id})))
}

/// POST /admin/post
///
/// Stores the note locally and fans it out to followers. Federation
/// delivery failures never fail the local post.
async fn publish_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PostRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;

    let nickname = state.config.account.nickname.clone();
    let (note_id, results) = state
        .dispatcher
        .send_create(&req.content, &req.visibility)
        .await?;

    // Local copy for the outbox collection.
    let actor_url = state.config.server.actor_url(&nickname);
    let (to, cc) = builder::audience_for_visibility(&actor_url, &req.visibility);
    let note = builder::note(
        &note_id,
        &actor_url,
        &req.content,
        &chrono::Utc::now().to_rfc3339(),
        to.iter().map(String::as_str).collect(),
        cc.iter().map(String::as_str).collect(),
    );
    state.store.put_json_new("objects", &note_id, &note).await?;

    let namespace = format!("accounts/{}", nickname);
    let mut outbox_index = state.store.read_lines(&namespace, "outbox").await?;
    outbox_index.push(note_id.clone());
    state
        .store
        .write_lines(&namespace, "outbox", &outbox_index)
        .await?;

    let delivered = results.iter().filter(|r| r.success).count();
    Ok(Json(serde_json::json!({
        "id": note_id,
        "delivered": delivered,
        "pending_retry": results.len() - delivered,
    })))
}
