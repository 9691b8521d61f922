//! ActivityPub endpoints
//!
//! - Actor documents
//! - Inbox (activity receiving)
//! - Outbox, followers and following collections

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;
use serde::Deserialize;

use crate::AppState;
use crate::data::FollowList;
use crate::error::AppError;
use crate::federation::{ProcessingState, record_state, verify_inbound};

/// Posts per outbox page (reference feed size).
const POSTS_PER_PAGE: usize = 20;

/// Handles per followers/following page (reference feed size).
const FOLLOWS_PER_PAGE: usize = 12;

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox collection
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

/// In secure mode every inbound GET must carry a valid signature, not
/// just POST deliveries.
async fn ensure_signed_get(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
) -> Result<(), AppError> {
    if !state.config.federation.secure_mode {
        return Ok(());
    }
    verify_inbound("GET", path, headers, None, &state.actor_cache, None).await?;
    Ok(())
}

/// GET /users/:username
///
/// Returns the ActivityPub Actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let _permit = state.throttle.acquire("GET")?;
    ensure_signed_get(&state, &headers, &format!("/users/{}", username)).await?;

    let account = state
        .accounts
        .get(&username)
        .await?
        .ok_or(AppError::NotFound)?;
    let settings = state.accounts.settings(&username).await?;
    let actor_url = state.config.server.actor_url(&username);

    Ok(Json(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor_url.clone(),
        "preferredUsername": account.nickname,
        "name": account.display_name.unwrap_or_else(|| account.nickname.clone()),
        "inbox": format!("{}/inbox", actor_url),
        "outbox": format!("{}/outbox", actor_url),
        "followers": format!("{}/followers", actor_url),
        "following": format!("{}/following", actor_url),
        "endpoints": {
            "sharedInbox": format!("{}/inbox", state.config.server.base_url())
        },
        "manuallyApprovesFollowers": settings.manual_approval,
        "url": actor_url.clone(),
        "publicKey": {
            "id": format!("{}#main-key", actor_url),
            "owner": actor_url,
            "publicKeyPem": account.public_key_pem
        }
    })))
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if state.accounts.get(&username).await?.is_none() {
        return Err(AppError::NotFound);
    }
    let path = format!("/users/{}/inbox", username);
    accept_delivery(&state, &path, headers, body, Some(&username)).await
}

/// POST /inbox
///
/// Shared inbox: one delivery endpoint for the whole instance.
async fn shared_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    accept_delivery(&state, "/inbox", headers, body, None).await
}

/// The inbound delivery pipeline.
///
/// Content-type and size checks come first and cost nothing; signature
/// verification (which may fetch the sender's actor) runs before any
/// admission decision; admission rejections map straight to 4xx.
async fn accept_delivery(
    state: &AppState,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
    username: Option<&str>,
) -> Result<StatusCode, AppError> {
    let _permit = state.throttle.acquire("POST")?;

    // Refuse non-JSON content outright.
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_activity_json(content_type) {
        return Err(AppError::Validation(format!(
            "Unsupported content type: {}",
            content_type
        )));
    }

    if body.len() > state.config.federation.max_body_bytes {
        return Err(AppError::Validation(format!(
            "Activity exceeds {} bytes",
            state.config.federation.max_body_bytes
        )));
    }

    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    let declared_actor = activity
        .get("actor")
        .and_then(|a| a.as_str())
        .ok_or_else(|| AppError::MalformedActivity("missing actor".to_string()))?
        .to_string();
    let activity_type = activity
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("Unknown")
        .to_string();
    record_state(&activity_type, ProcessingState::Received);

    // Fail-closed signature verification; the verified actor id is what
    // the rest of the pipeline trusts, never the body's claim alone.
    let verified_actor = verify_inbound(
        "POST",
        path,
        &headers,
        Some(&body),
        &state.actor_cache,
        Some(&declared_actor),
    )
    .await?;
    record_state(&activity_type, ProcessingState::Verified);

    state
        .inbox
        .process(activity, &verified_actor, username)
        .await?;
    Ok(StatusCode::OK)
}

fn is_activity_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        essence.as_str(),
        "application/json" | "application/activity+json" | "application/ld+json"
    )
}

/// Collection pagination query
#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<usize>,
}

/// Build an OrderedCollection, or one OrderedCollectionPage of it.
fn paginated_collection(
    collection_url: &str,
    items: Vec<serde_json::Value>,
    per_page: usize,
    page: Option<usize>,
) -> serde_json::Value {
    let total = items.len();
    match page {
        None => serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "OrderedCollection",
            "id": collection_url,
            "totalItems": total,
            "first": format!("{}?page=1", collection_url),
        }),
        Some(page) => {
            let page = page.max(1);
            let start = (page - 1).saturating_mul(per_page);
            let page_items: Vec<_> = items.into_iter().skip(start).take(per_page).collect();
            let mut body = serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "OrderedCollectionPage",
                "id": format!("{}?page={}", collection_url, page),
                "partOf": collection_url,
                "totalItems": total,
                "orderedItems": page_items,
            });
            if start + per_page < total {
                body["next"] = serde_json::json!(format!("{}?page={}", collection_url, page + 1));
            }
            body
        }
    }
}

/// Map a stored handle to an actor URI for collection output.
fn handle_to_actor_uri(handle: &str) -> String {
    if handle.starts_with("http://") || handle.starts_with("https://") {
        return handle.to_string();
    }
    match handle.split_once('@') {
        Some((nickname, domain)) => format!("https://{}/users/{}", domain, nickname),
        None => handle.to_string(),
    }
}

/// GET /users/:username/outbox
///
/// Public posts as a paginated OrderedCollection of Create activities.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let _permit = state.throttle.acquire("GET")?;
    ensure_signed_get(&state, &headers, &format!("/users/{}/outbox", username)).await?;

    if state.accounts.get(&username).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let actor_url = state.config.server.actor_url(&username);
    let outbox_url = format!("{}/outbox", actor_url);

    let note_ids = state
        .store
        .read_lines(&format!("accounts/{}", username), "outbox")
        .await?;
    let mut items = Vec::new();
    // Newest first.
    for note_id in note_ids.iter().rev() {
        let Some(note) = state.store.get_json("objects", note_id).await? else {
            continue;
        };
        if note.get("type").and_then(|t| t.as_str()) == Some("Tombstone") {
            continue;
        }
        items.push(serde_json::json!({
            "type": "Create",
            "id": format!("{}/activity", note_id),
            "actor": actor_url.clone(),
            "published": note.get("published").cloned().unwrap_or_default(),
            "to": note.get("to").cloned().unwrap_or_default(),
            "cc": note.get("cc").cloned().unwrap_or_default(),
            "object": note,
        }));
    }

    Ok(Json(paginated_collection(
        &outbox_url,
        items,
        POSTS_PER_PAGE,
        query.page,
    )))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    follow_collection(state, username, query.page, headers, FollowList::Followers).await
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    follow_collection(state, username, query.page, headers, FollowList::Following).await
}

async fn follow_collection(
    state: AppState,
    username: String,
    page: Option<usize>,
    headers: HeaderMap,
    list: FollowList,
) -> Result<Json<serde_json::Value>, AppError> {
    let _permit = state.throttle.acquire("GET")?;
    let suffix = match list {
        FollowList::Followers => "followers",
        _ => "following",
    };
    ensure_signed_get(
        &state,
        &headers,
        &format!("/users/{}/{}", username, suffix),
    )
    .await?;

    if state.accounts.get(&username).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let handles = state.follows.list(&username, list).await?;
    let items: Vec<serde_json::Value> = handles
        .iter()
        .map(|handle| serde_json::json!(handle_to_actor_uri(handle)))
        .collect();

    let collection_url = format!("{}/{}", state.config.server.actor_url(&username), suffix);
    Ok(Json(paginated_collection(
        &collection_url,
        items,
        FOLLOWS_PER_PAGE,
        page,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_check_accepts_activity_json_variants() {
        assert!(is_activity_json("application/json"));
        assert!(is_activity_json("application/activity+json"));
        assert!(is_activity_json(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(is_activity_json("application/JSON; charset=utf-8"));
        assert!(!is_activity_json("text/html"));
        assert!(!is_activity_json(""));
    }

    #[test]
    fn handles_map_to_actor_uris() {
        assert_eq!(
            handle_to_actor_uri("bob@remote.example"),
            "https://remote.example/users/bob"
        );
        assert_eq!(
            handle_to_actor_uri("https://remote.example/users/bob"),
            "https://remote.example/users/bob"
        );
    }

    #[test]
    fn pagination_splits_items_and_links_next() {
        let items: Vec<serde_json::Value> = (0..30).map(|n| serde_json::json!(n)).collect();

        let collection =
            paginated_collection("https://x.example/users/a/followers", items.clone(), 12, None);
        assert_eq!(collection["type"], "OrderedCollection");
        assert_eq!(collection["totalItems"], 30);

        let page1 =
            paginated_collection("https://x.example/users/a/followers", items.clone(), 12, Some(1));
        assert_eq!(page1["orderedItems"].as_array().unwrap().len(), 12);
        assert!(page1["next"].is_string());

        let page3 =
            paginated_collection("https://x.example/users/a/followers", items, 12, Some(3));
        assert_eq!(page3["orderedItems"].as_array().unwrap().len(), 6);
        assert!(page3["next"].is_null());
    }
}
