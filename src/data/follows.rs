//! Follow relationship lists
//!
//! Each local account keeps line-oriented handle lists: `followers`,
//! `following`, `follow_requests` (inbound, awaiting approval) and
//! `follow_requests_sent` (outbound, awaiting Accept/Reject).
//!
//! Invariant: an accepted follower never also appears in
//! `follow_requests`. All mutations to one account's lists run under that
//! account's lock so concurrent activities cannot interleave a
//! read-modify-write.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::store::FsStore;
use crate::error::AppError;

/// Which follow list to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowList {
    Followers,
    Following,
    PendingRequests,
    SentRequests,
}

impl FollowList {
    fn file_name(self) -> &'static str {
        match self {
            FollowList::Followers => "followers",
            FollowList::Following => "following",
            FollowList::PendingRequests => "follow_requests",
            FollowList::SentRequests => "follow_requests_sent",
        }
    }
}

/// Follow list store with per-account locking
#[derive(Clone)]
pub struct FollowStore {
    store: FsStore,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FollowStore {
    pub fn new(store: FsStore) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn namespace(nickname: &str) -> String {
        format!("accounts/{}", nickname)
    }

    async fn account_lock(&self, nickname: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(nickname.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read a follow list for an account.
    pub async fn list(&self, nickname: &str, list: FollowList) -> Result<Vec<String>, AppError> {
        self.store
            .read_lines(&Self::namespace(nickname), list.file_name())
            .await
    }

    async fn write_list(
        &self,
        nickname: &str,
        list: FollowList,
        lines: &[String],
    ) -> Result<(), AppError> {
        self.store
            .write_lines(&Self::namespace(nickname), list.file_name(), lines)
            .await
    }

    /// Append a follower, dropping any matching pending request.
    ///
    /// Returns `false` when the handle was already a follower.
    pub async fn add_follower(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        // An accepted follow must never stay pending.
        let pending = self.list(nickname, FollowList::PendingRequests).await?;
        if pending.iter().any(|h| h == handle) {
            let remaining: Vec<String> = pending.into_iter().filter(|h| h != handle).collect();
            self.write_list(nickname, FollowList::PendingRequests, &remaining)
                .await?;
        }

        let mut followers = self.list(nickname, FollowList::Followers).await?;
        if followers.iter().any(|h| h == handle) {
            return Ok(false);
        }
        followers.push(handle.to_string());
        self.write_list(nickname, FollowList::Followers, &followers)
            .await?;
        Ok(true)
    }

    /// Remove a follower. Returns `false` when the handle was absent.
    pub async fn remove_follower(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        let followers = self.list(nickname, FollowList::Followers).await?;
        if !followers.iter().any(|h| h == handle) {
            return Ok(false);
        }
        let remaining: Vec<String> = followers.into_iter().filter(|h| h != handle).collect();
        self.write_list(nickname, FollowList::Followers, &remaining)
            .await?;
        Ok(true)
    }

    /// Queue an inbound follow request for manual approval.
    ///
    /// A handle that is already a follower or already pending is a no-op.
    pub async fn add_pending(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        let followers = self.list(nickname, FollowList::Followers).await?;
        if followers.iter().any(|h| h == handle) {
            return Ok(false);
        }

        let mut pending = self.list(nickname, FollowList::PendingRequests).await?;
        if pending.iter().any(|h| h == handle) {
            return Ok(false);
        }
        pending.push(handle.to_string());
        self.write_list(nickname, FollowList::PendingRequests, &pending)
            .await?;
        Ok(true)
    }

    /// Approve a pending follow request: pending entry moves to followers.
    pub async fn approve_pending(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        {
            let lock = self.account_lock(nickname).await;
            let _guard = lock.lock().await;

            let pending = self.list(nickname, FollowList::PendingRequests).await?;
            if !pending.iter().any(|h| h == handle) {
                return Ok(false);
            }
        }
        self.add_follower(nickname, handle).await?;
        Ok(true)
    }

    /// Deny a pending follow request.
    pub async fn deny_pending(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        let pending = self.list(nickname, FollowList::PendingRequests).await?;
        if !pending.iter().any(|h| h == handle) {
            return Ok(false);
        }
        let remaining: Vec<String> = pending.into_iter().filter(|h| h != handle).collect();
        self.write_list(nickname, FollowList::PendingRequests, &remaining)
            .await?;
        Ok(true)
    }

    /// Append to the accounts this user follows.
    pub async fn add_following(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        let mut following = self.list(nickname, FollowList::Following).await?;
        if following.iter().any(|h| h == handle) {
            return Ok(false);
        }
        following.push(handle.to_string());
        self.write_list(nickname, FollowList::Following, &following)
            .await?;
        Ok(true)
    }

    /// Remove from the accounts this user follows.
    pub async fn remove_following(&self, nickname: &str, handle: &str) -> Result<bool, AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        let following = self.list(nickname, FollowList::Following).await?;
        if !following.iter().any(|h| h == handle) {
            return Ok(false);
        }
        let remaining: Vec<String> = following.into_iter().filter(|h| h != handle).collect();
        self.write_list(nickname, FollowList::Following, &remaining)
            .await?;
        Ok(true)
    }

    /// Record a locally sent Follow awaiting a remote Accept/Reject.
    ///
    /// Lines are `{handle} {follow_activity_uri}` so the response can be
    /// matched by either field.
    pub async fn record_sent_request(
        &self,
        nickname: &str,
        handle: &str,
        follow_uri: &str,
    ) -> Result<(), AppError> {
        let lock = self.account_lock(nickname).await;
        let _guard = lock.lock().await;

        let mut sent = self.list(nickname, FollowList::SentRequests).await?;
        let line = format!("{} {}", handle, follow_uri);
        if sent.iter().any(|l| l == &line) {
            return Ok(());
        }
        sent.push(line);
        self.write_list(nickname, FollowList::SentRequests, &sent)
            .await
    }

    /// Resolve a sent Follow by its activity URI (or target handle).
    ///
    /// On `accepted`, the handle moves to `following`; otherwise the
    /// pending entry is simply dropped. Returns the resolved handle, or
    /// `None` when no sent request matched (a late or replayed response).
    pub async fn resolve_sent_request(
        &self,
        nickname: &str,
        follow_uri_or_handle: &str,
        accepted: bool,
    ) -> Result<Option<String>, AppError> {
        let handle = {
            let lock = self.account_lock(nickname).await;
            let _guard = lock.lock().await;

            let sent = self.list(nickname, FollowList::SentRequests).await?;
            let matched = sent.iter().position(|line| {
                let mut parts = line.splitn(2, ' ');
                let handle = parts.next().unwrap_or_default();
                let uri = parts.next().unwrap_or_default();
                handle == follow_uri_or_handle || uri == follow_uri_or_handle
            });

            let Some(index) = matched else {
                return Ok(None);
            };

            let handle = sent[index]
                .splitn(2, ' ')
                .next()
                .unwrap_or_default()
                .to_string();
            let remaining: Vec<String> = sent
                .into_iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, line)| line)
                .collect();
            self.write_list(nickname, FollowList::SentRequests, &remaining)
                .await?;
            handle
        };

        if accepted {
            self.add_following(nickname, &handle).await?;
        }
        Ok(Some(handle))
    }
}
