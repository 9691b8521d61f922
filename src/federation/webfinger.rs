//! WebFinger protocol implementation
//!
//! Resolves `nickname@domain` handles to ActivityPub actor URIs and
//! serves JRD documents for local accounts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerResponse {
    /// Actor URI from the `self` / `application/activity+json` link.
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_none_or(|t| t.contains("activity+json"))
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Parse a handle into `(nickname, domain)`.
///
/// Accepted forms:
/// - `nickname@domain[:port]`
/// - `acct:nickname@domain[:port]`
/// - `https://domain/@nickname`
/// - `https://domain/users/nickname`
///
/// The domain keeps any explicit port; callers strip it where the
/// webfinger `acct:` resource requires the bare domain.
pub fn parse_handle(handle: &str) -> Result<(String, String), AppError> {
    let trimmed = handle.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidHandle("empty handle".to_string()));
    }

    let stripped = trimmed
        .strip_prefix("acct:")
        .unwrap_or(trimmed)
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("dat://");

    let (nickname, domain) = if let Some((domain, nickname)) = stripped.split_once("/@") {
        (nickname, domain)
    } else if let Some((domain, nickname)) = stripped.split_once("/users/") {
        (nickname, domain)
    } else if let Some((nickname, domain)) = stripped.split_once('@') {
        (nickname, domain)
    } else {
        return Err(AppError::InvalidHandle(format!(
            "not a handle or actor URL: {}",
            handle
        )));
    };

    let nickname = nickname.trim_end_matches('/');
    let domain_is_plausible = domain.contains('.')
        || domain == "localhost"
        || domain.starts_with("localhost:")
        || domain.starts_with('[');
    if nickname.is_empty() || domain.is_empty() || !domain_is_plausible {
        return Err(AppError::InvalidHandle(format!(
            "missing nickname or domain: {}",
            handle
        )));
    }

    Ok((nickname.to_string(), domain.to_string()))
}

/// Strip an explicit port from a domain, for `acct:` resources and
/// cache keys.
fn port_stripped(domain: &str) -> String {
    if let Some(rest) = domain.strip_prefix('[') {
        // Bracketed IPv6 authority
        if let Some(end) = rest.find(']') {
            return format!("[{}]", &rest[..end]);
        }
    }
    domain
        .split_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| domain.to_string())
}

/// WebFinger resolver with positive and negative caches
///
/// Successful lookups are cached for the process lifetime keyed by the
/// normalized handle. Failures are cached separately with a short TTL so
/// an unreachable domain is not hammered on every reference.
pub struct WebfingerResolver {
    http_client: Arc<reqwest::Client>,
    http_prefix: String,
    cache: RwLock<HashMap<String, WebFingerResponse>>,
    negative: RwLock<HashMap<String, Instant>>,
    negative_ttl: Duration,
}

impl WebfingerResolver {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        http_prefix: String,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            http_client,
            http_prefix,
            cache: RwLock::new(HashMap::new()),
            negative: RwLock::new(HashMap::new()),
            negative_ttl,
        }
    }

    /// Resolve a handle to its ActivityPub actor URI.
    pub async fn resolve(&self, handle: &str) -> Result<String, AppError> {
        let record = self.resolve_record(handle).await?;
        record
            .actor_uri()
            .map(str::to_string)
            .ok_or(AppError::ActorNotFound)
    }

    /// Resolve a handle to its full JRD record.
    pub async fn resolve_record(&self, handle: &str) -> Result<WebFingerResponse, AppError> {
        let (nickname, domain) = parse_handle(handle)?;
        let normalized = format!("{}@{}", nickname, port_stripped(&domain));

        {
            let cache = self.cache.read().await;
            if let Some(record) = cache.get(&normalized) {
                crate::metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["webfinger"])
                    .inc();
                return Ok(record.clone());
            }
        }
        crate::metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["webfinger"])
            .inc();

        {
            let negative = self.negative.read().await;
            if let Some(failed_at) = negative.get(&normalized) {
                if failed_at.elapsed() < self.negative_ttl {
                    return Err(AppError::ResolutionFailed(format!(
                        "webfinger for {} recently failed",
                        normalized
                    )));
                }
            }
        }

        let url = format!("{}://{}/.well-known/webfinger", self.http_prefix, domain);
        let response = match self
            .http_client
            .get(&url)
            .query(&[("resource", format!("acct:{}", normalized))])
            .header("Accept", "application/jrd+json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                self.remember_failure(&normalized).await;
                return Err(AppError::ResolutionFailed(format!(
                    "webfinger request to {} failed: {}",
                    domain, error
                )));
            }
        };

        if !response.status().is_success() {
            self.remember_failure(&normalized).await;
            return Err(AppError::ActorNotFound);
        }

        let record: WebFingerResponse = match response.json().await {
            Ok(record) => record,
            Err(error) => {
                self.remember_failure(&normalized).await;
                return Err(AppError::ResolutionFailed(format!(
                    "invalid JRD from {}: {}",
                    domain, error
                )));
            }
        };

        let mut cache = self.cache.write().await;
        cache.insert(normalized, record.clone());
        crate::metrics::CACHE_SIZE
            .with_label_values(&["webfinger"])
            .set(cache.len() as i64);
        Ok(record)
    }

    async fn remember_failure(&self, normalized: &str) {
        let mut negative = self.negative.write().await;
        negative.insert(normalized.to_string(), Instant::now());
    }

    /// Drop expired negative-cache entries.
    pub async fn prune_negative(&self) {
        let mut negative = self.negative.write().await;
        let ttl = self.negative_ttl;
        negative.retain(|_, failed_at| failed_at.elapsed() < ttl);
    }

    #[cfg(test)]
    async fn is_negatively_cached(&self, normalized: &str) -> bool {
        self.negative.read().await.contains_key(normalized)
    }
}

/// Build the JRD document served for a local account.
pub fn local_account_jrd(nickname: &str, domain: &str, base_url: &str) -> WebFingerResponse {
    let base = base_url.trim_end_matches('/');
    let actor_url = format!("{}/users/{}", base, nickname);
    let profile_url = format!("{}/@{}", base, nickname);

    WebFingerResponse {
        subject: format!("acct:{}@{}", nickname, domain),
        aliases: Some(vec![profile_url.clone(), actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(profile_url),
                template: None,
            },
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_url),
                template: None,
            },
            WebFingerLink {
                rel: "http://ostatus.org/schema/1.0/subscribe".to_string(),
                link_type: None,
                href: None,
                template: Some(format!("{}/authorize_interaction?uri={{uri}}", base)),
            },
        ],
    }
}

/// Build the host-meta XRD pointing at the webfinger endpoint.
pub fn host_meta_xrd(base_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url.trim_end_matches('/')
    )
}
