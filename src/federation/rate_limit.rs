//! Rate limiting for federation
//!
//! Two policies live here: the rolling-window counters backing the daily
//! received-post ceilings, and the inbound request throttle that caps
//! in-flight federation requests per HTTP method.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Rate limiter entry
#[derive(Debug, Clone)]
struct RateLimitEntry {
    /// Number of accepted posts in the current window
    count: u32,
    /// Window start time
    window_start: Instant,
}

impl RateLimitEntry {
    fn is_expired(&self, window: Duration) -> bool {
        self.window_start.elapsed() >= window
    }
}

/// Rolling-window counter per key (remote domain or remote account)
///
/// Reads and writes are split so admission checks stay side-effect-free:
/// `is_limited` only inspects, `record` increments after an activity is
/// actually applied.
pub struct RateLimiter {
    entries: Arc<RwLock<HashMap<String, RateLimitEntry>>>,
    max_count: u32,
    window: Duration,
    max_tracked_keys: usize,
}

impl RateLimiter {
    /// Create a limiter with the given ceiling over a rolling window.
    pub fn new(max_count: u32, window: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_count,
            window,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }

    /// Check whether a key has reached its ceiling. Never mutates.
    pub async fn is_limited(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(self.window))
            .map(|entry| entry.count >= self.max_count)
            .unwrap_or(false)
    }

    /// Count one accepted post against a key.
    pub async fn record(&self, key: &str) {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= self.max_tracked_keys {
            let window = self.window;
            entries.retain(|_, entry| !entry.is_expired(window));
            if entries.len() >= self.max_tracked_keys {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.window_start)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                window_start: Instant::now(),
            });

        if entry.is_expired(self.window) {
            entry.count = 1;
            entry.window_start = Instant::now();
        } else {
            entry.count += 1;
        }
    }

    /// Current count for a key (0 when expired or untracked).
    pub async fn get_count(&self, key: &str) -> u32 {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(self.window))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Drop a key's counter (admin reset).
    pub async fn reset(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Drop counters whose window has rolled over.
    ///
    /// Called periodically from the background sweep, not per request.
    pub async fn prune_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let window = self.window;
        entries.retain(|_, entry| !entry.is_expired(window));
        let removed = before - entries.len();

        if removed > 0 {
            tracing::debug!("Pruned {} expired rate limit entries", removed);
        }
    }
}

/// Inbound request throttle
///
/// One in-flight federation request per HTTP method, with a minimum
/// spacing between accepted requests of the same method. Excess requests
/// fail fast with a retryable status; nothing is queued.
pub struct RequestThrottle {
    enabled: bool,
    min_interval: Duration,
    gates: Arc<StdMutex<HashMap<&'static str, MethodGate>>>,
}

#[derive(Debug, Default)]
struct MethodGate {
    in_flight: bool,
    last_accepted: Option<Instant>,
}

impl RequestThrottle {
    pub fn new(enabled: bool, min_interval: Duration) -> Self {
        Self {
            enabled,
            min_interval,
            gates: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Try to admit a request for the given method.
    ///
    /// The returned permit holds the in-flight slot until dropped.
    pub fn acquire(&self, method: &'static str) -> Result<ThrottlePermit, AppError> {
        if !self.enabled {
            return Ok(ThrottlePermit {
                gates: None,
                method,
            });
        }

        let mut gates = self.gates.lock().expect("throttle lock poisoned");
        let gate = gates.entry(method).or_default();

        if gate.in_flight {
            return Err(AppError::RateLimited);
        }
        if let Some(last) = gate.last_accepted {
            if last.elapsed() < self.min_interval {
                return Err(AppError::RateLimited);
            }
        }

        gate.in_flight = true;
        gate.last_accepted = Some(Instant::now());
        Ok(ThrottlePermit {
            gates: Some(self.gates.clone()),
            method,
        })
    }
}

/// In-flight slot for one throttled request
pub struct ThrottlePermit {
    gates: Option<Arc<StdMutex<HashMap<&'static str, MethodGate>>>>,
    method: &'static str,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if let Some(gates) = &self.gates {
            let mut gates = gates.lock().expect("throttle lock poisoned");
            if let Some(gate) = gates.get_mut(self.method) {
                gate.in_flight = false;
            }
        }
    }
}

/// Extract a normalized domain key from an actor URI or URL.
///
/// Default ports are stripped; explicit non-default ports are kept so
/// `example.com:8443` and `example.com` count separately.
pub fn extract_domain(uri: &str) -> String {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(parsed) = url::Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            return format_domain_key(host, parsed.port(), parsed.scheme());
        }
    }

    // Bare authority like "example.com:8443" or a handle's domain part.
    let authority = trimmed
        .split("://")
        .last()
        .unwrap_or(trimmed)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(trimmed)
        .trim();
    if authority.is_empty() {
        return String::new();
    }

    if let Ok(parsed) = url::Url::parse(&format!("https://{}", authority)) {
        if let Some(host) = parsed.host_str() {
            return format_domain_key(host, parsed.port(), "https");
        }
    }

    authority.trim_end_matches('.').to_ascii_lowercase()
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    if scheme.eq_ignore_ascii_case("http") {
        Some(80)
    } else if scheme.eq_ignore_ascii_case("https") {
        Some(443)
    } else {
        None
    }
}

fn format_domain_key(host: &str, port: Option<u16>, scheme: &str) -> String {
    let normalized_host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let normalized_port = port.filter(|p| Some(*p) != default_port_for_scheme(scheme));

    match normalized_port {
        Some(port) if normalized_host.contains(':') => format!("[{}]:{}", normalized_host, port),
        Some(port) => format!("{}:{}", normalized_host, port),
        None => normalized_host,
    }
}
