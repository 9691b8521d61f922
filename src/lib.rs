//! Driftwood - a lightweight federated ActivityPub delivery and inbox server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                       │
//! │  - WebFinger / host-meta discovery                          │
//! │  - ActivityPub actor, collections, inbox                    │
//! │  - Admin endpoints                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Core                          │
//! │  - Signature verification (fail closed)                     │
//! │  - Admission policy                                         │
//! │  - Inbox processing / outbound delivery                     │
//! │  - Actor + webfinger caches                                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                             │
//! │  - Key-addressable JSON object store                        │
//! │  - Accounts, follow lists                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for discovery, ActivityPub and admin
//! - `federation`: verification, admission, inbox, delivery, caches
//! - `data`: object store, accounts, follow lists
//! - `config`: configuration management
//! - `error`: error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use crate::data::{AccountStore, FollowStore, FsStore};
use crate::federation::{
    ActorCache, AdmissionPolicy, DeliverySettings, InboxProcessor, OutboxDispatcher,
    RequestSigner, RequestThrottle, WebfingerResolver,
};

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains shared resources:
/// the object store, caches, policy, and the federation pipeline.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Key-addressable JSON object store
    pub store: FsStore,

    /// Local account registry
    pub accounts: AccountStore,

    /// Follow relationship lists
    pub follows: FollowStore,

    /// Remote actor cache (memory + disk)
    pub actor_cache: Arc<ActorCache>,

    /// WebFinger resolver with positive/negative caches
    pub webfinger: Arc<WebfingerResolver>,

    /// Federation admission policy
    pub policy: Arc<AdmissionPolicy>,

    /// Inbox activity processor
    pub inbox: Arc<InboxProcessor>,

    /// Outbound delivery dispatcher
    pub dispatcher: Arc<OutboxDispatcher>,

    /// Inbound request throttle
    pub throttle: Arc<RequestThrottle>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Open the object store
    /// 2. Ensure the configured local account (generates keys on first boot)
    /// 3. Build the HTTP client and caches
    /// 4. Load the admission policy
    /// 5. Wire the dispatcher and inbox processor
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Object store
        let store = FsStore::open(&config.storage.base_dir).await?;
        tracing::info!(root = %config.storage.base_dir.display(), "Object store opened");

        // 2. Local account
        let accounts = AccountStore::new(store.clone());
        let account = accounts
            .ensure_account(
                &config.account.nickname,
                &config.account.display_name,
                config.account.manual_approval,
            )
            .await?;
        let follows = FollowStore::new(store.clone());

        // 3. HTTP client and caches
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("Driftwood/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(config.delivery.request_timeout_secs))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let webfinger = Arc::new(WebfingerResolver::new(
            http_client.clone(),
            config.server.protocol.clone(),
            Duration::from_secs(config.cache.webfinger_negative_ttl_secs),
        ));

        let actor_cache = Arc::new(ActorCache::new(
            store.clone(),
            http_client.clone(),
            Duration::from_secs(config.cache.actor_ttl_secs),
            Duration::from_secs(config.cache.probe_timeout_secs),
            config.server.domain.clone(),
        ));
        let key_id = config.server.key_id(&account.nickname);
        actor_cache
            .set_signer(RequestSigner {
                key_id: key_id.clone(),
                private_key_pem: account.private_key_pem.clone(),
            })
            .await;

        // 4. Admission policy
        let policy = Arc::new(
            AdmissionPolicy::load(
                store.clone(),
                &config.federation.allowed_domains,
                config.limits.received_per_domain_daily,
                config.limits.received_per_account_daily,
            )
            .await?,
        );
        tracing::info!("Admission policy loaded");

        // 5. Dispatcher and inbox processor
        let dispatcher = Arc::new(OutboxDispatcher::new(
            http_client.clone(),
            config.server.actor_url(&account.nickname),
            key_id,
            account.private_key_pem.clone(),
            account.nickname.clone(),
            webfinger.clone(),
            actor_cache.clone(),
            follows.clone(),
            DeliverySettings {
                max_concurrent: config.delivery.max_concurrent,
                max_attempts: config.delivery.max_attempts,
                base_backoff: Duration::from_secs(config.delivery.base_backoff_secs),
                retry_window: Duration::from_secs(config.delivery.retry_window_secs),
            },
        ));

        let inbox = Arc::new(
            InboxProcessor::new(
                store.clone(),
                accounts.clone(),
                follows.clone(),
                policy.clone(),
                config.server.domain.clone(),
                account.nickname.clone(),
            )
            .with_dispatcher(dispatcher.clone())
            .with_actor_cache(actor_cache.clone()),
        );

        let throttle = Arc::new(RequestThrottle::new(
            config.limits.inbound_throttle.enabled,
            Duration::from_secs(config.limits.inbound_throttle.min_interval_secs),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            store,
            accounts,
            follows,
            actor_cache,
            webfinger,
            policy,
            inbox,
            dispatcher,
            throttle,
            http_client,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .nest("/admin", api::admin_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
