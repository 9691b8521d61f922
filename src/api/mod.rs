//! HTTP handlers
//!
//! - `wellknown`: webfinger + host-meta discovery
//! - `activitypub`: actor documents, collections, inbox delivery
//! - `admin`: token-guarded federation administration
//! - `metrics`: Prometheus exposition

mod activitypub;
mod admin;
mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
