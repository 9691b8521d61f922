//! ActivityPub federation core
//!
//! Handles:
//! - WebFinger resolution and JRD generation
//! - Remote actor caching
//! - HTTP Signatures (signing and fail-closed verification)
//! - Admission policy (allow-lists, blocks, rate limits, capabilities)
//! - Inbox activity processing
//! - Outbound delivery with bounded retry

mod actor_cache;
mod admission;
mod delivery;
mod inbox;
mod rate_limit;
mod signature;
mod webfinger;

pub use actor_cache::{ActorCache, RemoteActor, RequestSigner};
pub use admission::{AdmissionPolicy, PolicyDocument};
pub use delivery::{DeliveryResult, DeliverySettings, OutboxDispatcher, builder};
pub use inbox::{InboxProcessor, ProcessingState, record_state};
pub use rate_limit::{RateLimiter, RequestThrottle, ThrottlePermit, extract_domain};
pub use signature::{
    ParsedSignature, SignedHeaders, generate_digest, key_id_matches_actor, sign_request,
    verify_inbound, verify_with_key,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, WebfingerResolver, host_meta_xrd, local_account_jrd,
    parse_handle,
};
