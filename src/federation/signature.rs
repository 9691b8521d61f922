//! HTTP Signatures for ActivityPub
//!
//! Outbound requests are signed with the local account key; inbound
//! deliveries are verified against the sending actor's published key,
//! resolved through the actor cache. Verification fails closed: a missing
//! header, an unresolvable actor and a cryptographic mismatch all read as
//! the same invalid-signature rejection.

use std::net::IpAddr;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use super::actor_cache::ActorCache;
use crate::error::AppError;

/// Accepted clock skew between the Date header and local time.
const DATE_WINDOW_SECS: i64 = 300;

/// Headers produced for a signed outbound request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616 format)
    pub date: String,
    /// Digest header value, present when the request has a body
    pub digest: Option<String>,
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: String,
}

impl ParsedSignature {
    /// Parse a `keyId="...",algorithm="...",headers="...",signature="..."`
    /// header value. Unknown fields are ignored.
    pub fn parse(header: &str) -> Result<Self, AppError> {
        let mut key_id = None;
        let mut algorithm = None;
        let mut headers = None;
        let mut signature = None;

        for part in header.split(',') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "keyId" => key_id = Some(value.to_string()),
                    "algorithm" => algorithm = Some(value.to_string()),
                    "headers" => {
                        headers = Some(
                            value
                                .split_whitespace()
                                .map(|s| s.to_ascii_lowercase())
                                .collect(),
                        )
                    }
                    "signature" => signature = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        Ok(Self {
            key_id: key_id.ok_or(AppError::InvalidSignature)?,
            algorithm: algorithm.ok_or(AppError::InvalidSignature)?,
            headers: headers.ok_or(AppError::InvalidSignature)?,
            signature: signature.ok_or(AppError::InvalidSignature)?,
        })
    }
}

/// `SHA-256=base64(hash)` digest for a request body.
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

/// Sign an outbound request.
///
/// Produces `Signature`, `Date` and (with a body) `Digest` header values
/// over `(request-target) host date [digest]`.
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignedHeaders, AppError> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = signed_host(&parsed_url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!(
            "(request-target): {} {}",
            method.to_lowercase(),
            path_and_query
        ),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut header_names = vec!["(request-target)", "host", "date"];
    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        header_names.push("digest");
    }
    let signing_string = signing_parts.join("\n");

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        header_names.join(" "),
        BASE64.encode(signature.to_bytes())
    );

    Ok(SignedHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Verify a request signature against a known public key.
///
/// Every failure path collapses to `InvalidSignature`; the specific
/// reason only reaches the debug log.
pub fn verify_with_key(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let parsed = ParsedSignature::parse(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return fail(format!("unsupported algorithm {}", parsed.algorithm));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return fail(format!("signed headers missing {}", required));
        }
    }
    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return fail("signed headers missing digest".to_string());
    }

    // Date freshness
    let date_value = header_str(headers, "date")?;
    let Ok(date) = DateTime::parse_from_rfc2822(date_value) else {
        return fail("unparseable Date header".to_string());
    };
    if (Utc::now().timestamp() - date.timestamp()).abs() > DATE_WINDOW_SECS {
        return fail("Date header outside the accepted window".to_string());
    }

    // Digest over the exact body bytes
    if let Some(body) = body {
        if header_str(headers, "digest")? != generate_digest(body) {
            return fail("digest mismatch".to_string());
        }
    }

    // Reconstruct the signing string from the declared header list.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            other => header_str(headers, other)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", name, value));
    }
    let signing_string = signing_parts.join("\n");

    let Ok(signature_bytes) = BASE64.decode(&parsed.signature) else {
        return fail("signature is not valid base64".to_string());
    };
    let Ok(public_key) = RsaPublicKey::from_public_key_pem(public_key_pem) else {
        return fail("unparseable public key".to_string());
    };
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let Ok(signature) = Pkcs1v15Signature::try_from(signature_bytes.as_slice()) else {
        return fail("malformed signature bytes".to_string());
    };

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

/// Verify an inbound delivery and return the verified actor URL.
///
/// Resolves the signing key through the actor cache, fetching the remote
/// actor if necessary. `expected_actor` (the activity's `actor` field)
/// must share an origin with the key when provided.
pub async fn verify_inbound(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    actor_cache: &ActorCache,
    expected_actor: Option<&str>,
) -> Result<String, AppError> {
    let parsed = ParsedSignature::parse(header_str(headers, "signature")?)?;
    let actor_url = actor_url_from_key_id(&parsed.key_id)?;

    if let Some(expected) = expected_actor {
        if !key_id_matches_actor(&parsed.key_id, expected) {
            return fail("signature keyId does not match activity actor".to_string());
        }
    }

    let actor = actor_cache
        .get_actor(&actor_url)
        .await
        .map_err(|_| AppError::InvalidSignature)?;

    // The actor must advertise the exact key the signature names.
    if parsed.key_id.contains('#') {
        match actor.public_key_id.as_deref() {
            Some(advertised) if advertised == parsed.key_id => {}
            _ => return fail("actor does not advertise the signing key".to_string()),
        }
    }

    let Some(public_key_pem) = actor.public_key_pem.as_deref() else {
        return fail("actor has no public key".to_string());
    };

    verify_with_key(method, path, headers, body, public_key_pem)?;
    Ok(actor.id)
}

/// The host value covered by the signature: includes an explicit
/// non-default port, matching the Host header the peer will see.
fn signed_host(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Whether a signature keyId refers to the same actor as an activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Validate a keyId URL and return the actor document URL it names.
///
/// Rejects non-HTTP(S) schemes and obvious local/private hosts so a
/// hostile signature cannot point key resolution at internal services.
pub fn actor_url_from_key_id(key_id: &str) -> Result<String, AppError> {
    let actor_url = key_id.split('#').next().unwrap_or(key_id);
    let parsed = url::Url::parse(actor_url).map_err(|_| AppError::InvalidSignature)?;

    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(AppError::InvalidSignature),
    }

    let host = parsed
        .host_str()
        .ok_or(AppError::InvalidSignature)?
        .to_ascii_lowercase();
    if is_disallowed_host(&host) {
        return Err(AppError::InvalidSignature);
    }

    Ok(actor_url.to_string())
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or(AppError::InvalidSignature)?
        .to_str()
        .map_err(|_| AppError::InvalidSignature)
}

fn fail<T>(reason: String) -> Result<T, AppError> {
    tracing::debug!(%reason, "Signature verification failed");
    Err(AppError::InvalidSignature)
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::test_support::{generate_test_keypair, signed_header_map};
    use super::*;
    use http::{HeaderMap, HeaderValue};

    const KEY_ID: &str = "https://remote.example/users/alice#main-key";

    #[test]
    fn valid_signed_request_verifies() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = signed_header_map(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(body),
            &private_key_pem,
            KEY_ID,
        );

        let result = verify_with_key("POST", &path, &headers, Some(body), &public_key_pem);
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn missing_signature_header_fails_closed() {
        let (_, public_key_pem) = generate_test_keypair();
        let headers = HeaderMap::new();

        assert!(matches!(
            verify_with_key("POST", "/inbox", &headers, None, &public_key_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn garbage_signature_header_fails_closed() {
        let (_, public_key_pem) = generate_test_keypair();
        for garbage in [
            "",
            "nonsense",
            "keyId=\"x\"",
            "keyId=\"x\",algorithm=\"rsa-sha256\"",
            "signature=\"AAAA\"",
        ] {
            let mut headers = HeaderMap::new();
            headers.insert("signature", HeaderValue::from_str(garbage).unwrap());
            assert!(
                matches!(
                    verify_with_key("POST", "/inbox", &headers, None, &public_key_pem),
                    Err(AppError::InvalidSignature)
                ),
                "expected fail-closed for {garbage:?}"
            );
        }
    }

    #[test]
    fn missing_date_header_fails_closed() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            KEY_ID,
        );
        headers.remove("date");

        assert!(matches!(
            verify_with_key("POST", &path, &headers, Some(body), &public_key_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn stale_date_fails_closed() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            KEY_ID,
        );
        headers.insert(
            "date",
            HeaderValue::from_static("Mon, 01 Jan 2001 00:00:00 GMT"),
        );

        assert!(matches!(
            verify_with_key("POST", &path, &headers, Some(body), &public_key_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_body_fails_digest_check() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            KEY_ID,
        );

        let tampered = br#"{"type":"Delete"}"#;
        assert!(matches!(
            verify_with_key("POST", &path, &headers, Some(tampered), &public_key_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn signature_without_signed_date_fails_closed() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            KEY_ID,
        );

        let parsed = ParsedSignature::parse(
            headers.get("signature").unwrap().to_str().unwrap(),
        )
        .unwrap();
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host digest\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        assert!(matches!(
            verify_with_key("POST", &path, &headers, Some(body), &public_key_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (private_key_pem, _) = generate_test_keypair();
        let (_, other_public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            KEY_ID,
        );

        assert!(matches!(
            verify_with_key("POST", &path, &headers, Some(body), &other_public_key_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn key_id_actor_match_requires_same_origin() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_url_guard_rejects_local_and_private_hosts() {
        assert!(matches!(
            actor_url_from_key_id("https://localhost/users/alice#main-key"),
            Err(AppError::InvalidSignature)
        ));
        assert!(matches!(
            actor_url_from_key_id("http://192.168.1.10/users/alice#main-key"),
            Err(AppError::InvalidSignature)
        ));
        assert!(matches!(
            actor_url_from_key_id("ftp://remote.example/users/alice"),
            Err(AppError::InvalidSignature)
        ));
        assert_eq!(
            actor_url_from_key_id("https://remote.example/users/alice#main-key").unwrap(),
            "https://remote.example/users/alice"
        );
    }

    #[test]
    fn round_trip_digest_is_stable() {
        let digest = generate_digest(b"hello");
        assert!(digest.starts_with("SHA-256="));
        assert_eq!(digest, generate_digest(b"hello"));
    }
}
