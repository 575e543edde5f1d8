use axum::http::HeaderMap;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew for Standard Webhooks timestamps.
const TIMESTAMP_TOLERANCE_SECS: u64 = 5 * 60;

/// How an inbound request proves it came from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum SignatureScheme {
    /// `sha256=<hex>` HMAC of the raw body (GitHub style).
    HmacSha256 {
        #[serde(default = "default_hmac_header")]
        header: String,
    },
    /// `webhook-id` / `webhook-timestamp` / `webhook-signature` headers.
    StandardWebhooks,
    /// A header that must carry the secret verbatim.
    SharedToken {
        #[serde(default = "default_token_header")]
        header: String,
    },
}

fn default_hmac_header() -> String {
    "x-hub-signature-256".to_string()
}

fn default_token_header() -> String {
    "x-webhook-token".to_string()
}

impl Default for SignatureScheme {
    fn default() -> Self {
        SignatureScheme::HmacSha256 {
            header: default_hmac_header(),
        }
    }
}

impl SignatureScheme {
    /// Check the request against `secret` using this scheme.
    pub fn verify(&self, secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
        match self {
            SignatureScheme::HmacSha256 { header } => {
                verify_hmac_sha256(secret, body, header_str(headers, header))
            }
            SignatureScheme::StandardWebhooks => verify_standard_webhooks(
                secret,
                body,
                header_str(headers, "webhook-id"),
                header_str(headers, "webhook-timestamp"),
                header_str(headers, "webhook-signature"),
                chrono::Utc::now().timestamp(),
            ),
            SignatureScheme::SharedToken { header } => {
                verify_shared_token(secret, header_str(headers, header))
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Produce a `sha256=<hex>` signature for `body`.
pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a GitHub-style HMAC signature.
/// Expects header value like "sha256=<hex>".
pub fn verify_hmac_sha256(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let expected = match signature_header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    {
        Some(bytes) => bytes,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify a Standard Webhooks signature.
/// Header format: "v1,<base64>" (may be a space-separated list of sigs).
/// Signed payload: "<msg-id>.<timestamp>.<body>"
pub fn verify_standard_webhooks(
    secret: &str,
    body: &[u8],
    msg_id: &str,
    timestamp: &str,
    signature_header: &str,
    now: i64,
) -> bool {
    let ts: i64 = match timestamp.parse() {
        Ok(ts) => ts,
        Err(_) => return false,
    };
    if now.abs_diff(ts) > TIMESTAMP_TOLERANCE_SECS {
        return false;
    }

    // Secrets are usually "whsec_<base64>"; plain strings are accepted too.
    let raw = secret.strip_prefix("whsec_").unwrap_or(secret);
    let secret_bytes = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .unwrap_or_else(|_| raw.as_bytes().to_vec());

    let mut mac = match HmacSha256::new_from_slice(&secret_bytes) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(format!("{msg_id}.{timestamp}.").as_bytes());
    mac.update(body);

    signature_header
        .split_whitespace()
        .filter_map(|sig| sig.strip_prefix("v1,"))
        .filter_map(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok())
}

/// Verify a header value matches the secret exactly.
pub fn verify_shared_token(secret: &str, header_value: &str) -> bool {
    constant_time_eq(secret.as_bytes(), header_value.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn standard_sig(secret: &[u8], msg_id: &str, ts: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(format!("{msg_id}.{ts}.").as_bytes());
        mac.update(body);
        let b64 = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        format!("v1,{b64}")
    }

    #[test]
    fn test_hmac_round_trip() {
        let body = br#"{"event":"ping"}"#;
        let sig = sign_hmac_sha256("s3cr3t", body);
        assert!(sig.starts_with("sha256="));
        assert!(verify_hmac_sha256("s3cr3t", body, &sig));
    }

    #[test]
    fn test_hmac_rejects_wrong_secret_and_tampering() {
        let body = br#"{"event":"ping"}"#;
        let sig = sign_hmac_sha256("s3cr3t", body);
        assert!(!verify_hmac_sha256("other", body, &sig));
        assert!(!verify_hmac_sha256("s3cr3t", br#"{"event":"pong"}"#, &sig));
    }

    #[test]
    fn test_hmac_rejects_malformed_header() {
        let body = b"x";
        let sig = sign_hmac_sha256("s3cr3t", body);
        let bare = sig.trim_start_matches("sha256=");
        assert!(!verify_hmac_sha256("s3cr3t", body, bare));
        assert!(!verify_hmac_sha256("s3cr3t", body, "sha256=zz"));
        assert!(!verify_hmac_sha256("s3cr3t", body, ""));
    }

    #[test]
    fn test_standard_webhooks_valid() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"key-bytes");
        let sig = standard_sig(b"key-bytes", "msg_1", "1700000000", b"{}");
        let header = format!("v1,bogus {sig}");
        assert!(verify_standard_webhooks(
            &format!("whsec_{secret}"),
            b"{}",
            "msg_1",
            "1700000000",
            &header,
            1_700_000_010,
        ));
    }

    #[test]
    fn test_standard_webhooks_rejects_stale_timestamp() {
        let sig = standard_sig(b"plain", "msg_1", "1700000000", b"{}");
        assert!(!verify_standard_webhooks(
            "plain", b"{}", "msg_1", "1700000000", &sig, 1_700_001_000,
        ));
    }

    #[test]
    fn test_standard_webhooks_rejects_extreme_timestamps() {
        for ts in ["-9223372036854775808", "9223372036854775807"] {
            let sig = standard_sig(b"plain", "msg_1", ts, b"{}");
            assert!(!verify_standard_webhooks("plain", b"{}", "msg_1", ts, &sig, 1_700_000_000));
        }
        let sig = standard_sig(b"plain", "msg_1", "0", b"{}");
        assert!(!verify_standard_webhooks("plain", b"{}", "msg_1", "0", &sig, i64::MIN));
    }

    #[test]
    fn test_standard_webhooks_rejects_wrong_id() {
        let sig = standard_sig(b"plain", "msg_1", "1700000000", b"{}");
        assert!(!verify_standard_webhooks(
            "plain", b"{}", "msg_2", "1700000000", &sig, 1_700_000_000,
        ));
        assert!(!verify_standard_webhooks(
            "plain", b"{}", "msg_1", "not-a-number", &sig, 1_700_000_000,
        ));
    }

    #[test]
    fn test_shared_token() {
        assert!(verify_shared_token("tok", "tok"));
        assert!(!verify_shared_token("tok", "tok2"));
        assert!(!verify_shared_token("tok", ""));
    }

    #[test]
    fn test_scheme_verify_reads_configured_header() {
        let scheme = SignatureScheme::HmacSha256 {
            header: "x-signature".to_string(),
        };
        let body = b"payload";
        let mut headers = HeaderMap::new();
        let sig = sign_hmac_sha256("s3cr3t", body);
        headers.insert("x-signature", HeaderValue::from_str(&sig).unwrap());
        assert!(scheme.verify("s3cr3t", &headers, body));

        let default_scheme = SignatureScheme::default();
        assert!(!default_scheme.verify("s3cr3t", &headers, body));
    }

    #[test]
    fn test_scheme_deserializes_from_tag() {
        let scheme: SignatureScheme =
            serde_json::from_value(serde_json::json!({"scheme": "shared-token"})).unwrap();
        assert_eq!(
            scheme,
            SignatureScheme::SharedToken {
                header: "x-webhook-token".to_string()
            }
        );
        let scheme: SignatureScheme =
            serde_json::from_value(serde_json::json!({"scheme": "standard-webhooks"})).unwrap();
        assert_eq!(scheme, SignatureScheme::StandardWebhooks);
    }
}
