use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the payload signature on outbound deliveries.
pub const SIGNATURE_HEADER: &str = "X-Signature";

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str, timestamp: u64, payload: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Compute the hex HMAC-SHA256 signature over `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &str, timestamp: u64, payload: &[u8]) -> String {
    hex::encode(mac_for(secret, timestamp, payload).finalize().into_bytes())
}

/// Build the wire form of the signature header: `t=<timestamp>,v1=<hex>`.
///
/// Binding the timestamp into the signed material lets receivers reject
/// replayed deliveries by age without trusting the header alone.
pub fn signature_header(secret: &str, timestamp: u64, payload: &[u8]) -> String {
    let signature = compute_signature(secret, timestamp, payload);
    format!("t={timestamp},v1={signature}")
}

/// Verify a received signature in constant time.
pub fn verify_signature(secret: &str, timestamp: u64, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    mac_for(secret, timestamp, payload).verify_slice(&signature).is_ok()
}

/// Parsed contents of an `X-Signature` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub timestamp: u64,
    pub v1: String,
}

/// Parse `t=<timestamp>,v1=<hex>`. Unknown fields are ignored so the scheme
/// can grow new versions without breaking old receivers.
pub fn parse_signature_header(value: &str) -> Option<ParsedSignature> {
    let mut timestamp = None;
    let mut v1 = None;

    for part in value.split(',') {
        let (key, val) = part.trim().split_once('=')?;
        match key {
            "t" => timestamp = val.parse::<u64>().ok(),
            "v1" => v1 = Some(val.to_string()),
            _ => {}
        }
    }

    Some(ParsedSignature {
        timestamp: timestamp?,
        v1: v1?,
    })
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MalformedHeader,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call, as a receiver would.
pub fn verify_webhook_request(
    header_value: Option<&str>,
    payload: &[u8],
    secret: &str,
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError> {
    let value = header_value.ok_or(VerificationError::MissingSignature)?;
    let parsed = parse_signature_header(value).ok_or(VerificationError::MalformedHeader)?;

    if !is_timestamp_fresh(parsed.timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, parsed.timestamp, payload, &parsed.v1) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let sig = compute_signature("whsec_abc", 1706400000, b"{\"id\":42}");
        assert_eq!(sig, compute_signature("whsec_abc", 1706400000, b"{\"id\":42}"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_every_input() {
        let base = compute_signature("secret", 1706400000, b"payload");
        assert_ne!(base, compute_signature("other", 1706400000, b"payload"));
        assert_ne!(base, compute_signature("secret", 1706400001, b"payload"));
        assert_ne!(base, compute_signature("secret", 1706400000, b"payload2"));
    }

    #[test]
    fn header_round_trips_through_parse_and_verify() {
        let header = signature_header("secret", 1706400000, b"body");
        let parsed = parse_signature_header(&header).expect("parse");
        assert_eq!(parsed.timestamp, 1706400000);
        assert!(verify_signature("secret", parsed.timestamp, b"body", &parsed.v1));
        assert!(!verify_signature("secret", parsed.timestamp, b"tampered", &parsed.v1));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_signature_header("").is_none());
        assert!(parse_signature_header("v1=abc").is_none());
        assert!(parse_signature_header("t=notanumber,v1=abc").is_none());
        assert!(parse_signature_header("t=12 v1=abc").is_none());
    }

    #[test]
    fn parse_tolerates_unknown_fields() {
        let parsed = parse_signature_header("t=17,v0=old,v1=abc").expect("parse");
        assert_eq!(parsed.timestamp, 17);
        assert_eq!(parsed.v1, "abc");
    }

    #[test]
    fn freshness_window() {
        assert!(is_timestamp_fresh(100, 100, 300));
        assert!(is_timestamp_fresh(100, 400, 300));
        assert!(!is_timestamp_fresh(100, 401, 300));
        // Future-dated timestamps are never fresh.
        assert!(!is_timestamp_fresh(101, 100, 300));
    }

    #[test]
    fn one_call_verification() {
        let header = signature_header("secret", 1000, b"body");
        assert_eq!(
            verify_webhook_request(Some(&header), b"body", "secret", 300, 1100),
            Ok(())
        );
        assert_eq!(
            verify_webhook_request(None, b"body", "secret", 300, 1100),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_webhook_request(Some(&header), b"body", "secret", 300, 9999),
            Err(VerificationError::StaleTimestamp)
        );
        assert_eq!(
            verify_webhook_request(Some(&header), b"other", "secret", 300, 1100),
            Err(VerificationError::InvalidSignature)
        );
    }
}
