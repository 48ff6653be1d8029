//! What a receiving endpoint does with the `X-Signature` header.

use webhook_courier::{signature_header, verify_webhook_request};

fn main() {
    let secret = "whsec_demo";
    let payload = br#"{"id":42}"#;
    let now = 1_706_400_000u64;

    // The pipeline sends this header alongside the payload.
    let header = signature_header(secret, now, payload);
    println!("X-Signature: {header}");

    // The receiver recomputes and checks freshness in one call.
    match verify_webhook_request(Some(&header), payload, secret, 300, now + 5) {
        Ok(()) => println!("verified: payload is authentic and fresh"),
        Err(err) => println!("rejected: {err:?}"),
    }

    // A tampered payload fails.
    let tampered = verify_webhook_request(Some(&header), br#"{"id":43}"#, secret, 300, now + 5);
    println!("tampered payload: {tampered:?}");
}
