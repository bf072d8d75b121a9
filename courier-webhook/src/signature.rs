//! Request signing for webhook deliveries.
//!
//! The signature is `hex(HMAC-SHA256(secret, "{timestamp}.{body}"))`, where
//! `timestamp` is the Unix time in seconds sent in `X-Webhook-Timestamp`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

fn mac_for(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

pub fn compute_signature(secret: &str, timestamp: i64, body: &[u8]) -> String {
    hex::encode(mac_for(secret, timestamp, body).finalize().into_bytes())
}

/// Receiver-side check. Comparison is constant time.
pub fn verify_signature(secret: &str, timestamp: i64, body: &[u8], signature: &str) -> bool {
    match hex::decode(signature) {
        Ok(bytes) => mac_for(secret, timestamp, body).verify_slice(&bytes).is_ok(),
        Err(_) => false,
    }
}
