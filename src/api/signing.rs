//! HMAC-SHA256 request signing shared by the exchange clients.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// Receive window sent with every signed request, in milliseconds.
pub const RECV_WINDOW_MS: &str = "5000";

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Signing(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Current Unix time in milliseconds.
pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}
