//! Connection authentication
//!
//! Each connect signs a fresh nonce and timestamp with HMAC-SHA256 over the
//! API secret. Only the MAC crosses the wire; the secret itself is never
//! sent or logged.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::config::EngineConfig;
use crate::sync::protocol::ClientFrame;

type HmacSha256 = Hmac<Sha256>;

/// Build a signed hello frame for the configured identity
pub fn hello_frame(config: &EngineConfig) -> ClientFrame {
    let nonce: [u8; 16] = rand::thread_rng().gen();
    let nonce = hex::encode(nonce);
    let ts = Utc::now().timestamp();
    let mac = sign(&config.api_secret, ts, &config.email, &config.api_key, &nonce);

    ClientFrame::Hello {
        user: config.email.clone(),
        key: config.api_key.clone(),
        nonce,
        ts,
        mac,
    }
}

/// HMAC-SHA256 over `"{ts}.{user}.{key}.{nonce}"`, hex encoded
fn sign(secret: &str, ts: i64, user: &str, key: &str, nonce: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");

    let message = format!("{}.{}.{}.{}", ts, user, key, nonce);
    mac.update(message.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}
