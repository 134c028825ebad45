//! Pre-shared key handshake authentication.
//!
//! Each side signs `nonce + uid` with HMAC-SHA256 and puts the nonce and the
//! signature into its handshake payload; the receiving side verifies it in
//! `confirm_peer` with a constant-time comparison.

use crate::hooks::{Confirm, NetronHooks};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use netron_wire::{Handshake, Peer};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const NONCE_KEY: &str = "nonce";
const HMAC_KEY: &str = "auth_hmac";

/// Generate HMAC-SHA256 signature for handshake authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(data);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    match hmac_sign(secret, data) {
        Some(expected) => {
            subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
        }
        None => false,
    }
}

/// Hooks that admit only peers holding the same shared secret.
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl NetronHooks for SharedSecretAuth {
    async fn confirm_peer(&self, peer: &Arc<Peer>, handshake: &Handshake) -> Confirm {
        let nonce = handshake.payload.get(NONCE_KEY).and_then(Value::as_str);
        let signature = handshake.payload.get(HMAC_KEY).and_then(Value::as_str);
        match (nonce, signature) {
            (Some(nonce), Some(signature)) => {
                let data = format!("{nonce}{}", handshake.uid);
                if hmac_verify(&self.secret, data.as_bytes(), signature) {
                    Confirm::Accept
                } else {
                    warn!(peer = peer.id(), uid = %handshake.uid, "HMAC verification failed");
                    Confirm::Reject
                }
            }
            _ => {
                warn!(peer = peer.id(), uid = %handshake.uid, "handshake carries no credentials");
                Confirm::Reject
            }
        }
    }

    async fn handshake_payload(&self, _peer: &Arc<Peer>, handshake: &mut Handshake) {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let data = format!("{nonce}{}", handshake.uid);
        if let Some(signature) = hmac_sign(&self.secret, data.as_bytes()) {
            handshake
                .payload
                .insert(NONCE_KEY.to_string(), Value::String(nonce));
            handshake
                .payload
                .insert(HMAC_KEY.to_string(), Value::String(signature));
        }
    }
}
