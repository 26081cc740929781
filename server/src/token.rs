//! Reconnect tokens.
//!
//! Every room owns a `TokenService` seeded with its own random 32-byte
//! secret. A token binds (user_id, room_id) to that secret with an
//! HMAC-SHA256 tag, URL-safe base64 encoded. Tokens carry no expiry: they
//! stay valid exactly as long as the issuing room (and therefore its secret)
//! exists, and become useless the moment the room is destroyed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CLAIM_LEN: usize = 8;
const TAG_LEN: usize = 32;

/// The verified content of a reconnect token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectClaim {
    pub user_id: u32,
    pub room_id: u32,
}

/// Signs and verifies reconnect tokens for one room.
pub struct TokenService {
    secret: [u8; 32],
}

impl TokenService {
    /// Creates a service with a fresh random secret, unique per room.
    pub fn new() -> TokenService {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        TokenService { secret }
    }

    /// Issues a token binding `user_id` to `room_id`.
    pub fn issue(&self, user_id: u32, room_id: u32) -> String {
        let mut payload = Vec::with_capacity(CLAIM_LEN + TAG_LEN);
        payload.extend_from_slice(&user_id.to_be_bytes());
        payload.extend_from_slice(&room_id.to_be_bytes());

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(&payload);
        payload.extend_from_slice(&mac.finalize().into_bytes());

        URL_SAFE_NO_PAD.encode(payload)
    }

    /// Verifies a token and returns its claim, or `None` for anything that
    /// does not carry a valid signature from this room's secret.
    pub fn verify(&self, token: &str) -> Option<ReconnectClaim> {
        let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
        if bytes.len() != CLAIM_LEN + TAG_LEN {
            return None;
        }
        let (claim, tag) = bytes.split_at(CLAIM_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(claim);
        mac.verify_slice(tag).ok()?;

        Some(ReconnectClaim {
            user_id: u32::from_be_bytes(claim[0..4].try_into().ok()?),
            room_id: u32::from_be_bytes(claim[4..8].try_into().ok()?),
        })
    }
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_verify_roundtrip() {
        let svc = TokenService::new();
        let token = svc.issue(7, 42);
        let claim = svc.verify(&token).expect("token should verify");
        assert_eq!(claim.user_id, 7);
        assert_eq!(claim.room_id, 42);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let svc = TokenService::new();
        let token = svc.issue(7, 42);

        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        bytes[0] ^= 0x01;
        let forged = URL_SAFE_NO_PAD.encode(bytes);
        assert!(svc.verify(&forged).is_none());
    }

    #[test]
    fn token_from_another_room_secret_is_rejected() {
        let a = TokenService::new();
        let b = TokenService::new();
        let token = a.issue(7, 42);
        assert!(b.verify(&token).is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        let svc = TokenService::new();
        assert!(svc.verify("").is_none());
        assert!(svc.verify("not-base64!!!").is_none());
        assert!(svc.verify(&URL_SAFE_NO_PAD.encode(b"short")).is_none());
    }
}
