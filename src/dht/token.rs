//! Rotating store tokens.
//!
//! A token is the digest of a node-local secret concatenated with the
//! requester's compact IP. Tokens gate `store` so a third party cannot make a
//! node announce addresses it never spoke to. Two secrets are live at any
//! time: the current one and the previous one, so a token issued just before
//! a rotation is still accepted once.

use super::constants::{self, HASH_LENGTH};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

pub struct TokenKeyring {
    secret: [u8; HASH_LENGTH],
    old_secret: [u8; HASH_LENGTH],
}

impl TokenKeyring {
    pub fn new() -> Self {
        Self {
            secret: fresh_secret(),
            old_secret: fresh_secret(),
        }
    }

    /// Issue a token for a requester's compact IP under the current secret.
    pub fn make_token(&self, compact_ip: &[u8]) -> Vec<u8> {
        digest_with(&self.secret, compact_ip)
    }

    /// A token is valid under either live secret.
    pub fn verify_token(&self, token: &[u8], compact_ip: &[u8]) -> bool {
        token == digest_with(&self.secret, compact_ip)
            || token == digest_with(&self.old_secret, compact_ip)
    }

    /// Retire the current secret and draw a new one. Called every
    /// token-secret refresh interval.
    pub fn rotate(&mut self) {
        self.old_secret = self.secret;
        self.secret = fresh_secret();
    }
}

impl Default for TokenKeyring {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_secret() -> [u8; HASH_LENGTH] {
    let mut rng = ChaCha20Rng::from_entropy();
    let mut secret = [0u8; HASH_LENGTH];
    rng.fill(&mut secret[..]);
    secret
}

fn digest_with(secret: &[u8], compact_ip: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(secret.len() + compact_ip.len());
    data.extend_from_slice(secret);
    data.extend_from_slice(compact_ip);
    constants::digest(&data).to_vec()
}
