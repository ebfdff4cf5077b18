//! PKCE verifier/challenge generation for the authorization-code flow
//!
//! The accounts service rejects authorization requests without an S256
//! challenge, so a fresh pair is generated for every login attempt.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// PKCE challenge method constant.
pub const PKCE_METHOD: &str = "S256";

/// Random bytes behind the verifier; 32 bytes encode to 43 characters.
const VERIFIER_BYTES: usize = 32;

const NONCE_BYTES: usize = 16;

/// PKCE data for one authorization attempt.
#[derive(Debug, Clone)]
pub struct Pkce {
    /// The code verifier, sent only with the token exchange.
    pub verifier: String,

    /// SHA-256 of the verifier, base64url encoded without padding.
    pub challenge: String,

    /// OpenID nonce sent alongside the challenge.
    pub nonce: String,
}

impl Pkce {
    /// Generate a new verifier/challenge pair and nonce.
    #[must_use]
    pub fn generate() -> Self {
        let verifier = random_token(VERIFIER_BYTES);
        let challenge = Self::compute_challenge(&verifier);

        Self {
            verifier,
            challenge,
            nonce: random_token(NONCE_BYTES),
        }
    }

    /// Verify that a challenge matches a verifier.
    #[must_use]
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        Self::compute_challenge(verifier) == challenge
    }

    /// Compute the S256 challenge from a verifier.
    pub fn compute_challenge(verifier: &str) -> String {
        let hash = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
