//! PKCE and random token helpers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes behind a code verifier; encodes to 43 base64url characters.
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind state and nonce values.
const TOKEN_BYTES: usize = 32;

/// A PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let code_verifier = random_token(VERIFIER_BYTES);
        let code_challenge = code_challenge(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
        }
    }
}

/// base64url(SHA-256(verifier)) without padding.
pub fn code_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    base64url(&digest)
}

/// Anti-CSRF state token.
pub fn generate_state() -> String {
    random_token(TOKEN_BYTES)
}

/// OIDC nonce bound into the ID token.
pub fn generate_nonce() -> String {
    random_token(TOKEN_BYTES)
}

/// `len` bytes from the OS-seeded CSPRNG, base64url encoded.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64url(&bytes)
}

pub fn base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7636_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_verifier_alphabet_and_length() {
        let pair = PkcePair::generate();
        assert!(pair.code_verifier.len() >= 43);
        assert!(pair
            .code_verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!pair.code_challenge.contains('='));
        assert_eq!(pair.code_challenge, code_challenge(&pair.code_verifier));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_state(), generate_state());
        assert_ne!(generate_nonce(), generate_nonce());
        assert_eq!(generate_state().len(), 43);
    }
}
