//! PKCE S256 challenge generation
//!
//! Implements the Proof Key for Code Exchange extension to OAuth 2.0
//! (RFC 7636) with the `S256` challenge method used by the authorization
//! code flow in this crate.
//!
//! The verifier is a 64-character lowercase hex string derived from 32
//! cryptographically random bytes; the challenge is the base64url-encoded
//! (no padding) SHA-256 digest of the verifier's ASCII bytes.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use base64::Engine as _;
use sha2::{Digest, Sha256};

/// A PKCE S256 challenge pair consisting of a verifier and its derived
/// challenge value.
///
/// # Examples
///
/// ```
/// use dynauth::pkce;
///
/// let challenge = pkce::generate();
/// assert_eq!(challenge.method, "S256");
/// assert_eq!(challenge.verifier.len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier: 32 random bytes rendered as 64 lowercase hex
    /// characters.  Sent to the token endpoint in the `code_verifier`
    /// parameter during the code exchange.
    pub verifier: String,

    /// The code challenge: base64url (no padding) SHA-256 digest of the
    /// verifier's ASCII bytes.  Sent to the authorization endpoint in the
    /// `code_challenge` parameter.
    pub challenge: String,

    /// The challenge method.  Always `"S256"`.
    pub method: String,
}

/// Generates a fresh PKCE S256 challenge pair.
pub fn generate() -> PkceChallenge {
    use rand::RngCore as _;

    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);

    let verifier: String = random_bytes.iter().map(|b| format!("{b:02x}")).collect();

    // RFC 7636 section 4.2: BASE64URL(SHA256(ASCII(code_verifier))).
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());

    PkceChallenge {
        verifier,
        challenge,
        method: "S256".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_is_64_hex_characters() {
        let pkce = generate();
        assert_eq!(pkce.verifier.len(), 64);
        assert!(
            pkce.verifier.chars().all(|c| c.is_ascii_hexdigit()),
            "verifier must be hex, got: {}",
            pkce.verifier
        );
    }

    #[test]
    fn test_challenge_is_s256_of_verifier() {
        let pkce = generate();

        let digest = Sha256::digest(pkce.verifier.as_bytes());
        let expected =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());

        assert_eq!(
            pkce.challenge, expected,
            "challenge must equal base64url(SHA256(verifier))"
        );
    }

    #[test]
    fn test_challenge_uses_url_safe_base64_no_padding() {
        let pkce = generate();
        assert!(
            pkce.challenge
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "challenge must only contain base64url characters, got: {}",
            pkce.challenge
        );
        assert!(!pkce.challenge.contains('='));
    }

    #[test]
    fn test_method_is_always_s256() {
        assert_eq!(generate().method, "S256");
    }

    #[test]
    fn test_generate_produces_unique_pairs() {
        let a = generate();
        let b = generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    /// RFC 7636 Appendix B known-answer vector for the S256 transform.
    #[test]
    fn test_s256_known_answer_rfc7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }
}
