//! PKCE S256 challenge generation
//!
//! This module implements the Proof Key for Code Exchange (PKCE) extension
//! to OAuth 2.0 as defined in RFC 7636, restricted to the `S256` method.
//! PKCE is mandatory for every authorization attempt this client makes,
//! whatever the server advertises.
//!
//! # How PKCE works
//!
//! 1. The client generates a high-entropy random string called the `code_verifier`.
//! 2. The client computes a SHA-256 hash of the verifier and base64url-encodes
//!    it to produce the `code_challenge`.
//! 3. The authorization request includes `code_challenge` and
//!    `code_challenge_method=S256`.
//! 4. The token exchange request includes the original `code_verifier`.
//!
//! Randomness comes from the operating system. When the OS source fails,
//! [`generate`] returns [`NegotiatorError::Rng`]; there is no fallback to a
//! weaker generator.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use std::fmt;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{NegotiatorError, Result};

/// Number of random bytes behind each verifier. Encodes to 64 characters.
const VERIFIER_BYTES: usize = 48;

/// The only challenge method this client emits.
pub const CHALLENGE_METHOD: &str = "S256";

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A PKCE S256 challenge pair consisting of a verifier and its derived
/// challenge value.
///
/// `Debug` output redacts the verifier.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::auth::pkce::generate;
///
/// let pkce = generate().expect("OS random source available");
/// assert_eq!(pkce.method, "S256");
/// assert_eq!(pkce.verifier.len(), 64);
/// assert!(!format!("{:?}", pkce).contains(&pkce.verifier));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    /// The code verifier: 64 base64url characters (no padding), all drawn
    /// from the RFC 7636 unreserved set.
    pub verifier: String,

    /// The code challenge: base64url (no padding) SHA-256 digest of the
    /// verifier's ASCII bytes.
    pub challenge: String,

    /// The challenge method. Always `"S256"`.
    pub method: String,
}

impl fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .field("method", &self.method)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Generates a fresh PKCE S256 challenge.
///
/// # Errors
///
/// Returns [`NegotiatorError::Rng`] when the operating system random source
/// cannot be read.
pub fn generate() -> Result<PkceChallenge> {
    let mut random_bytes = [0u8; VERIFIER_BYTES];
    fill_secure_random(&mut random_bytes)?;

    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
    let challenge = challenge_for(&verifier);

    Ok(PkceChallenge {
        verifier,
        challenge,
        method: CHALLENGE_METHOD.to_string(),
    })
}

/// Computes the S256 challenge for `verifier`:
/// `BASE64URL(SHA256(ASCII(code_verifier)))`.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Fills `buf` from the operating system random source.
///
/// Shared with the `state` nonce generator in the authorization flow.
///
/// # Errors
///
/// Returns [`NegotiatorError::Rng`] if the OS source reports a failure.
pub fn fill_secure_random(buf: &mut [u8]) -> Result<()> {
    use rand::TryRngCore as _;

    rand::rngs::OsRng
        .try_fill_bytes(buf)
        .map_err(|e| NegotiatorError::Rng(e.to_string()).into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
