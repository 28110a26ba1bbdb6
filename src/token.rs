//! Per-run token authenticating transport callbacks.
//!
//! Minted once at daemon start from the OS randomness source, handed to
//! the transport via its environment and verified in constant time on
//! every incoming config update. Never persisted, never logged.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

const TOKEN_BYTES: usize = 16;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("randomness source unavailable: {0}")]
    Randomness(#[from] rand::Error),
}

/// Run token for client authentication.
#[derive(Clone)]
pub struct Token(String);

impl Token {
    /// Mint a new token from the OS randomness source.
    ///
    /// Failure is fatal to daemon start; there is no weaker fallback.
    pub fn generate() -> Result<Self, TokenError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        let a = self.0.as_bytes();
        let b = presented.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.ct_eq(b).into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The token is a secret; keep it out of debug output and logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let token = Token::generate().unwrap();
        // 16 bytes -> 22 base64 chars without padding
        assert_eq!(token.as_str().len(), 22);
        assert!(!token.as_str().contains('='));
    }

    #[test]
    fn test_tokens_differ() {
        let a = Token::generate().unwrap();
        let b = Token::generate().unwrap();
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_matches() {
        let token = Token::generate().unwrap();
        let copy = token.as_str().to_string();
        assert!(token.matches(&copy));
        assert!(!token.matches(""));
        assert!(!token.matches("wrong"));

        let mut flipped = copy.into_bytes();
        flipped[0] ^= 0x01;
        assert!(!token.matches(std::str::from_utf8(&flipped).unwrap()));
    }

    #[test]
    fn test_debug_redacted() {
        let token = Token::generate().unwrap();
        let debug = format!("{:?}", token);
        assert_eq!(debug, "Token([REDACTED])");
        assert!(!debug.contains(token.as_str()));
    }
}
