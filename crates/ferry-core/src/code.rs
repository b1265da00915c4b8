//! Transfer code generation and parsing
//!
//! Codes are six symbols drawn uniformly from `[A-Z0-9]`. The same code
//! space is shared by signaling rooms and offline transfers.

use tracing::debug;

use crate::CODE_LENGTH;

/// Characters used in transfer codes
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Largest multiple of the alphabet size that fits in a byte. Bytes at or
/// above it are discarded so every symbol is equally likely.
const REJECTION_BOUND: u8 = (256 / CODE_ALPHABET.len() * CODE_ALPHABET.len()) as u8;

/// Give up after this many consecutive collisions with live codes
const MAX_COLLISIONS: usize = 64;

/// Errors from code generation
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("system entropy source unavailable: {0}")]
    Entropy(getrandom::Error),

    #[error("no free code after {0} attempts")]
    Exhausted(usize),
}

/// Generate a random code (e.g., "AB12C3")
pub fn generate_code() -> Result<String, CodeError> {
    let mut code = String::with_capacity(CODE_LENGTH);
    let mut buf = [0u8; 16];

    while code.len() < CODE_LENGTH {
        getrandom::fill(&mut buf).map_err(CodeError::Entropy)?;
        for b in buf {
            if b < REJECTION_BOUND {
                code.push(CODE_ALPHABET[(b as usize) % CODE_ALPHABET.len()] as char);
                if code.len() == CODE_LENGTH {
                    break;
                }
            }
        }
    }

    Ok(code)
}

/// Generate a code that `is_taken` reports as free.
///
/// Only live entries count as taken; a code that belonged to an expired
/// room or transfer may be handed out again.
pub fn generate_unique_code<F>(mut is_taken: F) -> Result<String, CodeError>
where
    F: FnMut(&str) -> bool,
{
    for attempt in 0..MAX_COLLISIONS {
        let code = generate_code()?;
        if !is_taken(&code) {
            return Ok(code);
        }
        debug!("Code collision on attempt {}: {}", attempt + 1, code);
    }
    Err(CodeError::Exhausted(MAX_COLLISIONS))
}

/// Normalize a code (remove dashes and whitespace, uppercase)
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Validate a code format
pub fn validate_code(code: &str) -> bool {
    let normalized = normalize_code(code);
    normalized.len() == CODE_LENGTH && normalized.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_code_generation() {
        for _ in 0..1000 {
            let code = generate_code().unwrap();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
            assert!(validate_code(&code));
        }
    }

    #[test]
    fn test_codes_cover_alphabet() {
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            seen.extend(generate_code().unwrap().bytes());
        }
        assert_eq!(seen.len(), CODE_ALPHABET.len());
    }

    #[test]
    fn test_code_normalization() {
        assert_eq!(normalize_code("ab12c3"), "AB12C3");
        assert_eq!(normalize_code("AB1 2C3"), "AB12C3");
        assert_eq!(normalize_code("  ab-12-c3  "), "AB12C3");
    }

    #[test]
    fn test_code_validation() {
        assert!(validate_code("AB12C3"));
        assert!(validate_code("000000"));
        assert!(validate_code("zzz999"));

        // Invalid: wrong length
        assert!(!validate_code("AB12C"));
        assert!(!validate_code("AB12C34"));

        // Invalid: outside the alphabet
        assert!(!validate_code("AB12C!"));
        assert!(!validate_code("AB_2C3"));
    }

    #[test]
    fn test_unique_code_skips_taken() {
        let mut calls = 0;
        let code = generate_unique_code(|_| {
            calls += 1;
            calls < 3
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert!(validate_code(&code));
    }

    #[test]
    fn test_unique_code_gives_up() {
        let result = generate_unique_code(|_| true);
        assert!(matches!(result, Err(CodeError::Exhausted(n)) if n == MAX_COLLISIONS));
    }
}
