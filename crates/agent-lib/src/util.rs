//! Small shared helpers

use crate::error::{AgentError, Result};
use rand::RngCore;

/// Generates a random hex string covering `bytes` bytes of entropy.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Validates and standardises a service name identifier: trimmed,
/// lower-cased, non-empty.
pub fn normalise_name(name: &str) -> Result<String> {
    let cleaned = name.trim().to_ascii_lowercase();
    if cleaned.is_empty() {
        return Err(AgentError::Config("name not specified".into()));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_length_and_charset() {
        let value = random_hex(16);
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_hex_varies() {
        assert_ne!(random_hex(16), random_hex(16));
    }

    #[test]
    fn test_normalise_name() {
        assert_eq!(normalise_name("  CPU ").unwrap(), "cpu");
        assert!(normalise_name("   ").is_err());
    }
}
