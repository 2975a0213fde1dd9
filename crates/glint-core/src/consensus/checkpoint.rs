use thiserror::Error;

use crate::types::beacon::Root;

/// Errors that can occur while reading a checkpoint root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("Checkpoint hash format invalid: {reason}")]
    InvalidFormat { reason: String },
}

/// Parse a hex-encoded checkpoint root, with or without a `0x` prefix.
///
/// The checkpoint root is the only value a light client takes on trust, so it
/// is usually pasted from a block explorer or a friend's node into config.
pub fn parse_checkpoint_hash(hex_str: &str) -> Result<Root, CheckpointError> {
    let hex_str = hex_str.trim();
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);

    if hex_str.len() != 64 {
        return Err(CheckpointError::InvalidFormat {
            reason: format!("Expected 64 hex characters, got {}", hex_str.len()),
        });
    }

    let bytes = hex::decode(hex_str).map_err(|e| CheckpointError::InvalidFormat {
        reason: format!("Invalid hex: {}", e),
    })?;

    let mut result = [0u8; 32];
    result.copy_from_slice(&bytes);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checkpoint_with_prefix() {
        let hash = "0x".to_string() + &"ab".repeat(32);
        assert_eq!(parse_checkpoint_hash(&hash).unwrap(), [0xab; 32]);
    }

    #[test]
    fn test_parse_checkpoint_without_prefix() {
        let hash = "cd".repeat(32);
        assert_eq!(parse_checkpoint_hash(&hash).unwrap(), [0xcd; 32]);
    }

    #[test]
    fn test_parse_checkpoint_wrong_length() {
        assert!(matches!(
            parse_checkpoint_hash("0xabcd"),
            Err(CheckpointError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_parse_checkpoint_invalid_hex() {
        let hash = "zz".repeat(32);
        assert!(parse_checkpoint_hash(&hash).is_err());
    }
}
