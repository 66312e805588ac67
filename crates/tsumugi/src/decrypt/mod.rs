pub mod aes;
pub mod external;

pub use self::aes::SegmentDecryptor;
pub use external::{DecryptTool, ExternalDecryptor};

/// Both halves must be 32 hex characters.
pub fn is_valid_kid_key_pair(kid: &str, key: &str) -> bool {
    kid.len() == 32
        && key.len() == 32
        && kid.chars().all(|c| c.is_ascii_hexdigit())
        && key.chars().all(|c| c.is_ascii_hexdigit())
}
