//! File digests attached to upload records.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Algorithm name as it appears in the record's checksum list.
pub const SHA256: &str = "sha256";

/// Computes a hex digest over a byte stream.
pub trait ChecksumProvider: Send + Sync {
    /// Name written as the checksum `type`.
    fn algorithm(&self) -> &str;

    /// Consume `reader` and return its lowercase hex digest.
    fn digest(&self, reader: &mut dyn Read) -> io::Result<String>;
}

/// SHA-256 over the whole file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

impl ChecksumProvider for Sha256Checksum {
    fn algorithm(&self) -> &str {
        SHA256
    }

    fn digest(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = Sha256::new();
        io::copy(reader, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of_abc() {
        let digest = Sha256Checksum.digest(&mut &b"abc"[..]).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_of_empty_input() {
        let digest = Sha256Checksum.digest(&mut io::empty()).unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
