use serde::{Deserialize, Serialize};

/// Width of every chunk digest on the wire and in the resume sidecar.
pub const DIGEST_LEN: usize = 32;

/// Checksum algorithm used for chunk digests, agreed in the manifest.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum ChecksumAlgorithm {
    /// CRC-32 (IEEE), cheapest, catches transmission errors only
    Crc32,
    /// 128-bit xxh3, fast non-cryptographic hash
    #[default]
    Xxh3,
    /// SHA-256, slowest, cryptographically strong
    Sha256,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Xxh3 => "xxh3",
            ChecksumAlgorithm::Sha256 => "sha256",
        };
        write!(f, "{name}")
    }
}

/// Fixed-width chunk digest. Algorithms producing fewer than 32 bytes are zero-padded.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut out = [0u8; DIGEST_LEN];
        match algorithm {
            ChecksumAlgorithm::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(data);
                out[..4].copy_from_slice(&hasher.finalize().to_le_bytes());
            }
            ChecksumAlgorithm::Xxh3 => {
                let hash = xxhash_rust::xxh3::xxh3_128(data);
                out[..16].copy_from_slice(&hash.to_le_bytes());
            }
            ChecksumAlgorithm::Sha256 => {
                use sha2::Digest as _;
                out.copy_from_slice(&sha2::Sha256::digest(data));
            }
        }
        Digest(out)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_digests_are_zero_padded() {
        let crc = Digest::compute(ChecksumAlgorithm::Crc32, b"hello");
        assert!(crc.0[4..].iter().all(|b| *b == 0));
        let xxh = Digest::compute(ChecksumAlgorithm::Xxh3, b"hello");
        assert!(xxh.0[16..].iter().all(|b| *b == 0));
        assert_ne!(xxh.0[..16], [0u8; 16]);
    }

    #[test]
    fn algorithms_disagree_and_detect_flips() {
        let data = vec![7u8; 4096];
        let mut flipped = data.clone();
        flipped[100] ^= 1;
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Xxh3,
            ChecksumAlgorithm::Sha256,
        ] {
            assert_eq!(
                Digest::compute(algorithm, &data),
                Digest::compute(algorithm, &data)
            );
            assert_ne!(
                Digest::compute(algorithm, &data),
                Digest::compute(algorithm, &flipped)
            );
        }
        assert_ne!(
            Digest::compute(ChecksumAlgorithm::Crc32, &data),
            Digest::compute(ChecksumAlgorithm::Sha256, &data)
        );
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            Digest::compute(ChecksumAlgorithm::Sha256, b"").to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
