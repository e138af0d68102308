use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::digest::ChecksumAlgorithm;
use crate::planner::{self, ChunkPolicy, ChunkSpan};

/// Agreed description of a transfer, immutable once both peers accepted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    /// Hex SHA-256 over the canonical source path, file size and chunk policy
    pub transfer_id: String,
    pub file_size: u64,
    pub chunk_policy: ChunkPolicy,
    pub checksum: ChecksumAlgorithm,
    /// Number of data streams the source intends to open
    pub stream_count: u32,
    pub version: common::version::ProtocolVersion,
}

impl TransferManifest {
    pub fn new(
        source: &std::path::Path,
        file_size: u64,
        chunk_policy: ChunkPolicy,
        checksum: ChecksumAlgorithm,
        stream_count: u32,
    ) -> Self {
        Self {
            transfer_id: Self::transfer_id_for(source, file_size, &chunk_policy),
            file_size,
            chunk_policy,
            checksum,
            stream_count,
            version: common::version::ProtocolVersion::current(),
        }
    }

    pub fn transfer_id_for(
        source: &std::path::Path,
        file_size: u64,
        chunk_policy: &ChunkPolicy,
    ) -> String {
        use sha2::Digest as _;
        let mut hasher = sha2::Sha256::new();
        hasher.update(source.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        hasher.update(file_size.to_le_bytes());
        hasher.update(chunk_policy.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn plan(&self) -> Vec<ChunkSpan> {
        planner::plan(self.file_size, &self.chunk_policy)
    }

    pub fn chunk_count(&self) -> u64 {
        planner::chunk_count(self.file_size, &self.chunk_policy)
    }

    /// Checks a manifest received from the peer before anything is planned or written.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.chunk_policy.validate_for(self.file_size)?;
        if self.stream_count == 0 {
            return Err(anyhow!("manifest requests zero data streams"));
        }
        let ours = common::version::ProtocolVersion::current();
        if !ours.is_compatible_with(&self.version) {
            return Err(anyhow!(
                "incompatible protocol version: peer {}, local {}",
                self.version.display(),
                ours.display()
            ));
        }
        if self.transfer_id.len() != 64 || hex::decode(&self.transfer_id).is_err() {
            return Err(anyhow!("malformed transfer id {:?}", self.transfer_id));
        }
        Ok(())
    }

    /// Chunks recorded under `previous` are reusable iff both manifests produce the same
    /// chunk boundaries and digests. The stream count may differ between attempts.
    pub fn is_resumable_from(&self, previous: &TransferManifest) -> bool {
        self.transfer_id == previous.transfer_id
            && self.file_size == previous.file_size
            && self.chunk_policy == previous.chunk_policy
            && self.checksum == previous.checksum
    }
}
