//! Resume sidecar: crash-safe record of verified chunks
//!
//! Stored next to the destination as `<destination>.rbcp-resume`:
//!
//! ```text
//! "RBCPSC01" | header len: u32 LE | bincode(SidecarHeader) | crc32(header): u32 LE
//! { index: u64 LE | digest: [u8; 32] | crc32(index, digest): u32 LE } *
//! ```
//!
//! Records are appended and fsynced one at a time. A torn or corrupt record ends the log, only
//! the records before it are trusted. Rewrites go through a temporary file and a rename.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::digest::{DIGEST_LEN, Digest};
use crate::manifest::TransferManifest;

pub const SIDECAR_SUFFIX: &str = ".rbcp-resume";

const MAGIC: &[u8; 8] = b"RBCPSC01";
const RECORD_LEN: usize = 8 + DIGEST_LEN + 4;
// sanity bound for the header length field
const MAX_HEADER_LEN: usize = 64 * 1024;

pub fn sidecar_path(destination: &std::path::Path) -> std::path::PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(SIDECAR_SUFFIX);
    path.into()
}

fn temp_path(path: &std::path::Path) -> std::path::PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    temp.into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarHeader {
    pub manifest: TransferManifest,
}

fn encode_record(index: u64, digest: &Digest) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..8].copy_from_slice(&index.to_le_bytes());
    record[8..8 + DIGEST_LEN].copy_from_slice(digest.as_bytes());
    let crc = crc32fast::hash(&record[..8 + DIGEST_LEN]);
    record[8 + DIGEST_LEN..].copy_from_slice(&crc.to_le_bytes());
    record
}

fn decode_record(record: &[u8]) -> Option<(u64, Digest)> {
    if record.len() != RECORD_LEN {
        return None;
    }
    let (body, crc) = record.split_at(8 + DIGEST_LEN);
    if crc32fast::hash(body).to_le_bytes() != crc {
        return None;
    }
    let index = u64::from_le_bytes(body[..8].try_into().ok()?);
    let digest = Digest(body[8..].try_into().ok()?);
    Some((index, digest))
}

/// Append handle of a sidecar.
#[derive(Debug)]
pub struct Sidecar {
    path: std::path::PathBuf,
    file: std::fs::File,
}

impl Sidecar {
    /// Atomically replaces whatever is at `path` with a sidecar holding `records`.
    pub fn create(
        path: &std::path::Path,
        manifest: &TransferManifest,
        records: &[(u64, Digest)],
    ) -> anyhow::Result<Self> {
        let header = bincode::serialize(&SidecarHeader {
            manifest: manifest.clone(),
        })
        .context("failed to encode sidecar header")?;
        let mut buf = Vec::with_capacity(16 + header.len() + records.len() * RECORD_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&crc32fast::hash(&header).to_le_bytes());
        for (index, digest) in records {
            buf.extend_from_slice(&encode_record(*index, digest));
        }
        let temp = temp_path(path);
        {
            let mut file = std::fs::File::create(&temp)
                .with_context(|| format!("failed to create {temp:?}"))?;
            file.write_all(&buf)
                .with_context(|| format!("failed to write {temp:?}"))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {temp:?}"))?;
        }
        std::fs::rename(&temp, path)
            .with_context(|| format!("failed to move {temp:?} to {path:?}"))?;
        if let Some(parent) = path.parent()
            && let Ok(dir) = std::fs::File::open(parent)
            && let Err(error) = dir.sync_all()
        {
            tracing::debug!("failed to sync directory {parent:?}: {error}");
        }
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {path:?} for appending"))?;
        tracing::debug!("created sidecar {path:?} with {} records", records.len());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Durably records that chunk `index` is verified on disk.
    pub fn append(&mut self, index: u64, digest: &Digest) -> anyhow::Result<()> {
        self.file
            .write_all(&encode_record(index, digest))
            .with_context(|| format!("failed to append to {:?}", self.path))?;
        self.file
            .sync_data()
            .with_context(|| format!("failed to sync {:?}", self.path))?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedSidecar {
    pub manifest: TransferManifest,
    /// Verified chunks in the order recorded, one entry per index (last record wins)
    pub records: Vec<(u64, Digest)>,
    /// Bytes after the last good record that were ignored
    pub discarded_bytes: u64,
}

/// Reads the sidecar at `path`; `Ok(None)` if there is none.
pub fn load(path: &std::path::Path) -> anyhow::Result<Option<LoadedSidecar>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error).with_context(|| format!("failed to open {path:?}")),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("failed to read {path:?}"))?;
    if buf.len() < MAGIC.len() + 4 || &buf[..MAGIC.len()] != MAGIC {
        return Err(anyhow!("{path:?} is not an rbcp resume sidecar"));
    }
    let header_len = u32::from_le_bytes(
        buf[MAGIC.len()..MAGIC.len() + 4]
            .try_into()
            .context("truncated sidecar header")?,
    ) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(anyhow!("sidecar header of {header_len} bytes is too large"));
    }
    let header_start = MAGIC.len() + 4;
    let records_start = header_start + header_len + 4;
    if buf.len() < records_start {
        return Err(anyhow!("truncated sidecar header in {path:?}"));
    }
    let header = &buf[header_start..header_start + header_len];
    let crc = &buf[header_start + header_len..records_start];
    if crc32fast::hash(header).to_le_bytes() != crc {
        return Err(anyhow!("corrupt sidecar header in {path:?}"));
    }
    let header: SidecarHeader =
        bincode::deserialize(header).context("failed to decode sidecar header")?;
    let mut records: Vec<(u64, Digest)> = Vec::new();
    let mut seen = std::collections::HashMap::new();
    let mut good_end = records_start;
    for record in buf[records_start..].chunks(RECORD_LEN) {
        let Some((index, digest)) = decode_record(record) else {
            break;
        };
        match seen.get(&index) {
            Some(&position) => records[position] = (index, digest),
            None => {
                seen.insert(index, records.len());
                records.push((index, digest));
            }
        }
        good_end += RECORD_LEN;
    }
    let discarded_bytes = (buf.len() - good_end) as u64;
    if discarded_bytes > 0 {
        tracing::warn!("ignoring {discarded_bytes} bytes of torn or corrupt records in {path:?}");
    }
    Ok(Some(LoadedSidecar {
        manifest: header.manifest,
        records,
        discarded_bytes,
    }))
}

/// Deletes the sidecar, returns whether one existed.
pub fn remove(path: &std::path::Path) -> anyhow::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error).with_context(|| format!("failed to remove {path:?}")),
    }
}

/// What `rbcp --resume-status` reports about a destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarStatus {
    pub path: std::path::PathBuf,
    pub manifest: TransferManifest,
    pub total_chunks: u64,
    pub verified_chunks: u64,
    pub verified_bytes: u64,
    pub discarded_bytes: u64,
}

impl std::fmt::Display for SidecarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sidecar: {}\n\
            transfer id: {}\n\
            file size: {}\n\
            chunk policy: {}\n\
            checksum: {}\n\
            verified chunks: {}/{}\n\
            verified bytes: {}",
            self.path.display(),
            self.manifest.transfer_id,
            bytesize::ByteSize(self.manifest.file_size),
            self.manifest.chunk_policy,
            self.manifest.checksum,
            self.verified_chunks,
            self.total_chunks,
            bytesize::ByteSize(self.verified_bytes),
        )?;
        if self.discarded_bytes > 0 {
            write!(f, "\ndiscarded bytes: {}", self.discarded_bytes)?;
        }
        Ok(())
    }
}

/// Summarizes the sidecar of `destination` without touching it.
pub fn inspect(destination: &std::path::Path) -> anyhow::Result<Option<SidecarStatus>> {
    let path = sidecar_path(destination);
    let Some(loaded) = load(&path)? else {
        return Ok(None);
    };
    loaded
        .manifest
        .validate()
        .with_context(|| format!("invalid resume state in {path:?}"))?;
    let spans = loaded.manifest.plan();
    let mut verified_chunks = 0;
    let mut verified_bytes = 0;
    for (index, _) in &loaded.records {
        if let Some(span) = spans.get(*index as usize) {
            verified_chunks += 1;
            verified_bytes += span.length;
        }
    }
    Ok(Some(SidecarStatus {
        path,
        total_chunks: spans.len() as u64,
        manifest: loaded.manifest,
        verified_chunks,
        verified_bytes,
        discarded_bytes: loaded.discarded_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ChecksumAlgorithm;
    use crate::planner::ChunkPolicy;

    fn manifest() -> TransferManifest {
        TransferManifest::new(
            std::path::Path::new("/src/file"),
            10_000,
            ChunkPolicy::Fixed { size: 1000 },
            ChecksumAlgorithm::Crc32,
            2,
        )
    }

    fn digest(index: u64) -> Digest {
        Digest::compute(ChecksumAlgorithm::Sha256, &index.to_le_bytes())
    }

    #[test]
    fn records_survive_reopen() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = sidecar_path(&tmp.path().join("dst.bin"));
        assert!(path.to_string_lossy().ends_with("dst.bin.rbcp-resume"));
        let mut sidecar = Sidecar::create(&path, &manifest(), &[])?;
        sidecar.append(3, &digest(3))?;
        sidecar.append(0, &digest(0))?;
        drop(sidecar);
        let loaded = load(&path)?.unwrap();
        assert_eq!(loaded.manifest, manifest());
        assert_eq!(loaded.records, vec![(3, digest(3)), (0, digest(0))]);
        assert_eq!(loaded.discarded_bytes, 0);
        Ok(())
    }

    #[test]
    fn torn_tail_is_truncated_at_last_good_record() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = sidecar_path(&tmp.path().join("dst.bin"));
        let mut sidecar = Sidecar::create(&path, &manifest(), &[(1, digest(1))])?;
        sidecar.append(2, &digest(2))?;
        drop(sidecar);
        // half of a record, as left by a crash mid-append
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&encode_record(5, &digest(5))[..20])?;
        drop(file);
        let loaded = load(&path)?.unwrap();
        assert_eq!(loaded.records, vec![(1, digest(1)), (2, digest(2))]);
        assert_eq!(loaded.discarded_bytes, 20);
        Ok(())
    }

    #[test]
    fn corrupt_record_ends_the_log() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = sidecar_path(&tmp.path().join("dst.bin"));
        Sidecar::create(
            &path,
            &manifest(),
            &[(1, digest(1)), (2, digest(2)), (3, digest(3))],
        )?;
        let mut bytes = std::fs::read(&path)?;
        let second_record = bytes.len() - 2 * RECORD_LEN;
        bytes[second_record + 10] ^= 0xff;
        std::fs::write(&path, &bytes)?;
        let loaded = load(&path)?.unwrap();
        assert_eq!(loaded.records, vec![(1, digest(1))]);
        assert_eq!(loaded.discarded_bytes, 2 * RECORD_LEN as u64);
        Ok(())
    }

    #[test]
    fn corrupt_header_is_an_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = sidecar_path(&tmp.path().join("dst.bin"));
        Sidecar::create(&path, &manifest(), &[])?;
        let mut bytes = std::fs::read(&path)?;
        bytes[14] ^= 0xff;
        std::fs::write(&path, &bytes)?;
        assert!(load(&path).is_err());
        std::fs::write(&path, b"something else entirely")?;
        assert!(load(&path).is_err());
        Ok(())
    }

    #[test]
    fn inspect_and_remove() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let destination = tmp.path().join("dst.bin");
        assert!(inspect(&destination)?.is_none());
        Sidecar::create(
            &sidecar_path(&destination),
            &manifest(),
            &[(0, digest(0)), (9, digest(9))],
        )?;
        let status = inspect(&destination)?.unwrap();
        assert_eq!(status.total_chunks, 10);
        assert_eq!(status.verified_chunks, 2);
        assert_eq!(status.verified_bytes, 2000);
        assert!(status.to_string().contains("verified chunks: 2/10"));
        assert!(remove(&sidecar_path(&destination))?);
        assert!(!remove(&sidecar_path(&destination))?);
        Ok(())
    }
}
