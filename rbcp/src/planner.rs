//! Chunk planning
//!
//! Both peers derive the same chunk boundaries from the manifest alone: [`plan`] is a pure
//! function of the file size and the [`ChunkPolicy`], so boundaries are never negotiated or
//! recomputed mid-transfer.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

/// Largest chunk any policy may produce, bounds per-chunk memory on both peers.
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of chunks per size step of an adaptive policy.
pub const DEFAULT_ADAPTIVE_RAMP: u32 = 4;

/// Most chunks a single transfer may be split into, bounds the plan and ledger on both peers.
pub const MAX_CHUNKS: u64 = 1 << 23;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkPolicy {
    /// Every chunk is `size` bytes except possibly the last one.
    Fixed { size: u64 },
    /// Chunks start at `min` bytes and double every `ramp` chunks until they reach `max`.
    Adaptive { min: u64, max: u64, ramp: u32 },
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        ChunkPolicy::Fixed {
            size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        match *self {
            ChunkPolicy::Fixed { size } => {
                if size == 0 {
                    return Err(anyhow!("chunk size must be greater than zero"));
                }
                if size > MAX_CHUNK_SIZE {
                    return Err(anyhow!(
                        "chunk size {} exceeds the maximum of {}",
                        bytesize::ByteSize(size),
                        bytesize::ByteSize(MAX_CHUNK_SIZE)
                    ));
                }
            }
            ChunkPolicy::Adaptive { min, max, ramp } => {
                if min == 0 {
                    return Err(anyhow!("minimum chunk size must be greater than zero"));
                }
                if min > max {
                    return Err(anyhow!(
                        "minimum chunk size {} is larger than maximum {}",
                        bytesize::ByteSize(min),
                        bytesize::ByteSize(max)
                    ));
                }
                if max > MAX_CHUNK_SIZE {
                    return Err(anyhow!(
                        "maximum chunk size {} exceeds the limit of {}",
                        bytesize::ByteSize(max),
                        bytesize::ByteSize(MAX_CHUNK_SIZE)
                    ));
                }
                if ramp == 0 {
                    return Err(anyhow!("adaptive ramp must be at least 1"));
                }
            }
        }
        Ok(())
    }

    /// Validates the policy and checks that a file of `file_size` bytes stays within
    /// [`MAX_CHUNKS`] chunks.
    pub fn validate_for(&self, file_size: u64) -> anyhow::Result<()> {
        self.validate()?;
        let count = chunk_count(file_size, self);
        if count > MAX_CHUNKS {
            return Err(anyhow!(
                "{} in chunks of {} needs {count} chunks, more than the limit of {MAX_CHUNKS}; \
                 use a larger chunk size",
                bytesize::ByteSize(file_size),
                self
            ));
        }
        Ok(())
    }

    /// Size of the chunk at `index` before clamping to the end of the file.
    pub fn chunk_size(&self, index: u64) -> u64 {
        let size = match *self {
            ChunkPolicy::Fixed { size } => size,
            ChunkPolicy::Adaptive { min, max, ramp } => {
                let step = index / u64::from(ramp.max(1));
                let factor = 1u64.checked_shl(step.min(63) as u32).unwrap_or(u64::MAX);
                min.saturating_mul(factor).min(max)
            }
        };
        size.max(1)
    }

    /// Largest chunk this policy can produce.
    pub fn max_chunk_size(&self) -> u64 {
        match *self {
            ChunkPolicy::Fixed { size } => size,
            ChunkPolicy::Adaptive { max, .. } => max,
        }
    }
}

fn parse_size(text: &str) -> anyhow::Result<u64> {
    let size: bytesize::ByteSize = text
        .trim()
        .parse()
        .map_err(|error| anyhow!("invalid size {text:?}: {error}"))?;
    Ok(size.as_u64())
}

impl std::str::FromStr for ChunkPolicy {
    type Err = anyhow::Error;

    /// Accepts `4MiB`, `fixed:4MiB`, `adaptive:1MiB-64MiB` and `adaptive:1MiB-64MiB:8`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let policy = if let Some(rest) = s.strip_prefix("adaptive:") {
            let (range, ramp) = match rest.split_once(':') {
                Some((range, ramp)) => (
                    range,
                    ramp.trim()
                        .parse::<u32>()
                        .with_context(|| format!("invalid adaptive ramp: {ramp:?}"))?,
                ),
                None => (rest, DEFAULT_ADAPTIVE_RAMP),
            };
            let (min, max) = range
                .split_once('-')
                .ok_or_else(|| anyhow!("adaptive policy needs MIN-MAX, got {range:?}"))?;
            ChunkPolicy::Adaptive {
                min: parse_size(min)?,
                max: parse_size(max)?,
                ramp,
            }
        } else {
            let size = s.strip_prefix("fixed:").unwrap_or(s);
            ChunkPolicy::Fixed {
                size: parse_size(size)?,
            }
        };
        policy.validate()?;
        Ok(policy)
    }
}

// exact size in the largest binary unit that divides it, so the text parses back losslessly
fn format_size(size: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "GiB"), (1 << 20, "MiB"), (1 << 10, "KiB")];
    for (unit, name) in UNITS {
        if size >= unit && size % unit == 0 {
            return format!("{}{name}", size / unit);
        }
    }
    size.to_string()
}

impl std::fmt::Display for ChunkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ChunkPolicy::Fixed { size } => write!(f, "fixed:{}", format_size(size)),
            ChunkPolicy::Adaptive { min, max, ramp } => write!(
                f,
                "adaptive:{}-{}:{ramp}",
                format_size(min),
                format_size(max)
            ),
        }
    }
}

/// Byte range of one chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Number of chunks [`plan`] produces, computed without building the plan.
pub fn chunk_count(file_size: u64, policy: &ChunkPolicy) -> u64 {
    match *policy {
        ChunkPolicy::Fixed { size } => file_size.div_ceil(size.max(1)),
        ChunkPolicy::Adaptive { min, max, ramp } => {
            let ramp = u64::from(ramp.max(1));
            let max = max.max(1);
            let mut size = min.clamp(1, max);
            let mut remaining = file_size;
            let mut count = 0;
            // at most 64 doublings before `size` reaches `max`
            while size < max {
                let step_bytes = size.saturating_mul(ramp);
                if remaining <= step_bytes {
                    return count + remaining.div_ceil(size);
                }
                remaining -= step_bytes;
                count += ramp;
                size = size.saturating_mul(2).min(max);
            }
            count + remaining.div_ceil(size)
        }
    }
}

/// Splits `[0, file_size)` into consecutive chunks; an empty file has no chunks.
pub fn plan(file_size: u64, policy: &ChunkPolicy) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut offset = 0;
    let mut index = 0;
    while offset < file_size {
        let length = policy.chunk_size(index).min(file_size - offset);
        spans.push(ChunkSpan {
            index,
            offset,
            length,
        });
        offset += length;
        index += 1;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KIB: u64 = 1024;

    fn assert_partitions(file_size: u64, policy: &ChunkPolicy) {
        let spans = plan(file_size, policy);
        let mut expected_offset = 0;
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.index, i as u64);
            assert_eq!(span.offset, expected_offset);
            assert!(span.length > 0);
            assert!(span.length <= policy.max_chunk_size());
            expected_offset = span.end();
        }
        assert_eq!(expected_offset, file_size);
    }

    #[test]
    fn fixed_policy_last_chunk_is_shorter() {
        let spans = plan(10 * KIB + 1, &ChunkPolicy::Fixed { size: 4 * KIB });
        let lengths: Vec<u64> = spans.iter().map(|s| s.length).collect();
        assert_eq!(lengths, vec![4 * KIB, 4 * KIB, 2 * KIB + 1]);
    }

    #[test]
    fn empty_file_has_no_chunks() {
        assert!(plan(0, &ChunkPolicy::default()).is_empty());
        assert!(
            plan(
                0,
                &ChunkPolicy::Adaptive {
                    min: 1,
                    max: 8,
                    ramp: 1
                }
            )
            .is_empty()
        );
    }

    #[test]
    fn adaptive_policy_ramps_up_and_caps() {
        let policy = ChunkPolicy::Adaptive {
            min: KIB,
            max: 4 * KIB,
            ramp: 2,
        };
        let sizes: Vec<u64> = (0..8).map(|i| policy.chunk_size(i)).collect();
        assert_eq!(
            sizes,
            vec![KIB, KIB, 2 * KIB, 2 * KIB, 4 * KIB, 4 * KIB, 4 * KIB, 4 * KIB]
        );
        // far into a huge file the shift must not overflow
        assert_eq!(policy.chunk_size(u64::MAX), 4 * KIB);
    }

    #[test]
    fn parse_policies() {
        assert_eq!(
            "4MiB".parse::<ChunkPolicy>().unwrap(),
            ChunkPolicy::Fixed {
                size: 4 * KIB * KIB
            }
        );
        assert_eq!(
            "fixed:512KiB".parse::<ChunkPolicy>().unwrap(),
            ChunkPolicy::Fixed { size: 512 * KIB }
        );
        assert_eq!(
            "adaptive:1MiB-64MiB".parse::<ChunkPolicy>().unwrap(),
            ChunkPolicy::Adaptive {
                min: KIB * KIB,
                max: 64 * KIB * KIB,
                ramp: DEFAULT_ADAPTIVE_RAMP
            }
        );
        assert_eq!(
            "adaptive:1MiB-64MiB:8".parse::<ChunkPolicy>().unwrap(),
            ChunkPolicy::Adaptive {
                min: KIB * KIB,
                max: 64 * KIB * KIB,
                ramp: 8
            }
        );
    }

    #[test]
    fn parse_rejects_invalid_policies() {
        for bad in [
            "0",
            "fixed:0",
            "2GiB",
            "adaptive:64MiB-1MiB",
            "adaptive:1MiB",
            "adaptive:1MiB-2MiB:0",
            "adaptive:0-1MiB",
            "lots",
        ] {
            assert!(bad.parse::<ChunkPolicy>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn display_parses_back() {
        assert_eq!(ChunkPolicy::default().to_string(), "fixed:4MiB");
        for policy in [
            ChunkPolicy::default(),
            ChunkPolicy::Fixed { size: 1000 },
            ChunkPolicy::Fixed { size: 3 * KIB },
            ChunkPolicy::Adaptive {
                min: KIB * KIB,
                max: 64 * KIB * KIB,
                ramp: 3,
            },
        ] {
            assert_eq!(policy.to_string().parse::<ChunkPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn huge_chunk_counts_are_rejected() {
        let tiny = ChunkPolicy::Fixed { size: 1 };
        assert!(tiny.validate_for(MAX_CHUNKS).is_ok());
        assert!(tiny.validate_for(MAX_CHUNKS + 1).is_err());
        assert!(tiny.validate_for(1 << 50).is_err());
        assert_eq!(chunk_count(1 << 50, &tiny), 1 << 50);
        let ramped = ChunkPolicy::Adaptive {
            min: 1,
            max: 2,
            ramp: 1,
        };
        assert!(ramped.validate_for(u64::MAX).is_err());
        // default policy covers 32 TiB
        assert!(ChunkPolicy::default().validate_for(32 << 40).is_ok());
        assert!(ChunkPolicy::default().validate_for((32 << 40) + 1).is_err());
    }

    #[test]
    fn chunk_count_of_adaptive_policy() {
        let policy = ChunkPolicy::Adaptive {
            min: KIB,
            max: 4 * KIB,
            ramp: 2,
        };
        // 1K 1K 2K 2K 4K 4K ...
        assert_eq!(chunk_count(0, &policy), 0);
        assert_eq!(chunk_count(KIB, &policy), 1);
        assert_eq!(chunk_count(2 * KIB + 1, &policy), 3);
        assert_eq!(chunk_count(6 * KIB, &policy), 4);
        assert_eq!(chunk_count(14 * KIB + 1, &policy), 7);
        assert_eq!(chunk_count(u64::MAX, &policy), u64::MAX.div_ceil(4 * KIB) + 3);
    }

    proptest! {
        #[test]
        fn fixed_plans_partition_the_file(file_size in 0u64..(4 * KIB * KIB), size in 64u64..(KIB * KIB)) {
            let policy = ChunkPolicy::Fixed { size };
            assert_partitions(file_size, &policy);
            prop_assert_eq!(chunk_count(file_size, &policy), plan(file_size, &policy).len() as u64);
        }

        #[test]
        fn adaptive_plans_partition_the_file(
            file_size in 0u64..(16 * KIB * KIB),
            min in 256u64..(64 * KIB),
            extra in 0u64..(4 * KIB * KIB),
            ramp in 1u32..16,
        ) {
            let policy = ChunkPolicy::Adaptive { min, max: min + extra, ramp };
            assert_partitions(file_size, &policy);
            prop_assert_eq!(chunk_count(file_size, &policy), plan(file_size, &policy).len() as u64);
        }
    }
}
