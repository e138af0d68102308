//! Parallel point-to-point file transfer - `rbcp` (source) and `rbcpd` (destination daemon)
//!
//! `rbcp` moves a single large file faster than a single TCP stream can by splitting it into
//! chunks and sending them over several concurrent connections. Every chunk carries a digest,
//! is verified by the receiver before it is written and is acknowledged individually, so a
//! dropped or stalled connection only costs the chunks it was carrying.
//!
//! # Tools
//!
//! ## rbcpd - Destination Daemon
//!
//! Listens on a single TCP port for control and data connections and writes the files it
//! receives:
//!
//! ```bash
//! # Accept transfers below /data, keep serving after the first one
//! rbcpd --root /data --port-ranges 7000-7099 --keep-running
//! ```
//!
//! Once listening it prints `RBCP_TCP <addr>` on stderr.
//!
//! ## rbcp - Source
//!
//! ```bash
//! # Send to a daemon, 8 streams, adaptive chunk sizes
//! rbcp /src/big.img host:7000:/data/big.img --streams 8 --chunk-policy adaptive:1MiB-64MiB
//!
//! # IPv6 daemon, copy into a directory
//! rbcp /src/big.img [fd00::2]:7000:/data/ --progress
//!
//! # Local copy, still chunked and verified, over loopback
//! rbcp /src/big.img /dst/big.img --summary
//! ```
//!
//! # Resume
//!
//! The receiver records every verified chunk in `<destination>.rbcp-resume`. Rerunning an
//! interrupted transfer with `--resume` reuses the recorded chunks after checking them against
//! the data on disk and against the source. A sidecar that belongs to a different transfer
//! (other file size, chunk policy or checksum) is discarded and the transfer starts over.
//!
//! - `rbcp --resume-status DST` shows what a sidecar holds
//! - `rbcp --discard-resume DST` deletes it
//!
//! # Exit codes
//!
//! - `0`: transfer completed
//! - `2`: the transfer stopped for a reason that may go away (network failure, all streams lost,
//!   cancellation or time limit); rerun with `--resume`
//! - `1`: anything else (integrity or I/O failure, protocol violation, invalid arguments)
//!
//! # Library layout
//!
//! - [`planner`], [`manifest`], [`digest`]: what gets transferred
//! - [`ledger`], [`policy`], [`pool`]: scheduling state and decisions
//! - [`control`], [`sender`], [`receiver`]: the engine proper, independent of TCP
//! - [`sidecar`]: resume state
//! - [`source`], [`destination`], [`path`]: wiring to TCP and the command line

pub mod control;
pub mod destination;
pub mod digest;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod path;
pub mod planner;
pub mod policy;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod sidecar;
pub mod source;

pub use error::{Error, ErrorKind, Summary};
