use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::instrument;

use rbcp_tools_rbcp::digest::ChecksumAlgorithm;
use rbcp_tools_rbcp::path;
use rbcp_tools_rbcp::planner::ChunkPolicy;
use rbcp_tools_rbcp::policy::DefaultRetryPolicy;
use rbcp_tools_rbcp::sender::SenderSettings;
use rbcp_tools_rbcp::sidecar;
use rbcp_tools_rbcp::source::{SourceSettings, run_local, run_source};
use rbcp_tools_rbcp::{Error, Summary};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rbcp",
    version,
    about = "Copy one large file over several parallel TCP streams, with per-chunk verification and resume",
    long_about = "`rbcp` splits a file into chunks and sends them over several concurrent TCP connections to an `rbcpd` daemon (or, for a local destination, to an in-process receiver). Every chunk is verified before it is written and acknowledged individually; failed chunks are retried on other streams.

EXAMPLES:
    # Send to a daemon listening on host:7000
    rbcp /src/big.img host:7000:/data/big.img --streams 8 --progress

    # Copy into a directory on an IPv6 host
    rbcp /src/big.img [fd00::2]:7000:/data/ --summary

    # Resume an interrupted transfer
    rbcp /src/big.img host:7000:/data/big.img --resume

    # Local copy
    rbcp /src/big.img /dst/big.img

EXIT CODES:
    0 transfer completed, 2 retryable failure (rerun with --resume), 1 fatal failure"
)]
struct Args {
    // Transfer options
    /// Number of parallel data streams
    #[arg(
        long,
        default_value = "4",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    streams: u32,

    /// How the file is divided into chunks
    ///
    /// "4MiB" or "fixed:4MiB" for equal chunks, "adaptive:MIN-MAX[:RAMP]" for chunks that start
    /// at MIN and double every RAMP chunks (default 4) up to MAX.
    #[arg(
        long,
        default_value = "4MiB",
        value_name = "POLICY",
        help_heading = "Transfer options"
    )]
    chunk_policy: ChunkPolicy,

    /// Checksum used to verify every chunk
    #[arg(
        long,
        default_value = "xxh3",
        value_name = "ALGORITHM",
        help_heading = "Transfer options"
    )]
    checksum: ChecksumAlgorithm,

    /// Reuse chunks verified by a previous, interrupted transfer to the same destination
    #[arg(long, help_heading = "Transfer options")]
    resume: bool,

    // Failure handling
    /// Deadline for sending one chunk and receiving its acknowledgement
    #[arg(
        long,
        default_value = "60s",
        value_name = "DURATION",
        help_heading = "Failure handling"
    )]
    chunk_timeout: humantime::Duration,

    /// Attempts per chunk before the transfer is aborted
    #[arg(
        long,
        default_value = "5",
        value_name = "N",
        help_heading = "Failure handling"
    )]
    max_attempts: u32,

    /// Reconnects per data stream before the stream is retired
    #[arg(
        long,
        default_value = "3",
        value_name = "N",
        help_heading = "Failure handling"
    )]
    max_reconnects: u32,

    /// Cancel the transfer after this long; it can be resumed later
    #[arg(long, value_name = "DURATION", help_heading = "Failure handling")]
    time_limit: Option<humantime::Duration>,

    // Resume state
    /// Show the resume state recorded for a local destination and exit
    #[arg(
        long,
        value_name = "DST",
        help_heading = "Resume state",
        conflicts_with = "discard_resume"
    )]
    resume_status: Option<std::path::PathBuf>,

    /// Delete the resume state recorded for a local destination and exit
    #[arg(long, value_name = "DST", help_heading = "Resume state")]
    discard_resume: Option<std::path::PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for interactive mode (`ProgressBar`) and 10s for non-interactive mode (`TextUpdates`). If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Also write debug logs to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    debug_log_file: Option<String>,

    // Performance & throttling
    /// Throttle the number of chunks sent per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Limit payload bandwidth per second across all streams, e.g. "500MiB" (0 = no limit)
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    bandwidth_limit: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // Connection options
    /// Timeout for connecting and for the hello and manifest exchanges, in seconds
    #[arg(
        long,
        default_value = "15",
        value_name = "N",
        help_heading = "Connection options"
    )]
    conn_timeout_sec: u64,

    /// Kernel socket buffer size for every connection (default: system default)
    #[arg(long, value_name = "SIZE", help_heading = "Connection options")]
    socket_buffer_size: Option<bytesize::ByteSize>,

    /// Restrict the local receiver's port to these ranges (e.g., "8000-8999"), local copies only
    #[arg(long, value_name = "RANGES", help_heading = "Connection options")]
    port_ranges: Option<String>,

    /// Print protocol version information as JSON and exit
    #[arg(long, help_heading = "Connection options")]
    protocol_version: bool,

    /// Source file and destination: a local path or HOST:PORT:/path
    #[arg(required_unless_present_any = ["resume_status", "discard_resume"], num_args = 2, value_names = ["SRC", "DST"])]
    paths: Vec<String>,
}

impl Args {
    fn source_settings(&self) -> anyhow::Result<SourceSettings> {
        if self.streams == 0 {
            return Err(anyhow!("--streams must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("--max-attempts must be at least 1"));
        }
        self.chunk_policy.validate()?;
        let socket_buffer_size = self
            .socket_buffer_size
            .map(|size| usize::try_from(size.as_u64()))
            .transpose()
            .context("--socket-buffer-size is too large")?;
        Ok(SourceSettings {
            sender: SenderSettings {
                stream_count: self.streams,
                chunk_policy: self.chunk_policy,
                checksum: self.checksum,
                chunk_timeout: self.chunk_timeout.into(),
                handshake_timeout: std::time::Duration::from_secs(self.conn_timeout_sec),
                max_reconnects: self.max_reconnects,
                retry: std::sync::Arc::new(DefaultRetryPolicy {
                    max_attempts: self.max_attempts,
                    ..Default::default()
                }),
            },
            tcp: remote::TcpConfig {
                port_ranges: self.port_ranges.clone(),
                conn_timeout_sec: self.conn_timeout_sec,
                socket_buffer_size,
            },
            resume: self.resume,
        })
    }
}

fn spawn_cancel_triggers(
    time_limit: Option<std::time::Duration>,
    cancel: &tokio_util::sync::CancellationToken,
) {
    if let Some(limit) = time_limit {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::warn!(
                "time limit of {} reached, cancelling",
                humantime::format_duration(limit)
            );
            cancel.cancel();
        });
    }
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
}

#[instrument]
async fn async_main(args: Args) -> Result<Summary, Error> {
    let [src, dst] = args.paths.as_slice() else {
        return Err(Error::io(anyhow!("expected a source and a destination")));
    };
    let settings = args.source_settings().map_err(Error::io)?;
    let dst = path::resolve_destination_path(src, dst).map_err(Error::io)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    spawn_cancel_triggers(args.time_limit.map(Into::into), &cancel);
    let src = std::path::Path::new(src);
    let result = match path::parse_path(&dst).map_err(Error::io)? {
        path::PathType::Local(dst) => run_local(src, &dst, &settings, cancel).await,
        path::PathType::Remote(dst) => run_source(src, &dst, &settings, cancel).await,
    };
    if let Err(error) = &result {
        if !error.unfinished.is_empty() {
            tracing::info!("unfinished chunks: {:?}", error.unfinished);
        }
        if let Some(sidecar) = &error.sidecar {
            tracing::warn!("resume state kept in {sidecar:?}, rerun with --resume to continue");
        }
    }
    result
}

fn resume_command(args: &Args) -> anyhow::Result<bool> {
    if let Some(dst) = &args.resume_status {
        match sidecar::inspect(dst)? {
            Some(status) => println!("{status}"),
            None => println!("no resume state for {}", dst.display()),
        }
        return Ok(true);
    }
    if let Some(dst) = &args.discard_resume {
        if sidecar::remove(&sidecar::sidecar_path(dst))? {
            println!("resume state for {} discarded", dst.display());
        } else {
            println!("no resume state for {}", dst.display());
        }
        return Ok(true);
    }
    Ok(false)
}

fn main() -> Result<(), anyhow::Error> {
    // handle --protocol-version before parsing, it needs no paths
    let args: Vec<String> = std::env::args().collect();
    let separator_pos = args.iter().position(|arg| arg == "--");
    let args_to_check = match separator_pos {
        Some(pos) => &args[..pos],
        None => &args[..],
    };
    if args_to_check.iter().any(|arg| arg == "--protocol-version") {
        let version = common::version::ProtocolVersion::current();
        println!("{}", version.to_json()?);
        return Ok(());
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            // usage errors are fatal (1), --help and --version are not errors
            let code = if error.use_stderr() { 1 } else { 0 };
            let _ = error.print();
            std::process::exit(code);
        }
    };
    if resume_command(&args)? {
        return Ok(());
    }
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        ops_throttle: args.ops_throttle,
        bandwidth_limit: args.bandwidth_limit.as_u64(),
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
        trace_identifier: "rbcp".to_string(),
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        tracing,
        func,
    )?;
    if let Err(error) = res {
        std::process::exit(error.exit_code());
    }
    Ok(())
}
