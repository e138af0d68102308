use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::instrument;

use rbcp_tools_rbcp::destination::{DestinationSettings, serve};
use rbcp_tools_rbcp::{Error, Summary};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rbcpd",
    version,
    about = "Destination daemon for `rbcp`: accepts parallel transfers over TCP and writes them to disk",
    long_about = "`rbcpd` listens on a single TCP port for `rbcp` control and data connections. Once listening it prints `RBCP_TCP <addr>` on stderr.

By default it exits after the first transfer, with the same exit code `rbcp` would use. With --keep-running it serves transfers until interrupted."
)]
struct Args {
    // Daemon options
    /// IP address to listen on (default: all interfaces)
    #[arg(long, value_name = "IP", help_heading = "Daemon options")]
    bind_ip: Option<String>,

    /// Restrict the listening port to these ranges (e.g., "8000-8999,10000-10999")
    ///
    /// Defaults to a port chosen by the system
    #[arg(long, value_name = "RANGES", help_heading = "Daemon options")]
    port_ranges: Option<String>,

    /// Only accept destinations below this directory
    #[arg(long, value_name = "DIR", help_heading = "Daemon options")]
    root: Option<std::path::PathBuf>,

    /// Serve transfers until interrupted instead of exiting after the first one
    #[arg(long, help_heading = "Daemon options")]
    keep_running: bool,

    /// Timeout for the hello and manifest exchanges, in seconds
    #[arg(
        long,
        default_value = "15",
        value_name = "N",
        help_heading = "Daemon options"
    )]
    conn_timeout_sec: u64,

    /// Kernel socket buffer size for every connection (default: system default)
    #[arg(long, value_name = "SIZE", help_heading = "Daemon options")]
    socket_buffer_size: Option<bytesize::ByteSize>,

    /// Print protocol version information as JSON and exit
    #[arg(long, help_heading = "Daemon options")]
    protocol_version: bool,

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
    /// Accepts human-readable durations like "200ms", "10s", "5min". If specified, --progress flag is implied.
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
}

impl Args {
    fn tcp_config(&self) -> anyhow::Result<remote::TcpConfig> {
        let socket_buffer_size = self
            .socket_buffer_size
            .map(|size| usize::try_from(size.as_u64()))
            .transpose()
            .context("--socket-buffer-size is too large")?;
        Ok(remote::TcpConfig {
            port_ranges: self.port_ranges.clone(),
            conn_timeout_sec: self.conn_timeout_sec,
            socket_buffer_size,
        })
    }

    fn destination_settings(&self) -> anyhow::Result<DestinationSettings> {
        let root = match &self.root {
            Some(root) => Some(
                std::fs::canonicalize(root)
                    .with_context(|| format!("failed to resolve --root {root:?}"))?,
            ),
            None => None,
        };
        if let Some(root) = &root
            && !root.is_dir()
        {
            return Err(anyhow!("--root {root:?} is not a directory"));
        }
        Ok(DestinationSettings {
            root,
            keep_running: self.keep_running,
        })
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Summary, Error> {
    let tcp = args.tcp_config().map_err(Error::io)?;
    let settings = args.destination_settings().map_err(Error::io)?;
    let listener = remote::create_tcp_listener(&tcp, args.bind_ip.as_deref())
        .await
        .map_err(Error::network)?;
    let addr = remote::get_tcp_listener_addr(&listener).map_err(Error::network)?;
    // callers scrape this line to learn the port
    eprintln!("RBCP_TCP {addr}");
    tracing::info!("listening on {addr}");
    let cancel = tokio_util::sync::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, shutting down");
                cancel.cancel();
            }
        });
    }
    serve(listener, tcp, settings, cancel).await
}

fn main() -> Result<(), anyhow::Error> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--protocol-version") {
        let version = common::version::ProtocolVersion::current();
        println!("{}", version.to_json()?);
        return Ok(());
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let code = if error.use_stderr() { 1 } else { 0 };
            let _ = error.print();
            std::process::exit(code);
        }
    };
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
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
        trace_identifier: "rbcpd".to_string(),
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
        common::ThrottleConfig::default(),
        tracing,
        func,
    )?;
    if let Err(error) = res {
        std::process::exit(error.exit_code());
    }
    Ok(())
}
