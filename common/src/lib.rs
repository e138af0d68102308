//! Shared runtime plumbing for the rbcp tools
//!
//! Both binaries (`rbcp` and `rbcpd`) funnel their async entry point through [`run`], which:
//!
//! - installs the `tracing` subscriber (stdout, verbosity from `-v`, optional debug log file),
//! - builds the tokio runtime according to [`RuntimeConfig`],
//! - configures the chunk and bandwidth throttles from [`ThrottleConfig`],
//! - optionally shows progress on stderr while the operation runs,
//! - prints the operation summary at the end.
//!
//! Progress counters live in a single process-wide [`progress::Progress`] reachable through
//! [`get_progress`]; counters are thread-local shards so hot paths never contend.

use anyhow::Context;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

pub mod config;
pub mod progress;
pub mod version;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TracingConfig};

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar on a terminal, text updates otherwise
    #[default]
    Auto,
    /// Interactive progress bar, redrawn in place
    ProgressBar,
    /// Periodic text updates, suitable for log files
    TextUpdates,
}

#[derive(Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human-readable delay between updates ("200ms", "10s")
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn resolve(&self) -> anyhow::Result<(ProgressType, std::time::Duration)> {
        use std::io::IsTerminal;
        let progress_type = match self.progress_type {
            ProgressType::Auto => {
                if std::io::stderr().is_terminal() {
                    ProgressType::ProgressBar
                } else {
                    ProgressType::TextUpdates
                }
            }
            other => other,
        };
        let delay = match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("invalid progress delay: {delay:?}"))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        Ok((progress_type, delay))
    }
}

fn default_filter(output: &OutputConfig) -> EnvFilter {
    if output.quiet {
        return EnvFilter::new("off");
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })
}

fn init_tracing(output: &OutputConfig, config: &TracingConfig) -> anyhow::Result<()> {
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(default_filter(output));
    let file_layer = match &config.debug_log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create debug log file {path:?}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(EnvFilter::new("debug")),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    if let Some(path) = &config.debug_log_file {
        tracing::info!("{}: debug logging to {path}", config.trace_identifier);
    }
    Ok(())
}

fn start_throttles(throttle: &ThrottleConfig) {
    let interval = ThrottleConfig::REPLENISH_INTERVAL;
    if throttle.ops_throttle > 0 {
        // ops throttle is expressed per second, scale it to the replenish interval
        let per_interval = (throttle.ops_throttle as f64 * interval.as_secs_f64()).ceil() as usize;
        let per_interval = per_interval.max(1);
        throttle::init_chunk_ops_tokens(per_interval);
        tokio::spawn(throttle::run_chunk_ops_replenish_thread(
            per_interval,
            interval,
        ));
    }
    if throttle.bandwidth_limit > 0 {
        let tokens = throttle::bandwidth_tokens_per_interval(throttle.bandwidth_limit, interval);
        throttle::init_bandwidth_tokens(tokens);
        tokio::spawn(throttle::run_bandwidth_replenish_thread(tokens, interval));
    }
}

async fn show_progress(
    progress_type: ProgressType,
    delay: std::time::Duration,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) {
    let mut printer = progress::ProgressPrinter::new(get_progress());
    let bar = (progress_type == ProgressType::ProgressBar).then(|| {
        let bar = indicatif::ProgressBar::with_draw_target(
            None,
            indicatif::ProgressDrawTarget::stderr(),
        );
        bar.set_style(
            indicatif::ProgressStyle::with_template("{spinner} [{elapsed_precise}]\n{msg}")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
        );
        bar
    });
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(delay) => {}
        }
        let text = printer.print();
        match &bar {
            Some(bar) => {
                bar.set_message(text);
                bar.tick();
            }
            None => eprintln!("{text}"),
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

/// Runs `func` on a freshly configured runtime.
///
/// The outer error covers setup failures (tracing, runtime, invalid throttle settings); the
/// inner result is whatever the operation returned. On success the summary is printed to stdout
/// when requested; failures are printed to stderr unless `quiet` is set.
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> anyhow::Result<Result<Summary, Error>>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output, &tracing)?;
    throttle.validate().map_err(anyhow::Error::msg)?;
    let progress = progress.map(|settings| settings.resolve()).transpose()?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = builder.build().context("failed to build tokio runtime")?;
    let res = rt.block_on(async move {
        start_throttles(&throttle);
        let progress_task = progress.map(|(progress_type, delay)| {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
            let task = tokio::spawn(show_progress(progress_type, delay, stop_rx));
            (stop_tx, task)
        });
        let res = func().await;
        if let Some((stop_tx, task)) = progress_task {
            let _ = stop_tx.send(());
            if let Err(error) = task.await {
                tracing::debug!("progress task failed: {error}");
            }
        }
        res
    });
    match &res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{}: {error:#}", tracing.trace_identifier);
            }
        }
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_delay_defaults() {
        let bar = ProgressSettings {
            progress_type: ProgressType::ProgressBar,
            progress_delay: None,
        };
        assert_eq!(
            bar.resolve().unwrap(),
            (
                ProgressType::ProgressBar,
                std::time::Duration::from_millis(200)
            )
        );
        let text = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("2s".to_string()),
        };
        assert_eq!(
            text.resolve().unwrap(),
            (ProgressType::TextUpdates, std::time::Duration::from_secs(2))
        );
        let bad = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("soon".to_string()),
        };
        assert!(bad.resolve().is_err());
    }

    #[test]
    fn quiet_silences_logs() {
        let quiet = OutputConfig {
            quiet: true,
            verbose: 3,
            print_summary: false,
        };
        assert_eq!(default_filter(&quiet).to_string(), "off");
    }
}
