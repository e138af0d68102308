//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for chunk transfers
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Chunks put on the wire per second (0 = no throttle)
    pub ops_throttle: usize,
    /// Payload bytes put on the wire per second (0 = no limit)
    pub bandwidth_limit: u64,
}

impl ThrottleConfig {
    /// Interval at which throttle token buckets are refilled
    pub const REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.bandwidth_limit > 0 && self.bandwidth_limit < throttle::BANDWIDTH_TOKEN_BYTES {
            return Err(format!(
                "bandwidth limit must be at least {} per second",
                bytesize::ByteSize(throttle::BANDWIDTH_TOKEN_BYTES)
            ));
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Tracing configuration for debugging
#[derive(Debug, Default, Clone)]
pub struct TracingConfig {
    /// Debug log file path, receives logs in addition to stdout
    pub debug_log_file: Option<String>,
    /// Identifier used in the log file name and startup message
    pub trace_identifier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_validation() {
        assert!(ThrottleConfig::default().validate().is_ok());
        let too_small = ThrottleConfig {
            ops_throttle: 0,
            bandwidth_limit: 10,
        };
        assert!(too_small.validate().is_err());
        let fine = ThrottleConfig {
            ops_throttle: 10,
            bandwidth_limit: 1024 * 1024,
        };
        assert!(fine.validate().is_ok());
    }
}
