use anyhow::{Context, anyhow};

/// Environment override for how long [`PortRanges::bind_tcp_listener`] keeps trying ports.
pub const BIND_MAX_DURATION_ENV: &str = "RBCP_TCP_BIND_MAX_DURATION_SECONDS";

const DEFAULT_BIND_MAX_DURATION: std::time::Duration = std::time::Duration::from_secs(5);

/// Set of TCP ports the daemon may listen on, e.g. "8000-8999,10000-10999,12345".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges {
    ranges: Vec<std::ops::RangeInclusive<u16>>,
}

fn parse_port(text: &str) -> anyhow::Result<u16> {
    let port: u16 = text
        .trim()
        .parse()
        .with_context(|| format!("invalid port: {text:?}"))?;
    if port == 0 {
        return Err(anyhow!("port 0 is not allowed in port ranges"));
    }
    Ok(port)
}

impl PortRanges {
    pub fn parse(ranges_str: &str) -> anyhow::Result<Self> {
        let mut ranges = Vec::new();
        for item in ranges_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let range = match item.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse_port(start)?, parse_port(end)?);
                    if start > end {
                        return Err(anyhow!("invalid port range {item:?}: start > end"));
                    }
                    start..=end
                }
                None => {
                    let port = parse_port(item)?;
                    port..=port
                }
            };
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err(anyhow!("no port ranges found in {ranges_str:?}"));
        }
        Ok(PortRanges { ranges })
    }

    /// All ports covered by the ranges, in random order so concurrent daemons spread out.
    fn candidate_ports(&self) -> Vec<u16> {
        use rand::seq::SliceRandom;
        let mut ports: Vec<u16> = self.ranges.iter().flat_map(|r| r.clone()).collect();
        ports.sort_unstable();
        ports.dedup();
        ports.shuffle(&mut rand::thread_rng());
        ports
    }

    fn bind_max_duration() -> std::time::Duration {
        match std::env::var(BIND_MAX_DURATION_ENV)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(secs) => {
                tracing::debug!("TCP bind timeout overridden by {BIND_MAX_DURATION_ENV}: {secs}s");
                std::time::Duration::from_secs(secs)
            }
            None => DEFAULT_BIND_MAX_DURATION,
        }
    }

    /// Binds a listener on the first free port, giving up after the bind deadline.
    pub async fn bind_tcp_listener(
        &self,
        ip: std::net::IpAddr,
    ) -> anyhow::Result<tokio::net::TcpListener> {
        let deadline = tokio::time::Instant::now() + Self::bind_max_duration();
        let mut attempts = 0usize;
        let mut last_error = None;
        for port in self.candidate_ports() {
            if tokio::time::Instant::now() > deadline {
                tracing::warn!("giving up on port ranges after {attempts} bind attempts");
                break;
            }
            attempts += 1;
            match tokio::net::TcpListener::bind((ip, port)).await {
                Ok(listener) => {
                    tracing::info!("bound TCP listener to {ip}:{port} after {attempts} attempts");
                    return Ok(listener);
                }
                Err(error) => {
                    tracing::debug!("failed to bind {ip}:{port}: {error}");
                    let in_use = error.kind() == std::io::ErrorKind::AddrInUse;
                    last_error = Some(error);
                    // back off a little when many ports are taken
                    if in_use && attempts % 10 == 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "failed to bind TCP to any port in {:?} after {} attempts: {}",
            self.ranges,
            attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no ports available".to_string())
        ))
    }
}
