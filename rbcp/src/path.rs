/// Destination served by an `rbcpd` daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePath {
    host: String,
    port: u16,
    path: std::path::PathBuf,
}

impl RemotePath {
    pub fn new(host: String, port: u16, path: std::path::PathBuf) -> anyhow::Result<Self> {
        if !path.is_absolute() {
            return Err(anyhow::anyhow!("Path must be absolute: {}", path.display()));
        }
        Ok(Self { host, port, path })
    }

    /// Host without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// "host:port" suitable for connecting, IPv6 hosts are bracketed.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathType {
    Local(std::path::PathBuf),
    Remote(RemotePath),
}

/// Splits `HOST:PORT:/path` (or `[v6addr]:PORT:/path`) from plain local paths.
pub fn parse_path(path: &str) -> anyhow::Result<PathType> {
    let re = regex::Regex::new(r"^(?P<host>\[[^\]]+\]|[^:\[\]/]+):(?P<port>\d+):(?P<path>.+)$")?;
    let Some(captures) = re.captures(path) else {
        return Ok(PathType::Local(path.into()));
    };
    let host = captures["host"]
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = captures["port"]
        .parse::<u16>()
        .map_err(|error| anyhow::anyhow!("invalid port in {path:?}: {error}"))?;
    let remote_path = std::path::PathBuf::from(&captures["path"]);
    Ok(PathType::Remote(RemotePath::new(host, port, remote_path)?))
}

/// Rejects destinations ending in `.` or `..`, which never name a file.
pub fn validate_destination_path(dst_path_str: &str) -> anyhow::Result<()> {
    let path_part = match dst_path_str.rfind(':') {
        Some(colon_pos) => &dst_path_str[colon_pos + 1..],
        None => dst_path_str,
    };
    if path_part == "."
        || path_part == ".."
        || path_part.ends_with("/.")
        || path_part.ends_with("/..")
    {
        return Err(anyhow::anyhow!(
            "Destination path cannot end with '.' or '..'.\n\
            To copy into a directory, end the destination with '/' instead.\n\
            Example: 'rbcp big.img host:7000:/data/' writes /data/big.img"
        ));
    }
    Ok(())
}

/// Applies trailing slash semantics: "src/big.img -> dst/" becomes "dst/big.img".
pub fn resolve_destination_path(src_path_str: &str, dst_path_str: &str) -> anyhow::Result<String> {
    validate_destination_path(dst_path_str)?;
    if !dst_path_str.ends_with('/') {
        return Ok(dst_path_str.to_string());
    }
    let src_file_name = std::path::Path::new(src_path_str)
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Source path {src_path_str:?} does not have a basename"))?;
    Ok(format!("{dst_path_str}{}", src_file_name.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_local() {
        assert_eq!(
            parse_path("/path/to/file").unwrap(),
            PathType::Local("/path/to/file".into())
        );
        assert_eq!(
            parse_path("relative/file").unwrap(),
            PathType::Local("relative/file".into())
        );
    }

    #[test]
    fn test_parse_path_remote() {
        match parse_path("host:7000:/path/to/file").unwrap() {
            PathType::Remote(remote_path) => {
                assert_eq!(remote_path.host(), "host");
                assert_eq!(remote_path.port(), 7000);
                assert_eq!(remote_path.path(), std::path::Path::new("/path/to/file"));
                assert_eq!(remote_path.addr(), "host:7000");
            }
            other => panic!("Expected remote path, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_path_remote_ipv6() {
        match parse_path("[::1]:7000:/data/big.img").unwrap() {
            PathType::Remote(remote_path) => {
                assert_eq!(remote_path.host(), "::1");
                assert_eq!(remote_path.addr(), "[::1]:7000");
            }
            other => panic!("Expected remote path, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_path_remote_requires_absolute_path() {
        assert!(parse_path("host:7000:relative").is_err());
        assert!(parse_path("host:99999:/path").is_err());
    }

    #[test]
    fn test_host_without_port_is_local() {
        // "host:/path" has no port so it cannot name an rbcpd
        assert_eq!(
            parse_path("host:/path").unwrap(),
            PathType::Local("host:/path".into())
        );
    }

    #[test]
    fn test_resolve_destination_path() {
        assert_eq!(
            resolve_destination_path("/src/big.img", "/dst/").unwrap(),
            "/dst/big.img"
        );
        assert_eq!(
            resolve_destination_path("/src/big.img", "host:7000:/dst/").unwrap(),
            "host:7000:/dst/big.img"
        );
        assert_eq!(
            resolve_destination_path("/src/big.img", "/dst/other.img").unwrap(),
            "/dst/other.img"
        );
        assert!(resolve_destination_path("/src/big.img", "/dst/..").is_err());
        assert!(resolve_destination_path("/src/big.img", ".").is_err());
    }
}
