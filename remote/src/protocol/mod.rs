use serde::{Deserialize, Serialize};

/// Length of the random session token binding data connections to a control connection.
pub const SESSION_TOKEN_LEN: usize = 20;

/// First frame on every connection opened by the source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Hello {
    /// Opens a transfer: the connection becomes its control channel
    Control {
        session: String,
        /// Where the receiver should write the file
        destination: std::path::PathBuf,
        /// Reuse chunks recorded in the destination's resume sidecar
        resume: bool,
        version: common::version::ProtocolVersion,
    },
    /// Adds a data stream to the transfer identified by `session`
    Data { session: String, stream_id: u32 },
}

impl Hello {
    pub fn session(&self) -> &str {
        match self {
            Hello::Control { session, .. } | Hello::Data { session, .. } => session,
        }
    }
}

/// Answer to a [`Hello`], sent back on the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum HelloReply {
    Accepted,
    Rejected(String),
}

/// The server refused a [`Hello`]; the reason comes from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRejected(pub String);

impl std::fmt::Display for HelloRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection rejected: {}", self.0)
    }
}

impl std::error::Error for HelloRejected {}

/// Random alphanumeric token used as the session identifier.
pub fn generate_session_token() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(SESSION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tokens_are_random_alphanumeric() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), SESSION_TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn hello_session_accessor() {
        let data = Hello::Data {
            session: "abc".to_string(),
            stream_id: 3,
        };
        assert_eq!(data.session(), "abc");
        let control = Hello::Control {
            session: "xyz".to_string(),
            destination: "/tmp/out".into(),
            resume: true,
            version: common::version::ProtocolVersion::current(),
        };
        assert_eq!(control.session(), "xyz");
    }
}
