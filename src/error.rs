use std::io;

/// Error taxonomy for the gateway. Variants are kinds, not sources: the
/// forwarder retries `Resolve`/`Connect` across the parent list, everything
/// else surfaces to the worker top level for a single log line.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Startup-fatal configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Hostname did not resolve; retriable across the parent list.
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// TCP connect failed; retriable across the parent list.
    #[error("cannot connect to {0}: {1}")]
    Connect(String, io::Error),

    /// The parent rejected our Type-3 message.
    #[error("proxy authentication failed (upstream returned {0})")]
    AuthFailed(u16),

    /// Mid-exchange failure on an upstream socket.
    #[error("upstream I/O error: {0}")]
    UpstreamIo(io::Error),

    /// The client went away; workers terminate silently on this.
    #[error("client I/O error: {0}")]
    ClientIo(io::Error),

    /// Malformed HTTP or NTLM from either side.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cooperative shutdown was requested.
    #[error("shutdown requested")]
    Shutdown,
}

impl GateError {
    /// HTTP status relayed to the client when headers have not been sent yet.
    pub fn client_status(&self) -> Option<(u16, &'static str)> {
        match self {
            GateError::Resolve(_) | GateError::Connect(_, _) | GateError::UpstreamIo(_) => {
                Some((502, "Bad Gateway"))
            }
            GateError::AuthFailed(_) => Some((407, "Proxy Authentication Required")),
            GateError::Protocol(_) => Some((400, "Bad Request")),
            _ => None,
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_status_mapping() {
        assert_eq!(
            GateError::Resolve("x".into()).client_status(),
            Some((502, "Bad Gateway"))
        );
        assert_eq!(GateError::AuthFailed(407).client_status().unwrap().0, 407);
        assert_eq!(
            GateError::Protocol("bad".into()).client_status().unwrap().0,
            400
        );
        assert!(GateError::Shutdown.client_status().is_none());
        assert!(GateError::ClientIo(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .client_status()
            .is_none());
    }
}
