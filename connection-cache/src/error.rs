use std::time::Duration;
use tokio_rustls::rustls::AlertDescription;

use crate::transport::tls::received_alert;

/// The only failure vocabulary a job ever observes.
///
/// All three are terminal for the affected job and never for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum JobError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("protocol failed")]
    ProtocolFailed,
    #[error("transmission failed")]
    TransmissionFailed,
}

/// Failure to open or reopen a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("SOCKS5 tunnel to {target} failed: {source}")]
    Socks5 {
        target: String,
        #[source]
        source: tokio_socks::Error,
    },
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid DNS name: {0}")]
    InvalidServerName(String),
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// The reason reported to a job whose connection could not be opened.
    ///
    /// A server refusing the handshake outright is a protocol mismatch;
    /// everything else counts as not getting a connection.
    pub fn job_error(&self) -> JobError {
        match self {
            TransportError::Tls { source, .. }
                if received_alert(source) == Some(AlertDescription::HandshakeFailure) =>
            {
                JobError::ProtocolFailed
            }
            _ => JobError::ConnectionFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("URL {0} has no host")]
    MissingHost(String),
    #[error("URL {0} has no port and its scheme has no default")]
    MissingPort(String),
    #[error("Unsupported proxy `{0}`, expected `direct` or `socks5://host:port`")]
    UnsupportedProxy(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
