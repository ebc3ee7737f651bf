use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::DestinationError;

/// Where a request is going. Only the host and port take part in pooling;
/// the full URL is kept for logging and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    url: Url,
    host: String,
    port: u16,
}

impl Destination {
    pub fn from_url(url: Url) -> Result<Self, DestinationError> {
        let host = url
            .host_str()
            .ok_or_else(|| DestinationError::MissingHost(url.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DestinationError::MissingPort(url.to_string()))?;

        Ok(Self { url, host, port })
    }

    pub fn parse(input: &str) -> Result<Self, DestinationError> {
        Self::from_url(Url::parse(input)?)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Socks5Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Socks5Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the underlying socket for a connection is reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyDescriptor {
    #[default]
    Direct,
    Socks5 {
        host: String,
        port: u16,
        #[serde(default, skip_serializing)]
        credentials: Option<Socks5Credentials>,
    },
}

impl ProxyDescriptor {
    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        ProxyDescriptor::Socks5 {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyDescriptor::Direct)
    }
}

/// Accepts `direct` or `socks5://[user:password@]host:port`.
impl FromStr for ProxyDescriptor {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("direct") {
            return Ok(ProxyDescriptor::Direct);
        }

        let url = Url::parse(s)?;
        if !matches!(url.scheme(), "socks5" | "socks5h") {
            return Err(DestinationError::UnsupportedProxy(s.to_string()));
        }

        let host = url
            .host_str()
            .ok_or_else(|| DestinationError::MissingHost(s.to_string()))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| DestinationError::MissingPort(s.to_string()))?;
        let credentials = match (url.username(), url.password()) {
            ("", _) => None,
            (username, password) => Some(Socks5Credentials {
                username: username.to_string(),
                password: password.unwrap_or_default().to_string(),
            }),
        };

        Ok(ProxyDescriptor::Socks5 {
            host,
            port,
            credentials,
        })
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyDescriptor::Direct => write!(f, "direct"),
            ProxyDescriptor::Socks5 { host, port, .. } => write!(f, "socks5://{}:{}", host, port),
        }
    }
}

/// Identifies a pool bucket. Requests with different keys never share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    hostname: String,
    port: u16,
    proxy: ProxyDescriptor,
}

impl ConnectionKey {
    pub fn new(destination: &Destination, proxy: &ProxyDescriptor) -> Self {
        Self {
            hostname: destination.host().to_string(),
            port: destination.port(),
            proxy: proxy.clone(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        &self.proxy
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.hostname, self.port, self.proxy)
    }
}
