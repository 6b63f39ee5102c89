//! Sandboxer addresses and the channel dialer.
//!
//! A controller is built from a free-form address string.  [`SandboxAddress`]
//! parses it once; [`Dialer`] turns it into a byte stream.  The default
//! [`NetDialer`] connects Unix sockets and TCP endpoints; tests and embedders
//! can supply their own.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Where a sandboxer listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl SandboxAddress {
    /// Parse `unix:///path`, `unix:/path`, `/path`, `tcp://host:port` or
    /// `host:port`.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("address is empty".into());
        }

        if let Some(rest) = raw.strip_prefix("unix://").or_else(|| raw.strip_prefix("unix:")) {
            return Self::unix(rest);
        }
        if let Some(rest) = raw.strip_prefix("tcp://") {
            return Self::tcp(rest);
        }
        if raw.contains("://") {
            return Err("unsupported scheme".into());
        }
        if raw.starts_with('/') {
            return Self::unix(raw);
        }
        if raw.contains(':') {
            return Self::tcp(raw);
        }
        Err("expected an absolute socket path or host:port".into())
    }

    fn unix(path: &str) -> std::result::Result<Self, String> {
        if !path.starts_with('/') {
            return Err("unix socket path must be absolute".into());
        }
        Ok(Self::Unix(PathBuf::from(path)))
    }

    fn tcp(hostport: &str) -> std::result::Result<Self, String> {
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| "missing port".to_string())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err("missing host".into());
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port {port:?}"))?;
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for SandboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// A bidirectional byte stream to a sandboxer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens the channel to a sandboxer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &SandboxAddress) -> std::io::Result<BoxedStream>;
}

/// Dials Unix sockets and TCP endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, address: &SandboxAddress) -> std::io::Result<BoxedStream> {
        match address {
            SandboxAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            SandboxAddress::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_forms() {
        let expected = SandboxAddress::Unix(PathBuf::from("/run/sandboxer.sock"));
        assert_eq!(SandboxAddress::parse("unix:///run/sandboxer.sock").unwrap(), expected);
        assert_eq!(SandboxAddress::parse("unix:/run/sandboxer.sock").unwrap(), expected);
        assert_eq!(SandboxAddress::parse("/run/sandboxer.sock").unwrap(), expected);
    }

    #[test]
    fn tcp_forms() {
        let expected = SandboxAddress::Tcp {
            host: "10.0.0.1".into(),
            port: 9000,
        };
        assert_eq!(SandboxAddress::parse("10.0.0.1:9000").unwrap(), expected);
        assert_eq!(SandboxAddress::parse("tcp://10.0.0.1:9000").unwrap(), expected);

        let v6 = SandboxAddress::parse("tcp://[::1]:9000").unwrap();
        assert_eq!(v6.to_string(), "tcp://[::1]:9000");
    }

    #[test]
    fn invalid_forms() {
        assert!(SandboxAddress::parse("").is_err());
        assert!(SandboxAddress::parse("ftp://host:1").is_err());
        assert!(SandboxAddress::parse("relative.sock").is_err());
        assert!(SandboxAddress::parse("unix:relative.sock").is_err());
        assert!(SandboxAddress::parse("host:notaport").is_err());
        assert!(SandboxAddress::parse(":9000").is_err());
    }
}
