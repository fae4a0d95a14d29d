//! Carrier layer abstraction
//!
//! The mux core never touches sockets directly. A carrier is whatever the
//! cipher layer hands back after wrapping a plaintext transport; the core
//! consumes it as an ordinary full-duplex byte stream. The plaintext TCP
//! implementations here are used for tests and for deployments that layer
//! encryption elsewhere.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

/// Timeout for establishing a carrier connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A full-duplex byte stream suitable to carry one session.
pub trait CarrierStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> CarrierStream for T {}

/// An established carrier, type-erased.
pub type Carrier = Box<dyn CarrierStream>;

/// Client-side carrier factory.
///
/// The cipher layer implements this by dialing the plaintext transport and
/// wrapping it; [`TcpCarrierDialer`] is the identity (plaintext) variant.
#[async_trait]
pub trait CarrierDialer: Send + Sync {
    /// Dial `addr` and return the wrapped connection.
    async fn dial(&self, addr: &str) -> io::Result<Carrier>;
}

/// Server-side carrier factory: wraps one accepted plaintext connection.
#[async_trait]
pub trait CarrierWrapper: Send + Sync {
    async fn wrap(&self, conn: TcpStream) -> io::Result<Carrier>;
}

/// Plaintext TCP carrier dialer.
pub struct TcpCarrierDialer;

#[async_trait]
impl CarrierDialer for TcpCarrierDialer {
    async fn dial(&self, addr: &str) -> io::Result<Carrier> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "carrier connect timed out"))??;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Identity wrapper: the accepted connection is the carrier.
pub struct PlainWrapper;

#[async_trait]
impl CarrierWrapper for PlainWrapper {
    async fn wrap(&self, conn: TcpStream) -> io::Result<Carrier> {
        conn.set_nodelay(true).ok();
        Ok(Box::new(conn))
    }
}

/// Native dialer used to reach the targets requested by tunneled SYNs.
#[async_trait]
pub trait TargetDialer: Send + Sync {
    /// Open a TCP connection to `address` on the given network
    /// (`tcp`, `tcp4` or `tcp6`).
    async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream>;
}

/// Default target dialer honoring the `tcp`/`tcp4`/`tcp6` networks.
pub struct TcpDialer;

#[async_trait]
impl TargetDialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(address).await? {
            let keep = match network {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            };
            if !keep {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", network, address),
            )
        }))
    }
}
