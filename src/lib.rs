//! # Carrier Mux
//!
//! A SOCKS-like tunneling core that multiplexes many TCP streams and DNS
//! lookups over a small pool of long-lived carrier connections.
//!
//! ## Features
//!
//! - **Stream multiplexing** with per-stream flow control over one carrier
//! - **At-most-once stream creation** under id collisions (odd/even split)
//! - **In-band DNS tunneling** riding the same carrier as the streams
//! - **Client session pool** with authentication and reconnection policy
//! - **Pluggable carrier layer**: any encrypted byte stream fits the seam
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Pool / Server Dispatch                  │
//! │      (session selection, auth, target dialing)      │
//! ├─────────────────────────────────────────────────────┤
//! │                    Mux Layer                         │
//! │    (sessions, streams, flow control, DNS tunnel)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Carrier Layer                       │
//! │     (cipher-wrapped TCP, consumed as byte stream)   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod mux;
pub mod pool;
pub mod server;
pub mod transport;

pub use config::Config;
pub use mux::{Session, Stream};
pub use pool::SessionPool;
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),
}
