//! Server dispatch
//!
//! Accepts carriers, runs the auth handshake, then hands each carrier to a
//! session with an even stream-id space. Tunneled SYNs are dialed with the
//! configured target dialer; tunneled DNS queries go to the configured
//! resolver.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::mux::{
    Frame, MuxError, Resolver, Role, Session, SessionContext, AUTH_TIMEOUT, ERR_AUTH, ERR_NONE,
};
use crate::transport::{Carrier, CarrierWrapper, PlainWrapper, TargetDialer, TcpDialer};

struct ServerShared {
    auth: HashMap<String, String>,
    dialer: Arc<dyn TargetDialer>,
    resolver: Option<Arc<dyn Resolver>>,
    wrapper: Arc<dyn CarrierWrapper>,
}

/// The server side of the tunnel.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// A server checking client credentials against `auth` (username to
    /// password). An empty table accepts any client.
    pub fn new(auth: HashMap<String, String>) -> Server {
        Server {
            shared: Arc::new(ServerShared {
                auth,
                dialer: Arc::new(TcpDialer),
                resolver: None,
                wrapper: Arc::new(PlainWrapper),
            }),
        }
    }

    fn rebuild(&self, apply: impl FnOnce(&mut ServerShared)) -> Server {
        let mut shared = ServerShared {
            auth: self.shared.auth.clone(),
            dialer: self.shared.dialer.clone(),
            resolver: self.shared.resolver.clone(),
            wrapper: self.shared.wrapper.clone(),
        };
        apply(&mut shared);
        Server {
            shared: Arc::new(shared),
        }
    }

    /// Replace the target dialer used for tunneled SYNs.
    pub fn with_dialer(&self, dialer: Arc<dyn TargetDialer>) -> Server {
        self.rebuild(|shared| shared.dialer = dialer)
    }

    /// Install a resolver for tunneled DNS queries.
    pub fn with_resolver(&self, resolver: Arc<dyn Resolver>) -> Server {
        self.rebuild(|shared| shared.resolver = Some(resolver))
    }

    /// Replace the carrier wrapper (the cipher layer seam).
    pub fn with_wrapper(&self, wrapper: Arc<dyn CarrierWrapper>) -> Server {
        self.rebuild(|shared| shared.wrapper = wrapper)
    }

    /// Accept loop: wrap each connection and serve it on its own task.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("serving on {}", listener.local_addr()?);
        loop {
            let (conn, peer) = listener.accept().await?;
            debug!("accepted carrier from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                let carrier = match server.shared.wrapper.wrap(conn).await {
                    Ok(carrier) => carrier,
                    Err(e) => {
                        warn!("wrapping carrier from {} failed: {}", peer, e);
                        return;
                    }
                };
                if let Err(e) = server.handle_carrier(carrier).await {
                    warn!("carrier from {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Handshake one established carrier and run its session to completion.
    pub async fn handle_carrier(&self, carrier: Carrier) -> Result<(), MuxError> {
        let ctx = SessionContext {
            dialer: Some(self.shared.dialer.clone()),
            resolver: self.shared.resolver.clone(),
        };
        let session = Session::new(carrier, Role::Server, ctx);

        self.handshake(&session).await?;
        session.run().await
    }

    /// The first frame must be a SYN carrying `username\0password\0`; the
    /// verdict goes back as a RESULT on stream 0.
    async fn handshake(&self, session: &Session) -> Result<(), MuxError> {
        let frame = session.recv_frame(AUTH_TIMEOUT).await?;
        let (streamid, username, password) = match frame {
            Frame::Syn {
                streamid,
                network,
                address,
            } => (streamid, network, address),
            other => {
                session.close().await;
                return Err(MuxError::UnexpectedPkg(other.kind()));
            }
        };

        let accepted =
            self.shared.auth.is_empty() || self.shared.auth.get(&username).map(String::as_str) == Some(password.as_str());

        if !accepted {
            warn!("auth failed for user {:?}", username);
            let _ = session
                .send_frame(&Frame::Result {
                    streamid,
                    errno: ERR_AUTH,
                })
                .await;
            session.close().await;
            return Err(MuxError::Auth);
        }

        session
            .send_frame(&Frame::Result {
                streamid,
                errno: ERR_NONE,
            })
            .await?;
        info!("session authenticated for user {:?}", username);
        Ok(())
    }
}
