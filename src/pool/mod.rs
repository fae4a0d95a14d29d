//! Client session pool
//!
//! Keeps a set of authenticated sessions against the configured upstream
//! endpoints, picks the least-loaded one for each dial, opens replacements
//! when sessions drop, and rate-limits reconnect attempts per endpoint.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::mux::{MuxError, Role, Session, SessionContext, Stream};
use crate::transport::CarrierDialer;

/// Minimum pause between carrier attempts against one endpoint
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session factory configured")]
    NoFactory,

    #[error("reconnect attempts rate limited")]
    Backoff,

    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// Stream dialer interface for external users of the pool.
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> Result<Stream, PoolError>;
}

/// IP lookup interface for external users of the pool.
#[async_trait]
pub trait Lookuper: Send + Sync {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, PoolError>;
}

/// Recipe for one authenticated session: carrier dialer, endpoint and
/// credentials, plus the per-endpoint reconnect clock.
pub struct SessionFactory {
    dialer: Arc<dyn CarrierDialer>,
    address: String,
    username: String,
    password: String,
    last_attempt: Mutex<Option<Instant>>,
}

impl SessionFactory {
    pub fn new(
        dialer: Arc<dyn CarrierDialer>,
        address: String,
        username: String,
        password: String,
    ) -> SessionFactory {
        SessionFactory {
            dialer,
            address,
            username,
            password,
            last_attempt: Mutex::new(None),
        }
    }

    /// Dial the carrier and run the auth handshake.
    async fn create_session(&self) -> Result<Session, PoolError> {
        {
            let mut last = self.last_attempt.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < RECONNECT_BACKOFF {
                    return Err(PoolError::Backoff);
                }
            }
            *last = Some(Instant::now());
        }

        info!("connecting carrier to {}", self.address);
        let carrier = self.dialer.dial(&self.address).await.map_err(MuxError::Io)?;
        let session = Session::new(carrier, Role::Client, SessionContext::default());

        match session.auth(&self.username, &self.password).await {
            Ok(()) => {
                info!("session to {} authenticated", self.address);
                Ok(session)
            }
            Err(e) => {
                warn!("auth with {} failed: {}", self.address, e);
                session.close().await;
                Err(e.into())
            }
        }
    }
}

struct PoolShared {
    factories: Mutex<Vec<Arc<SessionFactory>>>,
    sessions: Mutex<Vec<Session>>,
    min_sess: usize,
    max_conn: usize,
    rr: AtomicUsize,
    replenishing: AtomicBool,
}

/// The client-side collection of live sessions plus reconnection policy.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    /// `min_sess`: sessions kept open proactively. `max_conn`: streams per
    /// session before the pool prefers opening another one.
    pub fn new(min_sess: usize, max_conn: usize) -> SessionPool {
        SessionPool {
            shared: Arc::new(PoolShared {
                factories: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                min_sess,
                max_conn,
                rr: AtomicUsize::new(0),
                replenishing: AtomicBool::new(false),
            }),
        }
    }

    /// Register one upstream endpoint.
    pub fn add_session_factory(
        &self,
        dialer: Arc<dyn CarrierDialer>,
        address: &str,
        username: &str,
        password: &str,
    ) {
        self.shared.factories.lock().unwrap().push(Arc::new(SessionFactory::new(
            dialer,
            address.to_string(),
            username.to_string(),
            password.to_string(),
        )));
    }

    /// Live authenticated sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    /// Open a stream through some live session.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Stream, PoolError> {
        let session = self.get_session().await?;
        Ok(session.dial(network, address).await?)
    }

    /// Resolve through some live session. Literal IPs short-circuit.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, PoolError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let session = self.get_session().await?;
        Ok(session.lookup_ip(host).await?)
    }

    /// Pick the least-loaded session, opening new ones when the pool is
    /// thin or every session is above `max_conn`.
    async fn get_session(&self) -> Result<Session, PoolError> {
        let best = {
            let sessions = self.shared.sessions.lock().unwrap();
            sessions.iter().min_by_key(|s| s.stream_count()).cloned()
        };

        let session = match best {
            Some(session) if session.stream_count() < self.shared.max_conn => session,
            Some(session) => match self.open_session().await {
                Ok(fresh) => fresh,
                Err(e) => {
                    debug!("no extra session ({}), reusing loaded one", e);
                    session
                }
            },
            None => self.open_session().await?,
        };

        // top up to min_sess once this dial is satisfied
        let live = self.shared.sessions.lock().unwrap().len();
        if live < self.shared.min_sess && !self.shared.replenishing.swap(true, Ordering::SeqCst) {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.ensure_min().await;
                pool.shared.replenishing.store(false, Ordering::SeqCst);
            });
        }

        Ok(session)
    }

    /// Try each factory once, round-robin, until a session comes up.
    async fn open_session(&self) -> Result<Session, PoolError> {
        let factories = { self.shared.factories.lock().unwrap().clone() };
        if factories.is_empty() {
            return Err(PoolError::NoFactory);
        }

        let n = factories.len();
        let mut last_err = PoolError::Backoff;
        for _ in 0..n {
            let idx = self.shared.rr.fetch_add(1, Ordering::Relaxed) % n;
            match factories[idx].create_session().await {
                Ok(session) => {
                    self.install(session.clone());
                    return Ok(session);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Add a session to the live list and evict it when its read loop ends.
    fn install(&self, session: Session) {
        self.shared.sessions.lock().unwrap().push(session.clone());
        let pool = self.clone();
        tokio::spawn(async move {
            let _ = session.run().await;
            pool.remove_session(&session);
        });
    }

    fn remove_session(&self, session: &Session) {
        let mut sessions = self.shared.sessions.lock().unwrap();
        sessions.retain(|s| !Arc::ptr_eq(&s.shared, &session.shared));
        info!("session evicted, {} live", sessions.len());
    }

    async fn ensure_min(&self) {
        loop {
            let live = self.shared.sessions.lock().unwrap().len();
            if live >= self.shared.min_sess {
                return;
            }
            match self.open_session().await {
                Ok(_) => {}
                Err(PoolError::Backoff) => sleep(RECONNECT_BACKOFF).await,
                Err(e) => {
                    debug!("session replenish halted: {}", e);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl StreamDialer for SessionPool {
    async fn dial(&self, network: &str, address: &str) -> Result<Stream, PoolError> {
        SessionPool::dial(self, network, address).await
    }
}

#[async_trait]
impl Lookuper for SessionPool {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, PoolError> {
        SessionPool::lookup_ip(self, host).await
    }
}
