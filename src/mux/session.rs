//! Session: one carrier connection, many multiplexed streams
//!
//! The session owns the carrier. A single read loop decodes frames and
//! hands them to the port registered under their stream id; writes from
//! all streams are serialized by the session write lock. Stream-level
//! faults stay local, carrier-level inconsistencies tear the session down.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::dns::{self, DnsMessage, Resolver};
use super::frame::{
    read_frame, Frame, ERR_CONNFAILED, ERR_NONE, ERR_IDEXIST, MAX_FRAME_PAYLOAD,
};
use super::stream::{Status, Stream};
use super::{MuxError, AUTH_TIMEOUT, DIAL_TIMEOUT, DNS_TIMEOUT, MAX_DATA_PAYLOAD, WRITE_TIMEOUT};
use crate::transport::{Carrier, TargetDialer};

/// Which side of the carrier this session sits on. Client sessions assign
/// odd stream ids, server sessions even ones, so the two ends never race
/// for the same id. Id 0 is reserved for auth and management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u16 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Capabilities a session consumes from its environment. Passed explicitly
/// instead of living in process-wide defaults.
#[derive(Clone, Default)]
pub struct SessionContext {
    /// Dialer used to reach targets named by incoming SYNs. Absent on
    /// plain client sessions; incoming SYNs then fail with CONNFAILED.
    pub dialer: Option<Arc<dyn TargetDialer>>,
    /// Resolver answering tunneled DNS queries. Absent queries are dropped.
    pub resolver: Option<Arc<dyn Resolver>>,
}

/// Recipient of demultiplexed frames for one stream id.
#[derive(Clone)]
pub(crate) enum Port {
    Stream(Stream),
    DnsWaiter(mpsc::Sender<Frame>),
}

impl Port {
    fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        match self {
            Port::Stream(stream) => stream.on_frame(frame),
            Port::DnsWaiter(tx) => {
                match tx.try_send(frame) {
                    Ok(()) => Ok(()),
                    // duplicate response, or the waiter lost interest in the
                    // instant before its port was removed
                    Err(mpsc::error::TrySendError::Full(f))
                    | Err(mpsc::error::TrySendError::Closed(f)) => {
                        debug!("dropping surplus dns frame {}", f);
                        Ok(())
                    }
                }
            }
        }
    }

    fn close_frame(self) {
        match self {
            Port::Stream(stream) => stream.close_frame(),
            // dropping the sender wakes the waiter
            Port::DnsWaiter(_) => {}
        }
    }
}

pub(crate) struct PortTable {
    next_id: u16,
    ports: HashMap<u16, Port>,
}

impl PortTable {
    fn new(first_id: u16) -> PortTable {
        PortTable {
            next_id: first_id,
            ports: HashMap::new(),
        }
    }

    fn bump(id: u16) -> u16 {
        let next = id.wrapping_add(2);
        // id 0 stays reserved when the even sequence wraps
        if next == 0 {
            2
        } else {
            next
        }
    }

    /// Claim the next unused id on this side's parity.
    fn next_free_id(&mut self) -> Result<u16, MuxError> {
        let start = self.next_id;
        while self.ports.contains_key(&self.next_id) {
            self.next_id = Self::bump(self.next_id);
            if self.next_id == start {
                return Err(MuxError::RunOutOfStreamId);
            }
        }
        let id = self.next_id;
        self.next_id = Self::bump(id);
        Ok(id)
    }

    /// Register a peer-assigned id; collision means the peer reused it.
    fn insert_at(&mut self, id: u16, port: Port) -> Result<(), MuxError> {
        if self.ports.contains_key(&id) {
            return Err(MuxError::IdExist(id));
        }
        self.ports.insert(id, port);
        Ok(())
    }

    fn get(&self, id: u16) -> Option<Port> {
        self.ports.get(&id).cloned()
    }
}

pub(crate) struct SessionShared {
    reader: Mutex<Option<ReadHalf<Carrier>>>,
    writer: Mutex<Option<WriteHalf<Carrier>>>,
    ports: RwLock<PortTable>,
    closed: AtomicBool,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    dialer: Option<Arc<dyn TargetDialer>>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl SessionShared {
    /// Write one packed frame under the session write lock with a deadline.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::SessionClosed);
        }
        let buf = frame.pack();
        trace!("send {}", frame);

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MuxError::SessionClosed)?;
        timeout(WRITE_TIMEOUT, async {
            writer.write_all(&buf).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| MuxError::Timeout)??;

        self.write_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn remove_port(&self, streamid: u16) {
        let removed = self.ports.write().unwrap().ports.remove(&streamid).is_some();
        if removed {
            debug!("removed port {}", streamid);
        }
    }
}

/// One multiplexed channel over a carrier. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    /// Wrap an established carrier. The session is inert until [`run`]
    /// drives its read loop.
    ///
    /// [`run`]: Session::run
    pub fn new(carrier: Carrier, role: Role, ctx: SessionContext) -> Session {
        let (reader, writer) = tokio::io::split(carrier);
        info!("session created ({:?} side)", role);
        Session {
            shared: Arc::new(SessionShared {
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                ports: RwLock::new(PortTable::new(role.first_stream_id())),
                closed: AtomicBool::new(false),
                read_bytes: AtomicU64::new(0),
                write_bytes: AtomicU64::new(0),
                dialer: ctx.dialer,
                resolver: ctx.resolver,
            }),
        }
    }

    /// Number of live ports (streams plus pending DNS waiters).
    pub fn stream_count(&self) -> usize {
        self.shared.ports.read().unwrap().ports.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Total payload-carrying bytes read from the carrier.
    pub fn read_bytes(&self) -> u64 {
        self.shared.read_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes written to the carrier.
    pub fn write_bytes(&self) -> u64 {
        self.shared.write_bytes.load(Ordering::Relaxed)
    }

    /// Send a keepalive probe. The peer ignores it.
    pub async fn ping(&self) -> Result<(), MuxError> {
        self.shared.send_frame(&Frame::Ping { streamid: 0 }).await
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        self.shared.send_frame(frame).await
    }

    /// Read one frame directly off the carrier. Only valid before the read
    /// loop started; used for the auth handshake.
    pub(crate) async fn recv_frame(&self, deadline: Duration) -> Result<Frame, MuxError> {
        let mut guard = self.shared.reader.lock().await;
        let reader = guard.as_mut().ok_or(MuxError::SessionClosed)?;
        let frame = timeout(deadline, read_frame(reader))
            .await
            .map_err(|_| MuxError::Timeout)??;
        self.shared
            .read_bytes
            .fetch_add(frame.wire_len() as u64, Ordering::Relaxed);
        Ok(frame)
    }

    /// Client half of the auth handshake: SYN with credentials on stream 0,
    /// then the server's verdict.
    pub async fn auth(&self, username: &str, password: &str) -> Result<(), MuxError> {
        self.shared
            .send_frame(&Frame::Syn {
                streamid: 0,
                network: username.to_string(),
                address: password.to_string(),
            })
            .await?;
        match self.recv_frame(AUTH_TIMEOUT).await? {
            Frame::Result {
                errno: ERR_NONE, ..
            } => Ok(()),
            Frame::Result { errno, .. } => Err(MuxError::from_errno(errno, 0)),
            other => Err(MuxError::UnexpectedPkg(other.kind())),
        }
    }

    /// Open a stream to `address` through the peer.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Stream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let stream = {
            let mut table = self.shared.ports.write().unwrap();
            let id = table.next_free_id()?;
            let stream = Stream::new(
                id,
                self.shared.clone(),
                network.to_string(),
                address.to_string(),
            );
            table.ports.insert(id, Port::Stream(stream.clone()));
            stream
        };
        info!("dial {} via {}", address, stream);

        match stream.send_syn_and_wait().await {
            Ok(()) => Ok(stream),
            Err(e) => {
                stream.finalize();
                Err(e)
            }
        }
    }

    /// Resolve `host` through the peer's resolver. Literal IPs never touch
    /// the wire.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, MuxError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let (tx, mut rx) = mpsc::channel(1);
        let streamid = {
            let mut table = self.shared.ports.write().unwrap();
            let id = table.next_free_id()?;
            table.ports.insert(id, Port::DnsWaiter(tx));
            id
        };

        let result = self.lookup_exchange(streamid, host, &mut rx).await;
        self.shared.remove_port(streamid);
        result
    }

    async fn lookup_exchange(
        &self,
        streamid: u16,
        host: &str,
        rx: &mut mpsc::Receiver<Frame>,
    ) -> Result<Vec<IpAddr>, MuxError> {
        let id = dns::new_id();
        debug!("dns query for {} via port {}", host, streamid);
        self.shared
            .send_frame(&Frame::Dns {
                streamid,
                payload: dns::pack_query(id, host).into(),
            })
            .await?;

        let frame = match timeout(DNS_TIMEOUT, rx.recv()).await {
            Err(_) => return Err(MuxError::Timeout),
            Ok(None) => return Err(MuxError::SessionClosed),
            Ok(Some(frame)) => frame,
        };
        let Frame::Dns { payload, .. } = frame else {
            return Err(MuxError::DnsMsgIllegal);
        };
        let msg = DnsMessage::parse(&payload)?;
        if !msg.response || msg.id != id {
            return Err(MuxError::DnsMsgIllegal);
        }
        debug!("dns result for {}: {:?}", host, msg.answers);
        Ok(msg.answers)
    }

    /// Drive the read loop until the carrier dies or a protocol fault
    /// forces the session down. Always leaves the session closed.
    pub async fn run(&self) -> Result<(), MuxError> {
        let mut reader = { self.shared.reader.lock().await.take() }.ok_or(MuxError::SessionClosed)?;

        let result = self.read_loop(&mut reader).await;
        match &result {
            Ok(()) => info!("session: carrier EOF"),
            Err(e) => warn!("session failed: {}", e),
        }
        self.close().await;
        result
    }

    async fn read_loop(&self, reader: &mut ReadHalf<Carrier>) -> Result<(), MuxError> {
        loop {
            let frame = match read_frame(reader).await {
                Ok(frame) => frame,
                Err(MuxError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            };
            trace!("recv {}", frame);
            self.shared
                .read_bytes
                .fetch_add(frame.wire_len() as u64, Ordering::Relaxed);

            match frame {
                Frame::Result { .. }
                | Frame::Data { .. }
                | Frame::Wnd { .. }
                | Frame::Fin { .. }
                | Frame::Rst { .. } => self.dispatch(frame)?,
                Frame::Syn {
                    streamid,
                    network,
                    address,
                } => self.on_syn(streamid, network, address).await?,
                Frame::Dns { streamid, payload } => self.on_dns(streamid, payload).await?,
                Frame::Ping { .. } | Frame::Spam { .. } => {}
            }
        }
    }

    /// Deliver a stream-addressed frame. A frame for an id we do not know
    /// means the peer and we disagree on state: fatal.
    fn dispatch(&self, frame: Frame) -> Result<(), MuxError> {
        let streamid = frame.streamid();
        let port = { self.shared.ports.read().unwrap().get(streamid) };
        match port {
            Some(port) => port.send_frame(frame),
            None => Err(MuxError::StreamNotExist(streamid)),
        }
    }

    async fn on_syn(
        &self,
        streamid: u16,
        network: String,
        address: String,
    ) -> Result<(), MuxError> {
        let stream = Stream::new(streamid, self.shared.clone(), network, address);
        stream.check_and_set_status(Status::Unknown, Status::SynRecv)?;

        let inserted = {
            self.shared
                .ports
                .write()
                .unwrap()
                .insert_at(streamid, Port::Stream(stream.clone()))
        };
        if inserted.is_err() {
            warn!("incoming syn reuses busy stream id {}", streamid);
            self.shared
                .send_frame(&Frame::Result {
                    streamid,
                    errno: ERR_IDEXIST,
                })
                .await?;
            return Ok(());
        }
        debug!("incoming {}", stream);

        // the target may take a while to answer; never block the read loop
        let session = self.clone();
        tokio::spawn(async move { session.connect_target(stream).await });
        Ok(())
    }

    async fn connect_target(&self, stream: Stream) {
        let streamid = stream.streamid();
        let dialed = match &self.shared.dialer {
            Some(dialer) => {
                match timeout(DIAL_TIMEOUT, dialer.dial(stream.network(), stream.address())).await
                {
                    Ok(Ok(socket)) => Some(socket),
                    Ok(Err(e)) => {
                        warn!("target dial {} failed: {}", stream, e);
                        None
                    }
                    Err(_) => {
                        warn!("target dial {} timed out", stream);
                        None
                    }
                }
            }
            None => {
                warn!("{}: no target dialer on this side", stream);
                None
            }
        };

        let Some(socket) = dialed else {
            let _ = self
                .shared
                .send_frame(&Frame::Result {
                    streamid,
                    errno: ERR_CONNFAILED,
                })
                .await;
            stream.finalize();
            return;
        };

        if self
            .shared
            .send_frame(&Frame::Result {
                streamid,
                errno: ERR_NONE,
            })
            .await
            .is_err()
        {
            stream.finalize();
            return;
        }
        if stream
            .check_and_set_status(Status::SynRecv, Status::Est)
            .is_err()
        {
            stream.finalize();
            return;
        }
        info!("connected {}", stream);
        copy_link(socket, stream);
    }

    async fn on_dns(&self, streamid: u16, payload: Bytes) -> Result<(), MuxError> {
        let msg = match DnsMessage::parse(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed dns frame on port {}: {}", streamid, e);
                return Ok(());
            }
        };

        if msg.response {
            return self.dispatch(Frame::Dns { streamid, payload });
        }

        let Some(resolver) = self.shared.resolver.clone() else {
            warn!(
                "dns query for {} but no resolver, dropping",
                msg.question.as_deref().unwrap_or("?")
            );
            return Ok(());
        };
        info!("dns query for {}", msg.question.as_deref().unwrap_or("?"));

        // answered on a task for the same reason syn targets are dialed on
        // one: a slow upstream must not stall the read loop
        let session = self.clone();
        tokio::spawn(async move {
            match resolver.exchange(&payload).await {
                Ok(answer) if answer.len() <= MAX_FRAME_PAYLOAD => {
                    let _ = session
                        .shared
                        .send_frame(&Frame::Dns {
                            streamid,
                            payload: answer.into(),
                        })
                        .await;
                }
                Ok(answer) => warn!("dns answer of {}b exceeds frame limit", answer.len()),
                Err(e) => warn!("dns exchange failed: {}", e),
            }
        });
        Ok(())
    }

    /// Close the carrier and unblock every stream and waiter.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ports: Vec<Port> = {
            let mut table = self.shared.ports.write().unwrap();
            table.ports.drain().map(|(_, port)| port).collect()
        };
        if !ports.is_empty() {
            warn!("closing all {} ports of the session", ports.len());
        }
        for port in ports {
            port.close_frame();
        }

        info!(
            "session closed, {}b read / {}b written",
            self.read_bytes(),
            self.write_bytes()
        );
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Shovel bytes both ways between a dialed socket and a tunneled stream.
/// EOF on one side half-closes the other; hard errors reset the stream.
pub(crate) fn copy_link(socket: TcpStream, stream: Stream) {
    let (mut sock_rd, mut sock_wr) = socket.into_split();

    let outbound = stream.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATA_PAYLOAD];
        loop {
            match sock_rd.read(&mut buf).await {
                Ok(0) => {
                    let _ = outbound.close().await;
                    break;
                }
                Ok(n) => {
                    if outbound.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => {
                    let _ = outbound.reset().await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATA_PAYLOAD];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = sock_wr.shutdown().await;
                    break;
                }
                Ok(n) => {
                    if sock_wr.write_all(&buf[..n]).await.is_err() {
                        let _ = stream.reset().await;
                        break;
                    }
                }
            }
        }
    });
}
