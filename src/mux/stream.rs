//! Per-stream state machine, buffered reads and window accounting

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::frame::{Frame, ERR_CONNFAILED, ERR_NONE};
use super::session::SessionShared;
use super::{MuxError, DIAL_TIMEOUT, MAX_DATA_PAYLOAD, WINDOW_SIZE};

/// Stream lifecycle status. Terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, no SYN exchanged yet
    Unknown,
    /// SYN sent, awaiting RESULT
    SynSent,
    /// SYN received, target dial in progress
    SynRecv,
    /// Established, both directions open
    Est,
    /// We half-closed; reads still drain
    FinSent,
    /// Peer half-closed; writes still allowed
    FinRecv,
    /// Fully closed
    Closed,
}

struct State {
    status: Status,
    recv_buf: VecDeque<Bytes>,
    recv_len: usize,
    /// Bytes consumed by the reader but not yet granted back via WND
    recv_owed: u32,
    send_window: u32,
    syn_reply: Option<oneshot::Sender<u8>>,
}

struct Shared {
    streamid: u16,
    network: String,
    address: String,
    session: Arc<SessionShared>,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

/// One logical bidirectional byte stream inside a session.
///
/// Handles are cheap clones over shared state; the session's port table
/// holds one, the user holds another.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    pub(crate) fn new(
        streamid: u16,
        session: Arc<SessionShared>,
        network: String,
        address: String,
    ) -> Stream {
        Stream {
            shared: Arc::new(Shared {
                streamid,
                network,
                address,
                session,
                state: Mutex::new(State {
                    status: Status::Unknown,
                    recv_buf: VecDeque::new(),
                    recv_len: 0,
                    recv_owed: 0,
                    send_window: WINDOW_SIZE,
                    syn_reply: None,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    pub fn streamid(&self) -> u16 {
        self.shared.streamid
    }

    pub fn network(&self) -> &str {
        &self.shared.network
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().unwrap().status
    }

    /// Bytes buffered and not yet consumed by the reader.
    pub fn recv_buf_len(&self) -> usize {
        self.shared.state.lock().unwrap().recv_len
    }

    /// Atomic status transition; any mismatch is a protocol fault.
    pub(crate) fn check_and_set_status(&self, from: Status, to: Status) -> Result<(), MuxError> {
        let mut st = self.shared.state.lock().unwrap();
        if st.status != from {
            return Err(MuxError::InvalidStatus {
                from: st.status,
                to,
            });
        }
        st.status = to;
        Ok(())
    }

    /// Send the SYN for this stream and wait for the peer's RESULT.
    pub(crate) async fn send_syn_and_wait(&self) -> Result<(), MuxError> {
        let rx = {
            let mut st = self.shared.state.lock().unwrap();
            if st.status != Status::Unknown {
                return Err(MuxError::InvalidStatus {
                    from: st.status,
                    to: Status::SynSent,
                });
            }
            st.status = Status::SynSent;
            let (tx, rx) = oneshot::channel();
            st.syn_reply = Some(tx);
            rx
        };

        self.shared
            .session
            .send_frame(&Frame::Syn {
                streamid: self.shared.streamid,
                network: self.shared.network.clone(),
                address: self.shared.address.clone(),
            })
            .await?;

        match timeout(DIAL_TIMEOUT, rx).await {
            Err(_) => {
                self.finalize();
                Err(MuxError::Timeout)
            }
            Ok(Err(_)) => {
                self.finalize();
                Err(MuxError::SessionClosed)
            }
            Ok(Ok(ERR_NONE)) => Ok(()),
            Ok(Ok(errno)) => {
                self.finalize();
                Err(MuxError::from_errno(errno, self.shared.streamid))
            }
        }
    }

    /// Read at least one byte, or return 0 on EOF. EOF is sticky.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut st = self.shared.state.lock().unwrap();
                if st.recv_len > 0 {
                    let mut copied = 0;
                    while copied < buf.len() {
                        let Some(front) = st.recv_buf.front_mut() else {
                            break;
                        };
                        let n = front.len().min(buf.len() - copied);
                        buf[copied..copied + n].copy_from_slice(&front[..n]);
                        copied += n;
                        if n == front.len() {
                            st.recv_buf.pop_front();
                        } else {
                            front.advance(n);
                        }
                    }
                    st.recv_len -= copied;
                    st.recv_owed += copied as u32;
                    let wnd = if st.recv_owed >= WINDOW_SIZE / 2 {
                        let grant = st.recv_owed;
                        st.recv_owed = 0;
                        Some(grant)
                    } else {
                        None
                    };
                    Some((copied, wnd))
                } else {
                    match st.status {
                        Status::FinRecv | Status::Closed => Some((0, None)),
                        _ => None,
                    }
                }
            };

            match ready {
                Some((0, _)) => return Ok(0),
                Some((copied, wnd)) => {
                    if let Some(grant) = wnd {
                        // release credit to the sender; if the session is
                        // already dead the stream will be swept shortly
                        if let Err(e) = self
                            .shared
                            .session
                            .send_frame(&Frame::Wnd {
                                streamid: self.shared.streamid,
                                window: grant,
                            })
                            .await
                        {
                            debug!("stream {}: wnd send failed: {}", self.shared.streamid, e);
                        }
                    }
                    return Ok(copied);
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Write all of `buf`, split into DATA frames and gated by send credit.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        let mut sent = 0;
        while sent < buf.len() {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let grant = {
                let mut st = self.shared.state.lock().unwrap();
                match st.status {
                    Status::Est | Status::FinRecv => {
                        if st.send_window == 0 {
                            None
                        } else {
                            let n = (buf.len() - sent)
                                .min(MAX_DATA_PAYLOAD)
                                .min(st.send_window as usize);
                            st.send_window -= n as u32;
                            Some(n)
                        }
                    }
                    _ => return Err(MuxError::StreamClosed),
                }
            };

            match grant {
                Some(n) => {
                    self.shared
                        .session
                        .send_frame(&Frame::Data {
                            streamid: self.shared.streamid,
                            payload: Bytes::copy_from_slice(&buf[sent..sent + n]),
                        })
                        .await?;
                    sent += n;
                }
                None => notified.as_mut().await,
            }
        }
        Ok(buf.len())
    }

    /// Graceful half-close: stop writing, keep draining reads.
    pub async fn close(&self) -> Result<(), MuxError> {
        let (send_fin, remove) = {
            let mut st = self.shared.state.lock().unwrap();
            match st.status {
                Status::Est => {
                    st.status = Status::FinSent;
                    (true, false)
                }
                Status::FinRecv => {
                    st.status = Status::Closed;
                    (true, true)
                }
                _ => (false, false),
            }
        };
        if send_fin {
            self.shared.writable.notify_waiters();
            self.shared
                .session
                .send_frame(&Frame::Fin {
                    streamid: self.shared.streamid,
                })
                .await?;
        }
        if remove {
            self.shared.readable.notify_waiters();
            self.shared.session.remove_port(self.shared.streamid);
        }
        Ok(())
    }

    /// Abortive close: both directions die immediately.
    pub async fn reset(&self) -> Result<(), MuxError> {
        let already_closed = {
            let mut st = self.shared.state.lock().unwrap();
            if st.status == Status::Closed {
                true
            } else {
                st.status = Status::Closed;
                if let Some(tx) = st.syn_reply.take() {
                    let _ = tx.send(ERR_CONNFAILED);
                }
                false
            }
        };
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        if !already_closed {
            self.shared.session.remove_port(self.shared.streamid);
            self.shared
                .session
                .send_frame(&Frame::Rst {
                    streamid: self.shared.streamid,
                })
                .await?;
        }
        Ok(())
    }

    /// Tear down local state without sending anything.
    pub(crate) fn finalize(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.status = Status::Closed;
            st.syn_reply = None;
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        self.shared.session.remove_port(self.shared.streamid);
    }

    /// Session shutdown broadcast: unblock everything, port table is
    /// already being swept so no removal here.
    pub(crate) fn close_frame(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.status = Status::Closed;
            st.syn_reply = None;
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// Deliver one demultiplexed frame to this stream. An error here means
    /// peers disagree on stream state and is fatal to the session.
    pub(crate) fn on_frame(&self, frame: Frame) -> Result<(), MuxError> {
        match frame {
            Frame::Result { errno, .. } => self.on_result(errno),
            Frame::Data { payload, .. } => self.on_data(payload),
            Frame::Wnd { window, .. } => self.on_wnd(window),
            Frame::Fin { .. } => self.on_fin(),
            Frame::Rst { .. } => self.on_rst(),
            other => Err(MuxError::BadFrame(format!(
                "frame {} not valid for a stream",
                other
            ))),
        }
    }

    fn on_result(&self, errno: u8) -> Result<(), MuxError> {
        let tx = {
            let mut st = self.shared.state.lock().unwrap();
            if st.status != Status::SynSent {
                return Err(MuxError::InvalidStatus {
                    from: st.status,
                    to: Status::Est,
                });
            }
            st.status = if errno == ERR_NONE {
                Status::Est
            } else {
                Status::Closed
            };
            st.syn_reply.take()
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(errno);
            }
            None => {
                // waiter already gave up; make sure the port does not linger
                if errno != ERR_NONE {
                    self.shared.session.remove_port(self.shared.streamid);
                }
            }
        }
        Ok(())
    }

    fn on_data(&self, payload: Bytes) -> Result<(), MuxError> {
        {
            let mut st = self.shared.state.lock().unwrap();
            match st.status {
                Status::Est | Status::FinSent => {
                    st.recv_len += payload.len();
                    if st.recv_len > WINDOW_SIZE as usize {
                        warn!(
                            "stream {}: peer overran receive window ({} buffered)",
                            self.shared.streamid, st.recv_len
                        );
                    }
                    st.recv_buf.push_back(payload);
                }
                Status::FinRecv | Status::Closed => {
                    trace!(
                        "stream {}: dropping {}b after close",
                        self.shared.streamid,
                        payload.len()
                    );
                    return Ok(());
                }
                other => {
                    return Err(MuxError::InvalidStatus {
                        from: other,
                        to: Status::Est,
                    })
                }
            }
        }
        self.shared.readable.notify_waiters();
        Ok(())
    }

    fn on_wnd(&self, window: u32) -> Result<(), MuxError> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.status == Status::Closed {
                return Ok(());
            }
            st.send_window = st.send_window.saturating_add(window);
        }
        self.shared.writable.notify_waiters();
        Ok(())
    }

    fn on_fin(&self) -> Result<(), MuxError> {
        let remove = {
            let mut st = self.shared.state.lock().unwrap();
            match st.status {
                Status::Est => {
                    st.status = Status::FinRecv;
                    false
                }
                Status::FinSent => {
                    st.status = Status::Closed;
                    true
                }
                other => {
                    return Err(MuxError::InvalidStatus {
                        from: other,
                        to: Status::FinRecv,
                    })
                }
            }
        };
        self.shared.readable.notify_waiters();
        if remove {
            self.shared.writable.notify_waiters();
            self.shared.session.remove_port(self.shared.streamid);
        }
        Ok(())
    }

    fn on_rst(&self) -> Result<(), MuxError> {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.status = Status::Closed;
            if let Some(tx) = st.syn_reply.take() {
                let _ = tx.send(ERR_CONNFAILED);
            }
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        self.shared.session.remove_port(self.shared.streamid);
        Ok(())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream[{}] {}:{}",
            self.shared.streamid, self.shared.network, self.shared.address
        )
    }
}
