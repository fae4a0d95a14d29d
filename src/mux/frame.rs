//! Frame encoding/decoding for the mux protocol
//!
//! Frame format:
//! ```text
//! +--------+-----------------+-----------------+
//! |  Kind  |   Length (2B)   |  Stream ID (2B) |
//! +--------+-----------------+-----------------+
//! |                 Payload                    |
//! +--------------------------------------------+
//! ```
//!
//! All multi-byte fields are big-endian. A SYN payload is
//! `network\0address\0`; the auth SYN reuses the same layout as
//! `username\0password\0`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::MuxError;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload of a single frame
pub const MAX_FRAME_PAYLOAD: usize = 65535;

/// RESULT error codes
pub const ERR_NONE: u8 = 0;
pub const ERR_IDEXIST: u8 = 1;
pub const ERR_CONNFAILED: u8 = 2;
pub const ERR_AUTH: u8 = 3;
pub const ERR_TIMEOUT: u8 = 4;

const KIND_SYN: u8 = 0;
const KIND_RESULT: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_WND: u8 = 3;
const KIND_FIN: u8 = 4;
const KIND_RST: u8 = 5;
const KIND_PING: u8 = 6;
const KIND_DNS: u8 = 7;
const KIND_SPAM: u8 = 8;

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Open a stream to `network`/`address` (auth SYN: username/password)
    Syn {
        streamid: u16,
        network: String,
        address: String,
    },
    /// Outcome of a SYN, one-byte error code
    Result { streamid: u16, errno: u8 },
    /// Opaque stream bytes
    Data { streamid: u16, payload: Bytes },
    /// Flow-control credit grant
    Wnd { streamid: u16, window: u32 },
    /// Half-close from the sender
    Fin { streamid: u16 },
    /// Abortive close
    Rst { streamid: u16 },
    /// Keepalive probe, ignored by the receiver
    Ping { streamid: u16 },
    /// DNS wire message, request or response
    Dns { streamid: u16, payload: Bytes },
    /// Padding, ignored by the receiver
    Spam { streamid: u16, payload: Bytes },
}

impl Frame {
    /// Wire kind of this frame
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Syn { .. } => KIND_SYN,
            Frame::Result { .. } => KIND_RESULT,
            Frame::Data { .. } => KIND_DATA,
            Frame::Wnd { .. } => KIND_WND,
            Frame::Fin { .. } => KIND_FIN,
            Frame::Rst { .. } => KIND_RST,
            Frame::Ping { .. } => KIND_PING,
            Frame::Dns { .. } => KIND_DNS,
            Frame::Spam { .. } => KIND_SPAM,
        }
    }

    /// Stream id this frame addresses
    pub fn streamid(&self) -> u16 {
        match self {
            Frame::Syn { streamid, .. }
            | Frame::Result { streamid, .. }
            | Frame::Data { streamid, .. }
            | Frame::Wnd { streamid, .. }
            | Frame::Fin { streamid }
            | Frame::Rst { streamid }
            | Frame::Ping { streamid }
            | Frame::Dns { streamid, .. }
            | Frame::Spam { streamid, .. } => *streamid,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Syn {
                network, address, ..
            } => network.len() + address.len() + 2,
            Frame::Result { .. } => 1,
            Frame::Data { payload, .. } => payload.len(),
            Frame::Wnd { .. } => 4,
            Frame::Fin { .. } | Frame::Rst { .. } | Frame::Ping { .. } => 0,
            Frame::Dns { payload, .. } => payload.len(),
            Frame::Spam { payload, .. } => payload.len(),
        }
    }

    /// Total size on the wire, header included
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Encode the frame to wire bytes.
    pub fn pack(&self) -> BytesMut {
        let len = self.payload_len();
        debug_assert!(len <= MAX_FRAME_PAYLOAD);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
        buf.put_u8(self.kind());
        buf.put_u16(len as u16);
        buf.put_u16(self.streamid());

        match self {
            Frame::Syn {
                network, address, ..
            } => {
                buf.extend_from_slice(network.as_bytes());
                buf.put_u8(0);
                buf.extend_from_slice(address.as_bytes());
                buf.put_u8(0);
            }
            Frame::Result { errno, .. } => buf.put_u8(*errno),
            Frame::Wnd { window, .. } => buf.put_u32(*window),
            Frame::Data { payload, .. }
            | Frame::Dns { payload, .. }
            | Frame::Spam { payload, .. } => buf.extend_from_slice(payload),
            Frame::Fin { .. } | Frame::Rst { .. } | Frame::Ping { .. } => {}
        }

        buf
    }

    fn from_wire(kind: u8, streamid: u16, payload: Bytes) -> Result<Frame, MuxError> {
        match kind {
            KIND_SYN => {
                let (network, address) = parse_syn_payload(&payload)?;
                Ok(Frame::Syn {
                    streamid,
                    network,
                    address,
                })
            }
            KIND_RESULT => {
                if payload.len() != 1 {
                    return Err(MuxError::BadFrame(format!(
                        "result payload length {}",
                        payload.len()
                    )));
                }
                Ok(Frame::Result {
                    streamid,
                    errno: payload[0],
                })
            }
            KIND_DATA => Ok(Frame::Data { streamid, payload }),
            KIND_WND => {
                if payload.len() != 4 {
                    return Err(MuxError::BadFrame(format!(
                        "wnd payload length {}",
                        payload.len()
                    )));
                }
                let window = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::Wnd { streamid, window })
            }
            KIND_FIN => Ok(Frame::Fin { streamid }),
            KIND_RST => Ok(Frame::Rst { streamid }),
            KIND_PING => Ok(Frame::Ping { streamid }),
            KIND_DNS => Ok(Frame::Dns { streamid, payload }),
            KIND_SPAM => Ok(Frame::Spam { streamid, payload }),
            other => Err(MuxError::UnexpectedPkg(other)),
        }
    }
}

/// Split a SYN payload into its two NUL-terminated fields.
fn parse_syn_payload(payload: &[u8]) -> Result<(String, String), MuxError> {
    if payload.last() != Some(&0) {
        return Err(MuxError::BadFrame("syn payload missing trailing NUL".into()));
    }
    let mut fields = payload[..payload.len() - 1].split(|&b| b == 0);
    let first = fields.next().unwrap_or_default();
    let second = fields
        .next()
        .ok_or_else(|| MuxError::BadFrame("syn payload has one field".into()))?;

    let network = std::str::from_utf8(first)
        .map_err(|_| MuxError::BadFrame("syn field not utf-8".into()))?;
    let address = std::str::from_utf8(second)
        .map_err(|_| MuxError::BadFrame("syn field not utf-8".into()))?;
    Ok((network.to_string(), address.to_string()))
}

/// Read exactly one frame from the carrier.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let kind = header[0];
    let length = u16::from_be_bytes([header[1], header[2]]) as usize;
    let streamid = u16::from_be_bytes([header[3], header[4]]);

    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Frame::from_wire(kind, streamid, Bytes::from(payload))
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Syn {
                streamid,
                network,
                address,
            } => write!(f, "syn[{}] {}:{}", streamid, network, address),
            Frame::Result { streamid, errno } => write!(f, "result[{}] errno={}", streamid, errno),
            Frame::Data { streamid, payload } => {
                write!(f, "data[{}] {}b", streamid, payload.len())
            }
            Frame::Wnd { streamid, window } => write!(f, "wnd[{}] +{}", streamid, window),
            Frame::Fin { streamid } => write!(f, "fin[{}]", streamid),
            Frame::Rst { streamid } => write!(f, "rst[{}]", streamid),
            Frame::Ping { streamid } => write!(f, "ping[{}]", streamid),
            Frame::Dns { streamid, payload } => write!(f, "dns[{}] {}b", streamid, payload.len()),
            Frame::Spam { streamid, payload } => {
                write!(f, "spam[{}] {}b", streamid, payload.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) -> Frame {
        let packed = frame.pack();
        let mut cursor = std::io::Cursor::new(packed.to_vec());
        read_frame(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_all_kinds() {
        let frames = vec![
            Frame::Syn {
                streamid: 1,
                network: "tcp".into(),
                address: "example.com:443".into(),
            },
            Frame::Result {
                streamid: 1,
                errno: ERR_CONNFAILED,
            },
            Frame::Data {
                streamid: 7,
                payload: Bytes::from_static(b"hello, mux"),
            },
            Frame::Wnd {
                streamid: 7,
                window: 40 * 1024,
            },
            Frame::Fin { streamid: 7 },
            Frame::Rst { streamid: 9 },
            Frame::Ping { streamid: 0 },
            Frame::Dns {
                streamid: 3,
                payload: Bytes::from_static(&[0x12, 0x34, 0x01, 0x00]),
            },
            Frame::Spam {
                streamid: 0,
                payload: Bytes::from_static(&[0u8; 64]),
            },
        ];

        for frame in frames {
            let decoded = roundtrip(frame.clone()).await;
            assert_eq!(decoded, frame);
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let raw = [0xFFu8, 0, 0, 0, 1];
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        match read_frame(&mut cursor).await {
            Err(MuxError::UnexpectedPkg(0xFF)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_syn_rejected() {
        // no trailing NUL
        let mut buf = BytesMut::new();
        buf.put_u8(0); // SYN
        buf.put_u16(3);
        buf.put_u16(5);
        buf.extend_from_slice(b"tcp");
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(MuxError::BadFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let frame = Frame::Data {
            streamid: 2,
            payload: Bytes::from_static(b"truncated"),
        };
        let packed = frame.pack();
        let mut cursor = std::io::Cursor::new(packed[..packed.len() - 3].to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(MuxError::Io(_))
        ));
    }

    #[test]
    fn test_auth_syn_payload_shape() {
        let frame = Frame::Syn {
            streamid: 0,
            network: "user".into(),
            address: "secret".into(),
        };
        let packed = frame.pack();
        assert_eq!(&packed[HEADER_SIZE..], b"user\0secret\0");
    }
}
