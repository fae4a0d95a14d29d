//! DNS wire codec and the host resolver contract
//!
//! The tunnel only needs a sliver of DNS: pack an A query, and pull the
//! transaction id, flags and A/AAAA answers out of a response. Queries are
//! forwarded to the upstream resolver as raw wire bytes, so the inner
//! transaction id survives the round trip untouched.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::MuxError;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

/// Fresh random transaction id.
pub fn new_id() -> u16 {
    rand::random()
}

/// Build an A query for `host` with recursion desired.
pub fn pack_query(id: u16, host: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    packet.extend_from_slice(&id.to_be_bytes());
    // flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT 1, AN/NS/AR 0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in host.trim_end_matches('.').split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

/// The parts of a DNS message the tunnel cares about.
#[derive(Debug)]
pub struct DnsMessage {
    pub id: u16,
    pub response: bool,
    pub rcode: u8,
    /// First question name, when present
    pub question: Option<String>,
    /// A/AAAA answers in record order
    pub answers: Vec<IpAddr>,
}

impl DnsMessage {
    /// Parse a wire-format message. Unknown record types are skipped.
    pub fn parse(packet: &[u8]) -> Result<DnsMessage, MuxError> {
        if packet.len() < 12 {
            return Err(MuxError::DnsMsgIllegal);
        }

        let id = u16::from_be_bytes([packet[0], packet[1]]);
        let response = packet[2] & 0x80 != 0;
        let rcode = packet[3] & 0x0F;
        let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
        let ancount = u16::from_be_bytes([packet[6], packet[7]]);

        let mut pos = 12;
        let mut question = None;
        for i in 0..qdcount {
            let (name, next) = read_name(packet, pos)?;
            if i == 0 {
                question = Some(name);
            }
            pos = next + 4; // QTYPE + QCLASS
            if pos > packet.len() {
                return Err(MuxError::DnsMsgIllegal);
            }
        }

        let mut answers = Vec::new();
        for _ in 0..ancount {
            let (_, next) = read_name(packet, pos)?;
            pos = next;
            if pos + 10 > packet.len() {
                return Err(MuxError::DnsMsgIllegal);
            }
            let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
            let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
            pos += 10;
            if pos + rdlength > packet.len() {
                return Err(MuxError::DnsMsgIllegal);
            }

            match (rtype, rdlength) {
                (TYPE_A, 4) => {
                    answers.push(IpAddr::from([
                        packet[pos],
                        packet[pos + 1],
                        packet[pos + 2],
                        packet[pos + 3],
                    ]));
                }
                (TYPE_AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&packet[pos..pos + 16]);
                    answers.push(IpAddr::V6(Ipv6Addr::from(octets)));
                }
                _ => {}
            }
            pos += rdlength;
        }

        Ok(DnsMessage {
            id,
            response,
            rcode,
            question,
            answers,
        })
    }
}

/// Decode a possibly-compressed name starting at `pos`; returns the name
/// (best effort, for logs) and the offset just past it. Compression
/// pointers are skipped, not chased.
fn read_name(packet: &[u8], mut pos: usize) -> Result<(String, usize), MuxError> {
    let mut labels: Vec<String> = Vec::new();
    loop {
        let Some(&b) = packet.get(pos) else {
            return Err(MuxError::DnsMsgIllegal);
        };
        if b == 0 {
            pos += 1;
            break;
        }
        if b >= 0xC0 {
            if pos + 2 > packet.len() {
                return Err(MuxError::DnsMsgIllegal);
            }
            pos += 2;
            break;
        }
        let len = b as usize;
        if pos + 1 + len > packet.len() {
            return Err(MuxError::DnsMsgIllegal);
        }
        labels.push(String::from_utf8_lossy(&packet[pos + 1..pos + 1 + len]).into_owned());
        pos += len + 1;
    }
    Ok((labels.join("."), pos))
}

/// Host resolver consumed by the server side of the tunnel.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Forward a DNS query (wire format) and return the raw response.
    async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>>;
}

/// Plain UDP forwarder to one upstream DNS server.
pub struct UdpResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(server: SocketAddr) -> UdpResolver {
        UdpResolver {
            server,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let bind = if self.server.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(query, self.server).await?;

        let mut buf = vec![0u8; 4096];
        let (n, _) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dns exchange timed out"))??;
        buf.truncate(n);
        Ok(buf)
    }
}
