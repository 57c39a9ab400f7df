//! Sub-stream framing shared by the gateway and the worker.
//!
//! Each frame has a 7-byte header: type(1) + stream_id(4) + data_len(2) + payload.
//! Frames are self-delimiting, so they can ride any ordered byte stream
//! (a WebSocket adapter, a TLS stream, an in-memory duplex).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Stream identifier type.
pub type StreamId = u32;

/// Maximum payload size per frame (the length field is 16 bits).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Open-ack status: destination reached.
pub const STATUS_OK: u8 = 0x00;
/// Open-ack status: destination could not be reached.
pub const STATUS_UNREACHABLE: u8 = 0x01;
/// Open-ack status: malformed open request.
pub const STATUS_BAD_REQUEST: u8 = 0x02;

/// Multiplexing frame types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Gateway asks the worker for a new sub-stream.
    /// Payload: kind(1) + addr_type(1) + address + port(2)
    StreamOpen = 0x01,
    /// Worker acknowledges a stream open.
    /// Payload: status(1), 0x00 = success
    StreamOpenAck = 0x02,
    /// Data payload (one datagram for UDP sub-streams).
    StreamData = 0x03,
    /// Graceful close of a stream.
    StreamClose = 0x04,
    /// Abrupt reset of a stream.
    StreamReset = 0x05,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::StreamOpen),
            0x02 => Ok(Self::StreamOpenAck),
            0x03 => Ok(Self::StreamData),
            0x04 => Ok(Self::StreamClose),
            0x05 => Ok(Self::StreamReset),
            _ => Err(Error::InvalidMessage(format!("unknown frame type: 0x{:02x}", v))),
        }
    }
}

/// Transport carried by a sub-stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Byte stream to a TCP destination
    Tcp = 0x01,
    /// Datagrams to a UDP destination, one per frame
    Udp = 0x03,
}

impl StreamKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Tcp),
            0x03 => Ok(Self::Udp),
            _ => Err(Error::InvalidMessage(format!("unknown stream kind: 0x{:02x}", v))),
        }
    }
}

/// Destination of a request: socket address or unresolved domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal socket address
    Ip(SocketAddr),
    /// Domain name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part as text.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }

    /// Encode in SOCKS5 address format: addr_type(1) + addr + port(2).
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(v4)) => {
                buf.push(0x01);
                buf.extend_from_slice(&v4.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(v6)) => {
                buf.push(0x04);
                buf.extend_from_slice(&v6.ip().octets());
            }
            TargetAddr::Domain(host, _) => {
                if host.is_empty() || host.len() > 255 {
                    return Err(Error::InvalidMessage(format!(
                        "domain length {} out of range",
                        host.len()
                    )));
                }
                buf.push(0x03);
                buf.push(host.len() as u8);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// Decode from SOCKS5 address format, returning the address and the
    /// number of bytes consumed.
    pub fn decode(payload: &[u8]) -> Result<(Self, usize)> {
        let addr_type = *payload
            .first()
            .ok_or_else(|| Error::InvalidMessage("empty address payload".into()))?;

        match addr_type {
            // IPv4
            0x01 => {
                if payload.len() < 7 {
                    return Err(Error::InvalidMessage("IPv4 address too short".into()));
                }
                let ip = Ipv4Addr::new(payload[1], payload[2], payload[3], payload[4]);
                let port = u16::from_be_bytes([payload[5], payload[6]]);
                Ok((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            // Domain name
            0x03 => {
                if payload.len() < 2 {
                    return Err(Error::InvalidMessage("domain address too short".into()));
                }
                let domain_len = payload[1] as usize;
                if payload.len() < 2 + domain_len + 2 {
                    return Err(Error::InvalidMessage("domain address truncated".into()));
                }
                let domain = std::str::from_utf8(&payload[2..2 + domain_len])
                    .map_err(|_| Error::InvalidMessage("domain is not UTF-8".into()))?
                    .to_string();
                let port = u16::from_be_bytes([payload[2 + domain_len], payload[3 + domain_len]]);
                Ok((TargetAddr::Domain(domain, port), 4 + domain_len))
            }
            // IPv6
            0x04 => {
                if payload.len() < 19 {
                    return Err(Error::InvalidMessage("IPv6 address too short".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[1..17]);
                let port = u16::from_be_bytes([payload[17], payload[18]]);
                Ok((
                    TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            _ => Err(Error::InvalidMessage(format!(
                "unknown address type: 0x{:02x}",
                addr_type
            ))),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// A multiplexing frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Sub-stream this frame belongs to
    pub stream_id: StreamId,
    /// Frame body, at most [`MAX_FRAME_PAYLOAD`] bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let (frame_type, stream_id, data_len) = Self::parse_header(&data[..FRAME_HEADER_SIZE])?;

        if data.len() < FRAME_HEADER_SIZE + data_len {
            return Err(Error::InvalidMessage(format!(
                "frame truncated: header says {} payload bytes, got {}",
                data_len,
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        Ok(Self {
            frame_type,
            stream_id,
            payload: data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + data_len].to_vec(),
        })
    }

    fn parse_header(header: &[u8]) -> Result<(FrameType, StreamId, usize)> {
        let frame_type = FrameType::from_u8(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let data_len = u16::from_be_bytes([header[5], header[6]]) as usize;
        Ok((frame_type, stream_id, data_len))
    }

    /// Read one frame; `Ok(None)` on clean end of stream at a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Network(e)),
        }

        let (frame_type, stream_id, data_len) = Self::parse_header(&header)?;
        let mut payload = vec![0u8; data_len];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Create a StreamOpen frame for `target`.
    pub fn stream_open(stream_id: StreamId, kind: StreamKind, target: &TargetAddr) -> Result<Self> {
        let mut payload = vec![kind as u8];
        target.encode(&mut payload)?;
        Ok(Self {
            frame_type: FrameType::StreamOpen,
            stream_id,
            payload,
        })
    }

    /// Parse the kind and destination out of a StreamOpen payload.
    pub fn open_target(&self) -> Result<(StreamKind, TargetAddr)> {
        let kind = StreamKind::from_u8(
            *self
                .payload
                .first()
                .ok_or_else(|| Error::InvalidMessage("empty open payload".into()))?,
        )?;
        let (target, _) = TargetAddr::decode(&self.payload[1..])?;
        Ok((kind, target))
    }

    /// Create a StreamOpenAck frame.
    pub fn stream_open_ack(stream_id: StreamId, status: u8) -> Self {
        Self {
            frame_type: FrameType::StreamOpenAck,
            stream_id,
            payload: vec![status],
        }
    }

    /// Create a StreamData frame.
    pub fn stream_data(stream_id: StreamId, data: &[u8]) -> Self {
        Self {
            frame_type: FrameType::StreamData,
            stream_id,
            payload: data.to_vec(),
        }
    }

    /// Create a StreamClose frame.
    pub fn stream_close(stream_id: StreamId) -> Self {
        Self {
            frame_type: FrameType::StreamClose,
            stream_id,
            payload: Vec::new(),
        }
    }

    /// Create a StreamReset frame.
    pub fn stream_reset(stream_id: StreamId) -> Self {
        Self {
            frame_type: FrameType::StreamReset,
            stream_id,
            payload: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_open_ack() {
        let frame = Frame::stream_open_ack(1, STATUS_OK);
        let decoded = Frame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::StreamOpenAck);
        assert_eq!(decoded.stream_id, 1);
        assert_eq!(decoded.payload, vec![STATUS_OK]);
    }

    #[test]
    fn test_open_carries_kind_and_target() {
        let target = TargetAddr::Domain("example.com".into(), 443);
        let frame = Frame::stream_open(9, StreamKind::Udp, &target).unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();

        let (kind, parsed) = decoded.open_target().unwrap();
        assert_eq!(kind, StreamKind::Udp);
        assert_eq!(parsed, target);
    }

    #[test]
    fn test_parse_ipv4_addr() {
        let payload = vec![0x01, 93, 184, 216, 34, 0x01, 0xBB]; // 93.184.216.34:443
        let (addr, used) = TargetAddr::decode(&payload).unwrap();
        assert_eq!(addr, TargetAddr::Ip("93.184.216.34:443".parse().unwrap()));
        assert_eq!(used, 7);
    }

    #[test]
    fn test_parse_ipv6_addr() {
        let target = TargetAddr::Ip("[2001:db8::1]:8443".parse().unwrap());
        let mut buf = Vec::new();
        target.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 19);
        assert_eq!(TargetAddr::decode(&buf).unwrap().0, target);
    }

    #[test]
    fn test_truncated_frame() {
        let mut encoded = Frame::stream_data(3, b"payload").encode();
        encoded.truncate(encoded.len() - 2);
        assert!(Frame::decode(&encoded).is_err());
    }

    #[test]
    fn test_oversized_domain() {
        let target = TargetAddr::Domain("a".repeat(256), 80);
        assert!(target.encode(&mut Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_read_frames_from_stream() {
        let mut wire = Frame::stream_data(5, b"abc").encode();
        wire.extend_from_slice(&Frame::stream_close(5).encode());
        let mut reader = &wire[..];

        let first = Frame::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.payload, b"abc");
        let second = Frame::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::StreamClose);
        assert!(Frame::read_from(&mut reader).await.unwrap().is_none());
    }
}
