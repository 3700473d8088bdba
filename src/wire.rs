use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Maximum file content carried by a single DATA packet.
pub const BLOCK_SIZE: usize = 512;

/// 2-byte opcode + 2-byte block number + full payload.
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// A failure to interpret a received buffer as a packet.
///
/// Decoding only ever looks at the bytes the transport actually delivered;
/// embedded fields are never trusted over the received length.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes than the minimum for the (claimed) opcode.
    TooShort(usize),
    /// The opcode field is not one of the five known values.
    UnknownOpcode(u16),
    /// A request is missing the NUL terminator for filename or mode.
    MalformedRequest(&'static str),
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::TooShort(n) => write!(f, "packet too short: {n} bytes"),
            DecodeError::UnknownOpcode(op) => write!(f, "unknown opcode: {op}"),
            DecodeError::MalformedRequest(what) => write!(f, "malformed request: {what}"),
        }
    }
}

/// Represents an error returned from the datagram channel.
///
/// Decode failures keep the sender's address: a receiver bound to one peer
/// must be able to tell a stranger's garbage from the peer's.
#[derive(Debug)]
pub enum ChannelError {
    Io(io::Error),
    Decode(DecodeError, SocketAddr),
    Timeout(Elapsed),
}

impl error::Error for ChannelError {}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelError::Io(e) => write!(f, "channel IO error: {e}"),
            ChannelError::Decode(e, src) => write!(f, "packet decode error from {src}: {e}"),
            ChannelError::Timeout(e) => write!(f, "channel receive timeout: {e}"),
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl From<Elapsed> for ChannelError {
    fn from(e: Elapsed) -> Self {
        ChannelError::Timeout(e)
    }
}

/// Error codes surfaced by an ERROR packet. Values 1 and 6 are the ones this
/// server emits itself; the rest are decoded for completeness.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a wire packet and its associated data.
///
/// The codec is shape-only: the mode string of a request is carried verbatim
/// and validated by the dispatcher, not here.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the peer wants to download.
        filename: String,
        /// The transfer mode, as sent on the wire.
        mode: String,
    },

    /// A write request packet
    WriteReq { filename: String, mode: String },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,
        /// Up to `BLOCK_SIZE` bytes of file content.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads bytes up to (but not including) the first NUL, or to the end of the
/// buffer if there is none. Returns the string and the index of the NUL.
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&b| b == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

/// Parses the `filename\0mode\0` body of a request packet. Both NUL
/// terminators must fall inside the received buffer.
fn parse_request_body(buf: &[u8]) -> Result<(String, String), DecodeError> {
    let (filename, name_end) = string_from_buffer(buf);
    if name_end == buf.len() {
        return Err(DecodeError::MalformedRequest("filename is not NUL-terminated"));
    }

    let rest = &buf[name_end + 1..];
    let (mode, mode_end) = string_from_buffer(rest);
    if mode_end == rest.len() {
        return Err(DecodeError::MalformedRequest("mode is not NUL-terminated"));
    }

    Ok((filename, mode))
}

impl Packet {
    /// Decodes the `len` bytes actually received from the transport.
    pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort(buf.len()));
        }

        match u16_from_buffer(&buf[..2]) {
            1 => {
                let (filename, mode) = parse_request_body(&buf[2..])?;
                Ok(Packet::ReadReq { filename, mode })
            }
            2 => {
                let (filename, mode) = parse_request_body(&buf[2..])?;
                Ok(Packet::WriteReq { filename, mode })
            }
            3 => {
                if buf.len() < 4 {
                    return Err(DecodeError::TooShort(buf.len()));
                }
                Ok(Packet::Data {
                    block: u16_from_buffer(&buf[2..4]),
                    data: Vec::from(&buf[4..]),
                })
            }
            4 => {
                if buf.len() < 4 {
                    return Err(DecodeError::TooShort(buf.len()));
                }
                Ok(Packet::Ack {
                    block: u16_from_buffer(&buf[2..4]),
                })
            }
            5 => {
                if buf.len() < 4 {
                    return Err(DecodeError::TooShort(buf.len()));
                }
                let (message, _) = string_from_buffer(&buf[4..]);
                Ok(Packet::Error {
                    code: ErrorCode::from_u16(u16_from_buffer(&buf[2..4])),
                    message,
                })
            }
            op => Err(DecodeError::UnknownOpcode(op)),
        }
    }

    /// Serializes the packet. Always succeeds for in-memory values; the
    /// result never exceeds `MAX_PACKET_SIZE` for DATA/ACK packets.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { filename, mode } => encode_request(1, filename, mode),
            Packet::WriteReq { filename, mode } => encode_request(2, filename, mode),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&3u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&4u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&5u16.to_be_bytes());
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
                buf
            }
        }
    }
}

fn encode_request(opcode: u16, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0x00);
    buf
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that encodes and decodes packets and
/// returns them in a structured format.
pub struct UdpChannel {
    sock: Async<UdpSocket>,
}

impl UdpChannel {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpChannel> {
        Ok(UdpChannel {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> Result<(), ChannelError> {
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }

    /// Blocks until a datagram arrives. Used by the dispatcher, which must
    /// wait indefinitely for the next request.
    pub async fn recv(&self) -> Result<(Packet, SocketAddr), ChannelError> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_read, src) = self.sock.recv_from(&mut buf).await?;
        let packet =
            Packet::decode(&buf[..total_read]).map_err(|e| ChannelError::Decode(e, src))?;
        Ok((packet, src))
    }

    pub async fn recv_with_timeout(
        &self,
        ttl: Duration,
    ) -> Result<(Packet, SocketAddr), ChannelError> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_read, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        let packet =
            Packet::decode(&buf[..total_read]).map_err(|e| ChannelError::Decode(e, src))?;
        Ok((packet, src))
    }
}
