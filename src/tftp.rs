use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Payload carried by one DATA packet; a shorter payload ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// Opcode plus block number, shared by DATA and ACK.
pub const HEADER_SIZE: usize = 4;

/// Largest legal TFTP datagram: header plus one full block.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + BLOCK_SIZE;

/// The well-known port requests are sent to.
pub const DEFAULT_PORT: u16 = 69;

// Oversized so a datagram above MAX_PACKET_SIZE arrives whole and the parser
// can reject it instead of the kernel truncating it to a valid-looking one.
const RECV_BUFFER_SIZE: usize = 2 * MAX_PACKET_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    /// The lowercase name used on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP Error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    pub fn to_wire(self) -> u16 {
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

    /// Codes outside the RFC range decode as Undefined rather than failing
    /// the whole packet.
    pub fn from_wire(raw: u16) -> ErrorCode {
        match raw {
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
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::Illegal => "illegal TFTP operation",
            ErrorCode::UnknownTid => "unknown transfer ID",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
        };
        f.write_str(name)
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet.
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet.
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet.
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet.
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer
/// and concatenates until it finds a 0 byte, which terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of
/// the 0 byte (or the size of the buffer, if no 0 byte was encountered).
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, &c) in buf.iter().enumerate() {
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

#[derive(Debug, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!(
            "Unknown opcode retrieved: {rawcode}"
        ))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse(
            "Request filename must be terminated with a null byte".to_string(),
        ));
    }
    if path.is_empty() {
        return Err(SocketError::PacketParse(
            "Request does not contain a filename".to_string(),
        ));
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse(
            "Mode must be terminated with a null byte".to_string(),
        ));
    }
    if raw_mode.is_empty() {
        return Err(SocketError::PacketParse(
            "Request does not contain a mode".to_string(),
        ));
    }
    // No options extension: the mode terminator must be the last byte.
    if mode_end + 1 != rest.len() {
        return Err(SocketError::PacketParse(
            "Trailing bytes after the mode terminator".to_string(),
        ));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => {
            return Err(SocketError::PacketParse(format!(
                "Unknown file mode: '{raw_mode}'"
            )))
        }
    };

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < HEADER_SIZE {
        return Err(SocketError::PacketParse(
            "Data packet shorter than its header".to_string(),
        ));
    }
    if buf.len() > MAX_PACKET_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data payload exceeds {BLOCK_SIZE} bytes"
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data {
        block,
        data: Vec::from(&buf[4..]),
    })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != HEADER_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Ack packet must be exactly {HEADER_SIZE} bytes, got {}",
            buf.len()
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < HEADER_SIZE + 1 {
        return Err(SocketError::PacketParse(
            "Error packet too short".to_string(),
        ));
    }
    let code = ErrorCode::from_wire(u16_from_buffer(&buf[2..4]));

    let (message, message_end) = string_from_buffer(&buf[4..]);
    if message_end == buf.len() - 4 {
        log::debug!("Error packet message is missing its null terminator");
    }
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Encodes the packet into the RFC 1350 wire format, big-endian
    /// integers and zero-terminated strings.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(1, path, *mode),
            Packet::WriteReq { path, mode } => encode_request(2, path, *mode),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
                buf.extend_from_slice(&3u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(HEADER_SIZE);
                buf.extend_from_slice(&4u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(HEADER_SIZE + message.len() + 1);
                buf.extend_from_slice(&5u16.to_be_bytes());
                buf.extend_from_slice(&code.to_wire().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
                buf
            }
        }
    }
}

fn encode_request(opcode: u16, path: &str, mode: FileMode) -> Vec<u8> {
    let mode_name = mode.wire_name();
    let mut buf = Vec::with_capacity(2 + path.len() + 1 + mode_name.len() + 1);
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode_name.as_bytes());
    buf.push(0x00);
    buf
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that moves raw TFTP datagrams. Receiving
/// hands back the bytes and their source address untouched; decoding is the
/// caller's job, because whether a datagram is even worth decoding depends
/// on who sent it.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Encodes and transmits a packet, handing the encoded bytes back so the
    /// caller can keep them for a verbatim retransmission.
    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<Vec<u8>> {
        let bytes = packet.to_bytes();
        self.send_raw(&bytes, dst).await?;
        Ok(bytes)
    }

    pub async fn send_raw(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }

    /// Receives one datagram with no deadline. Only the listening socket
    /// waits like this; transfer sockets always use a deadline.
    pub async fn recv(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (len, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..len].to_vec(), src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (len, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..len].to_vec(), src))
    }
}
