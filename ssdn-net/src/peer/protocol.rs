//! Peer link wire protocol.
//!
//! After the transport is up both sides send the same hello line, then
//! exchange peer info (advertised URL plus local subnet), then switch to
//! length-prefixed frames:
//!
//! ```text
//! +--------+--------+------------------+
//! |C| len (15 bits) | payload          |
//! +--------+--------+------------------+
//! ```
//!
//! `C` set marks a control frame. Data frames carry an IPv4 packet without
//! its Ethernet header.

use std::io;

use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter, ReadHalf, WriteHalf,
};

use crate::packet::MAX_PACKET_SIZE;
use crate::route::Ipv4Route;
use crate::transport::BoxedStream;

/// Hello line for routed (layer 3) links.
pub const L3_HELLO: &str = "SFL3 1.0";

/// Hello line for bridged (layer 2) links.
pub const L2_HELLO: &str = "SFL2 1.0";

const DELIM: u8 = b'\n';

/// Upper bound on an advertised peer URL.
const MAX_URL_LEN: u64 = 1024;

const CONTROL_FLAG: u8 = 0x80;

/// Keepalive control frame: control header of length 1 and a zero byte.
pub const PING_FRAME: [u8; 3] = [CONTROL_FLAG, 0x01, 0x00];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected handshake response: {0:?}")]
    HandshakeMismatch(String),

    #[error("invalid peer URL")]
    InvalidUrl,

    #[error("incoming message is too large: {0}")]
    FrameTooLarge(usize),

    #[error("inbound packet rejected")]
    Rejected,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub type LinkReader = BufReader<ReadHalf<BoxedStream>>;
pub type LinkWriter = BufWriter<WriteHalf<BoxedStream>>;

/// Split a link stream into buffered halves.
pub fn split_link(stream: BoxedStream) -> (LinkReader, LinkWriter) {
    let (r, w) = tokio::io::split(stream);
    (BufReader::new(r), BufWriter::new(w))
}

/// Exchange hello lines and split the stream into buffered halves.
pub async fn handshake(stream: BoxedStream, hello: &str) -> Result<(LinkReader, LinkWriter)> {
    let (mut reader, mut writer) = split_link(stream);

    writer.write_all(hello.as_bytes()).await?;
    writer.write_u8(DELIM).await?;
    writer.flush().await?;

    let mut line = Vec::with_capacity(hello.len() + 1);
    (&mut reader)
        .take(hello.len() as u64 + 1)
        .read_until(DELIM, &mut line)
        .await?;
    if line.last() != Some(&DELIM) || &line[..line.len() - 1] != hello.as_bytes() {
        return Err(ProtocolError::HandshakeMismatch(
            String::from_utf8_lossy(&line).into_owned(),
        ));
    }

    Ok((reader, writer))
}

/// Send the local advertised URL and subnet, then flush.
pub async fn write_peer_info<W>(writer: &mut W, url: &str, subnet: &Ipv4Route) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(url.as_bytes()).await?;
    writer.write_u8(DELIM).await?;
    subnet.write_to(writer).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the remote's advertised URL and subnet.
pub async fn read_peer_info<R>(reader: &mut R) -> Result<(String, Ipv4Route)>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    reader.take(MAX_URL_LEN + 1).read_until(DELIM, &mut raw).await?;
    match raw.pop() {
        Some(DELIM) => {}
        Some(_) => return Err(ProtocolError::InvalidUrl),
        None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
    let url = String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUrl)?;
    let subnet = Ipv4Route::read_from(reader).await?;
    Ok((url, subnet))
}

/// Encode a frame header for a payload of `len` bytes.
pub fn frame_header(len: usize, control: bool) -> [u8; 2] {
    let len = len.min(MAX_PACKET_SIZE);
    let mut high = (len >> 8) as u8 & 0x7F;
    if control {
        high |= CONTROL_FLAG;
    }
    [high, len as u8]
}

/// Decode a frame header into (control, payload length).
pub fn parse_frame_header(header: [u8; 2]) -> (bool, usize) {
    let control = header[0] & CONTROL_FLAG != 0;
    let len = ((header[0] & 0x7F) as usize) << 8 | header[1] as usize;
    (control, len)
}
