//! Message framing
//!
//! Every message travels as a 24 byte header followed by its payload:
//!
//! ```text
//! magic (u32 LE) | command (12 bytes, NUL padded) | length (u32 LE) | checksum (4) | payload
//! ```
//!
//! [`PacketCodec`] plugs the format into `tokio_util::codec` so a socket can
//! be driven with `FramedRead`/`FramedWrite`. [`Parser`] and [`Framer`] are
//! thin byte-level wrappers around the same logic.

use crate::crypto::checksum;
use crate::wire::encoding::WireError;
use crate::wire::packets::Packet;
use crate::wire::types::MAX_MESSAGE;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 24;

/// Longest command that fits in a header
const COMMAND_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameHeader {
    command: String,
    size: usize,
    checksum: [u8; 4],
}

fn parse_header(magic: u32, data: &[u8]) -> Result<FrameHeader, WireError> {
    let mut raw = data;
    let got = raw.get_u32_le();
    if got != magic {
        return Err(WireError::InvalidMagic(got));
    }

    let command = &raw[..COMMAND_LEN];
    let end = command
        .iter()
        .position(|b| *b == 0)
        .ok_or(WireError::BadCommand)?;
    let command = std::str::from_utf8(&command[..end])
        .map_err(|_| WireError::BadCommand)?
        .to_string();
    raw.advance(COMMAND_LEN);

    let size = raw.get_u32_le() as usize;
    if size > MAX_MESSAGE {
        return Err(WireError::PacketTooLarge(size));
    }

    let mut sum = [0u8; 4];
    sum.copy_from_slice(&raw[..4]);

    Ok(FrameHeader {
        command,
        size,
        checksum: sum,
    })
}

fn write_frame<B: BufMut>(buf: &mut B, magic: u32, command: &str, payload: &[u8]) {
    let mut cmd = [0u8; COMMAND_LEN];
    let len = command.len().min(COMMAND_LEN);
    cmd[..len].copy_from_slice(&command.as_bytes()[..len]);

    buf.put_u32_le(magic);
    buf.put_slice(&cmd);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&checksum(payload));
    buf.put_slice(payload);
}

// =============================================================================
// Codec
// =============================================================================

/// Frame codec bound to a network magic
///
/// Decoding yields `Ok(Err(..))` for protocol violations so the caller can
/// penalize the peer and keep reading; only I/O failures end the stream.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    magic: u32,
    header: Option<FrameHeader>,
}

impl PacketCodec {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            header: None,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Result<Packet, WireError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let raw = src.split_to(HEADER_LEN);
                match parse_header(self.magic, &raw) {
                    Ok(header) => header,
                    Err(err) => return Ok(Some(Err(err))),
                }
            }
        };

        if src.len() < header.size {
            src.reserve(header.size - src.len());
            self.header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.size);

        if checksum(&payload) != header.checksum {
            return Ok(Some(Err(WireError::Checksum(header.command))));
        }

        Ok(Some(Packet::decode(&header.command, &payload)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = packet.to_payload();
        dst.reserve(HEADER_LEN + payload.len());
        write_frame(dst, self.magic, packet.command(), &payload);
        Ok(())
    }
}

// =============================================================================
// Parser / Framer
// =============================================================================

/// Incremental byte parser
#[derive(Debug)]
pub struct Parser {
    codec: PacketCodec,
    pending: BytesMut,
}

impl Parser {
    pub fn new(magic: u32) -> Self {
        Self {
            codec: PacketCodec::new(magic),
            pending: BytesMut::new(),
        }
    }

    /// Buffer `data` and return every packet (or framing error) it completes
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Packet, WireError>> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();
        // The codec never returns an io::Error.
        while let Ok(Some(item)) = self.codec.decode(&mut self.pending) {
            out.push(item);
        }
        out
    }
}

/// Serializes packets into complete frames
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    magic: u32,
}

impl Framer {
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }

    pub fn frame(&self, packet: &Packet) -> Vec<u8> {
        self.frame_raw(packet.command(), &packet.to_payload())
    }

    pub fn frame_raw(&self, command: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        write_frame(&mut buf, self.magic, command, payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Network;

    fn magic() -> u32 {
        Network::main().magic
    }

    #[test]
    fn test_verack_frame_bytes() {
        let frame = Framer::new(magic()).frame(&Packet::Verack);
        assert_eq!(
            hex::encode(&frame),
            "f9beb4d976657261636b000000000000000000005df6e0e2"
        );
    }

    #[test]
    fn test_parser_split_delivery() {
        let framer = Framer::new(magic());
        let mut data = framer.frame(&Packet::Ping(Some(9)));
        data.extend(framer.frame(&Packet::Pong(9)));

        let mut parser = Parser::new(magic());
        let mut packets = Vec::new();
        for chunk in data.chunks(5) {
            packets.extend(parser.feed(chunk));
        }
        assert_eq!(
            packets,
            vec![Ok(Packet::Ping(Some(9))), Ok(Packet::Pong(9))]
        );
    }

    #[test]
    fn test_bad_magic_then_recovery() {
        let mut data = Framer::new(0x1234_5678).frame(&Packet::Verack);
        data.extend(Framer::new(magic()).frame(&Packet::GetAddr));

        let mut parser = Parser::new(magic());
        let out = parser.feed(&data);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Err(WireError::InvalidMagic(0x1234_5678)));
        assert_eq!(out[1], Ok(Packet::GetAddr));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = Framer::new(magic()).frame(&Packet::Pong(1));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let out = Parser::new(magic()).feed(&frame);
        assert!(matches!(out[0], Err(WireError::Checksum(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut frame = Framer::new(magic()).frame(&Packet::Verack);
        frame[16..20].copy_from_slice(&((MAX_MESSAGE as u32) + 1).to_le_bytes());
        let out = Parser::new(magic()).feed(&frame);
        assert_eq!(out, vec![Err(WireError::PacketTooLarge(MAX_MESSAGE + 1))]);
    }

    #[test]
    fn test_command_without_terminator() {
        let frame = Framer::new(magic()).frame_raw("abcdefghijkl", &[]);
        let out = Parser::new(magic()).feed(&frame);
        assert_eq!(out, vec![Err(WireError::BadCommand)]);
    }
}
