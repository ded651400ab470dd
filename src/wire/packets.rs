//! Typed protocol messages
//!
//! Every message kind is one variant of [`Packet`]. Each variant knows its
//! payload size and how to encode and decode itself; framing lives in
//! `framing.rs`.

use crate::bip152::{CompactBlock, TxRequest, TxResponse};
use crate::core::{Block, BlockHeader, MerkleBlock, Transaction, HEADER_SIZE};
use crate::crypto::Hash256;
use crate::wire::encoding::{
    var_bytes_size, varint_size, write_hash, write_var_bytes, write_varint, Reader, WireError,
};
use crate::wire::netaddress::NetAddress;
use crate::wire::types::{
    InvItem, RejectCode, Services, MAX_ADDR, MAX_AGENT, MAX_HEADERS, MAX_INV, PROTOCOL_VERSION,
};
use bytes::BufMut;
use std::fmt;

/// Longest command carried in a `reject`
const MAX_REJECT_MESSAGE: usize = 12;

/// Longest reason carried in a `reject`
const MAX_REJECT_REASON: usize = 111;

/// Bloom filter size limit
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Bloom filter hash function limit
pub const MAX_HASH_FUNCS: u32 = 50;

/// Largest element accepted by `filteradd`
pub const MAX_FILTERADD: usize = 520;

// =============================================================================
// Packet Types
// =============================================================================

/// Message discriminant; `Data` is an internal type resolved by any
/// block or transaction payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    SendHeaders,
    Block,
    Tx,
    Reject,
    Mempool,
    FilterLoad,
    FilterAdd,
    FilterClear,
    MerkleBlock,
    FeeFilter,
    SendCmpct,
    CmpctBlock,
    GetBlockTxn,
    BlockTxn,
    Unknown,
    Data,
}

impl PacketType {
    pub fn from_command(command: &str) -> Self {
        match command {
            "version" => PacketType::Version,
            "verack" => PacketType::Verack,
            "ping" => PacketType::Ping,
            "pong" => PacketType::Pong,
            "getaddr" => PacketType::GetAddr,
            "addr" => PacketType::Addr,
            "inv" => PacketType::Inv,
            "getdata" => PacketType::GetData,
            "notfound" => PacketType::NotFound,
            "getblocks" => PacketType::GetBlocks,
            "getheaders" => PacketType::GetHeaders,
            "headers" => PacketType::Headers,
            "sendheaders" => PacketType::SendHeaders,
            "block" => PacketType::Block,
            "tx" => PacketType::Tx,
            "reject" => PacketType::Reject,
            "mempool" => PacketType::Mempool,
            "filterload" => PacketType::FilterLoad,
            "filteradd" => PacketType::FilterAdd,
            "filterclear" => PacketType::FilterClear,
            "merkleblock" => PacketType::MerkleBlock,
            "feefilter" => PacketType::FeeFilter,
            "sendcmpct" => PacketType::SendCmpct,
            "cmpctblock" => PacketType::CmpctBlock,
            "getblocktxn" => PacketType::GetBlockTxn,
            "blocktxn" => PacketType::BlockTxn,
            _ => PacketType::Unknown,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            PacketType::Version => "version",
            PacketType::Verack => "verack",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
            PacketType::GetAddr => "getaddr",
            PacketType::Addr => "addr",
            PacketType::Inv => "inv",
            PacketType::GetData => "getdata",
            PacketType::NotFound => "notfound",
            PacketType::GetBlocks => "getblocks",
            PacketType::GetHeaders => "getheaders",
            PacketType::Headers => "headers",
            PacketType::SendHeaders => "sendheaders",
            PacketType::Block => "block",
            PacketType::Tx => "tx",
            PacketType::Reject => "reject",
            PacketType::Mempool => "mempool",
            PacketType::FilterLoad => "filterload",
            PacketType::FilterAdd => "filteradd",
            PacketType::FilterClear => "filterclear",
            PacketType::MerkleBlock => "merkleblock",
            PacketType::FeeFilter => "feefilter",
            PacketType::SendCmpct => "sendcmpct",
            PacketType::CmpctBlock => "cmpctblock",
            PacketType::GetBlockTxn => "getblocktxn",
            PacketType::BlockTxn => "blocktxn",
            PacketType::Unknown => "unknown",
            PacketType::Data => "data",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

// =============================================================================
// Payload Structs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPacket {
    pub version: i32,
    pub services: Services,
    pub time: i64,
    pub remote: NetAddress,
    pub local: NetAddress,
    pub nonce: u64,
    pub agent: String,
    pub height: i32,
    pub no_relay: bool,
}

impl Default for VersionPacket {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: Services::NETWORK,
            time: 0,
            remote: NetAddress::default(),
            local: NetAddress::default(),
            nonce: 0,
            agent: String::new(),
            height: 0,
            no_relay: false,
        }
    }
}

impl VersionPacket {
    fn size(&self) -> usize {
        4 + 8
            + 8
            + NetAddress::SIZE_NO_TIME * 2
            + 8
            + var_bytes_size(self.agent.len())
            + 4
            + 1
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.time);
        self.remote.encode_no_time(buf);
        self.local.encode_no_time(buf);
        buf.put_u64_le(self.nonce);
        write_var_bytes(buf, self.agent.as_bytes());
        buf.put_i32_le(self.height);
        buf.put_u8(if self.no_relay { 0 } else { 1 });
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let mut version = reader.read_i32()?;
        let services = Services::from_bits_retain(reader.read_u64()?);
        let time = reader.read_i64()?;
        let remote = NetAddress::decode_no_time(reader)?;

        let mut packet = Self {
            version,
            services,
            time,
            remote,
            ..Self::default()
        };

        // Everything after the remote address is optional.
        if reader.left() > 0 {
            packet.local = NetAddress::decode_no_time(reader)?;
            packet.nonce = reader.read_u64()?;
        }

        if reader.left() > 0 {
            packet.agent = reader.read_var_string(MAX_AGENT, "user agent")?;
        }

        if reader.left() > 0 {
            packet.height = reader.read_i32()?;
        }

        if reader.left() > 0 {
            packet.no_relay = reader.read_u8()? == 0;
        }

        if version == 10300 {
            version = 300;
        }

        if version < 0 {
            return Err(WireError::Invalid(format!("version {}", version)));
        }

        if packet.time < 0 {
            return Err(WireError::Invalid(format!("timestamp {}", packet.time)));
        }

        packet.version = version;
        packet.height = packet.height.max(0);

        Ok(packet)
    }
}

/// Shared shape of `getblocks` and `getheaders`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorPacket {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop: Option<Hash256>,
}

impl LocatorPacket {
    pub fn new(locator: Vec<Hash256>, stop: Option<Hash256>) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            locator,
            stop,
        }
    }

    fn size(&self) -> usize {
        4 + varint_size(self.locator.len() as u64) + 32 * self.locator.len() + 32
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.version);
        write_varint(buf, self.locator.len() as u64);
        for hash in &self.locator {
            write_hash(buf, hash);
        }
        write_hash(buf, &self.stop.unwrap_or(Hash256::ZERO));
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let version = reader.read_u32()?;
        let count = reader.read_strict_count(MAX_INV, "locator")?;
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(reader.read_hash()?);
        }
        let stop = reader.read_hash()?;
        Ok(Self {
            version,
            locator,
            stop: if stop.is_zero() { None } else { Some(stop) },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPacket {
    pub block: Block,
    pub witness: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPacket {
    pub tx: Transaction,
    pub witness: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectPacket {
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<Hash256>,
}

impl RejectPacket {
    fn carries_hash(message: &str) -> bool {
        message == "block" || message == "tx"
    }

    fn size(&self) -> usize {
        let mut size = var_bytes_size(self.message.len()) + 1 + var_bytes_size(self.reason.len());
        if Self::carries_hash(&self.message) {
            size += 32;
        }
        size
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_bytes(buf, self.message.as_bytes());
        buf.put_u8(self.code.to_u8());
        write_var_bytes(buf, self.reason.as_bytes());
        if Self::carries_hash(&self.message) {
            write_hash(buf, &self.hash.unwrap_or(Hash256::ZERO));
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let message = reader.read_var_string(MAX_REJECT_MESSAGE, "reject message")?;
        let code = RejectCode::from_u8(reader.read_u8()?);
        let reason = reader.read_var_string(MAX_REJECT_REASON, "reject reason")?;
        let hash = if Self::carries_hash(&message) {
            Some(reader.read_hash()?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            hash,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadPacket {
    pub filter: Vec<u8>,
    pub n_hash_funcs: u32,
    pub tweak: u32,
    pub update: u8,
}

impl FilterLoadPacket {
    pub fn is_within_constraints(&self) -> bool {
        self.filter.len() <= MAX_BLOOM_FILTER_SIZE && self.n_hash_funcs <= MAX_HASH_FUNCS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCmpctPacket {
    pub mode: u8,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmpctBlockPacket {
    pub block: CompactBlock,
    pub witness: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTxnPacket {
    pub response: TxResponse,
    pub witness: bool,
}

/// Message with a command we do not understand, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPacket {
    pub command: String,
    pub payload: Vec<u8>,
}

// =============================================================================
// Packet
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Version(VersionPacket),
    Verack,
    Ping(Option<u64>),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(LocatorPacket),
    GetHeaders(LocatorPacket),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    Block(BlockPacket),
    Tx(TxPacket),
    Reject(RejectPacket),
    Mempool,
    FilterLoad(FilterLoadPacket),
    FilterAdd(Vec<u8>),
    FilterClear,
    MerkleBlock(MerkleBlock),
    FeeFilter(i64),
    SendCmpct(SendCmpctPacket),
    CmpctBlock(CmpctBlockPacket),
    GetBlockTxn(TxRequest),
    BlockTxn(BlockTxnPacket),
    Unknown(UnknownPacket),
}

fn inv_size(items: &[InvItem]) -> usize {
    varint_size(items.len() as u64) + InvItem::SIZE * items.len()
}

fn encode_inv<B: BufMut>(buf: &mut B, items: &[InvItem]) {
    write_varint(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

fn decode_inv(reader: &mut Reader<'_>) -> Result<Vec<InvItem>, WireError> {
    let count = reader.read_strict_count(MAX_INV, "inv")?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InvItem::decode(reader)?);
    }
    Ok(items)
}

impl Packet {
    pub fn kind(&self) -> PacketType {
        match self {
            Packet::Version(_) => PacketType::Version,
            Packet::Verack => PacketType::Verack,
            Packet::Ping(_) => PacketType::Ping,
            Packet::Pong(_) => PacketType::Pong,
            Packet::GetAddr => PacketType::GetAddr,
            Packet::Addr(_) => PacketType::Addr,
            Packet::Inv(_) => PacketType::Inv,
            Packet::GetData(_) => PacketType::GetData,
            Packet::NotFound(_) => PacketType::NotFound,
            Packet::GetBlocks(_) => PacketType::GetBlocks,
            Packet::GetHeaders(_) => PacketType::GetHeaders,
            Packet::Headers(_) => PacketType::Headers,
            Packet::SendHeaders => PacketType::SendHeaders,
            Packet::Block(_) => PacketType::Block,
            Packet::Tx(_) => PacketType::Tx,
            Packet::Reject(_) => PacketType::Reject,
            Packet::Mempool => PacketType::Mempool,
            Packet::FilterLoad(_) => PacketType::FilterLoad,
            Packet::FilterAdd(_) => PacketType::FilterAdd,
            Packet::FilterClear => PacketType::FilterClear,
            Packet::MerkleBlock(_) => PacketType::MerkleBlock,
            Packet::FeeFilter(_) => PacketType::FeeFilter,
            Packet::SendCmpct(_) => PacketType::SendCmpct,
            Packet::CmpctBlock(_) => PacketType::CmpctBlock,
            Packet::GetBlockTxn(_) => PacketType::GetBlockTxn,
            Packet::BlockTxn(_) => PacketType::BlockTxn,
            Packet::Unknown(_) => PacketType::Unknown,
        }
    }

    /// Command string placed in the frame header
    pub fn command(&self) -> &str {
        match self {
            Packet::Unknown(packet) => &packet.command,
            other => other.kind().command(),
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        match self {
            Packet::Version(packet) => packet.size(),
            Packet::Verack
            | Packet::GetAddr
            | Packet::SendHeaders
            | Packet::Mempool
            | Packet::FilterClear => 0,
            Packet::Ping(nonce) => {
                if nonce.is_some() {
                    8
                } else {
                    0
                }
            }
            Packet::Pong(_) => 8,
            Packet::Addr(items) => varint_size(items.len() as u64) + NetAddress::SIZE * items.len(),
            Packet::Inv(items) | Packet::GetData(items) | Packet::NotFound(items) => {
                inv_size(items)
            }
            Packet::GetBlocks(packet) | Packet::GetHeaders(packet) => packet.size(),
            Packet::Headers(headers) => {
                varint_size(headers.len() as u64) + (HEADER_SIZE + 1) * headers.len()
            }
            Packet::Block(packet) => packet.block.size(packet.witness),
            Packet::Tx(packet) => packet.tx.size(packet.witness),
            Packet::Reject(packet) => packet.size(),
            Packet::FilterLoad(packet) => var_bytes_size(packet.filter.len()) + 9,
            Packet::FilterAdd(data) => var_bytes_size(data.len()),
            Packet::MerkleBlock(block) => block.size(),
            Packet::FeeFilter(_) => 8,
            Packet::SendCmpct(_) => 9,
            Packet::CmpctBlock(packet) => packet.block.size(packet.witness),
            Packet::GetBlockTxn(request) => request.size(),
            Packet::BlockTxn(packet) => packet.response.size(packet.witness),
            Packet::Unknown(packet) => packet.payload.len(),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Packet::Version(packet) => packet.encode(buf),
            Packet::Verack
            | Packet::GetAddr
            | Packet::SendHeaders
            | Packet::Mempool
            | Packet::FilterClear => {}
            Packet::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    buf.put_u64_le(*nonce);
                }
            }
            Packet::Pong(nonce) => buf.put_u64_le(*nonce),
            Packet::Addr(items) => {
                write_varint(buf, items.len() as u64);
                for addr in items {
                    addr.encode(buf);
                }
            }
            Packet::Inv(items) | Packet::GetData(items) | Packet::NotFound(items) => {
                encode_inv(buf, items)
            }
            Packet::GetBlocks(packet) | Packet::GetHeaders(packet) => packet.encode(buf),
            Packet::Headers(headers) => {
                write_varint(buf, headers.len() as u64);
                for header in headers {
                    header.encode(buf);
                    write_varint(buf, 0);
                }
            }
            Packet::Block(packet) => packet.block.encode(buf, packet.witness),
            Packet::Tx(packet) => packet.tx.encode(buf, packet.witness),
            Packet::Reject(packet) => packet.encode(buf),
            Packet::FilterLoad(packet) => {
                write_var_bytes(buf, &packet.filter);
                buf.put_u32_le(packet.n_hash_funcs);
                buf.put_u32_le(packet.tweak);
                buf.put_u8(packet.update);
            }
            Packet::FilterAdd(data) => write_var_bytes(buf, data),
            Packet::MerkleBlock(block) => block.encode(buf),
            Packet::FeeFilter(rate) => buf.put_i64_le(*rate),
            Packet::SendCmpct(packet) => {
                buf.put_u8(packet.mode);
                buf.put_u64_le(packet.version);
            }
            Packet::CmpctBlock(packet) => packet.block.encode(buf, packet.witness),
            Packet::GetBlockTxn(request) => request.encode(buf),
            Packet::BlockTxn(packet) => packet.response.encode(buf, packet.witness),
            Packet::Unknown(packet) => buf.put_slice(&packet.payload),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.encode(&mut buf);
        buf
    }

    /// Decode the payload of a frame carrying `command`
    pub fn decode(command: &str, payload: &[u8]) -> Result<Packet, WireError> {
        let mut reader = Reader::new(payload);
        let r = &mut reader;

        let packet = match PacketType::from_command(command) {
            PacketType::Version => Packet::Version(VersionPacket::decode(r)?),
            PacketType::Verack => Packet::Verack,
            PacketType::Ping => {
                if r.left() >= 8 {
                    Packet::Ping(Some(r.read_u64()?))
                } else {
                    Packet::Ping(None)
                }
            }
            PacketType::Pong => Packet::Pong(r.read_u64()?),
            PacketType::GetAddr => Packet::GetAddr,
            PacketType::Addr => {
                let count = r.read_count(MAX_ADDR, "addr")?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(NetAddress::decode(r)?);
                }
                Packet::Addr(items)
            }
            PacketType::Inv => Packet::Inv(decode_inv(r)?),
            PacketType::GetData => Packet::GetData(decode_inv(r)?),
            PacketType::NotFound => Packet::NotFound(decode_inv(r)?),
            PacketType::GetBlocks => Packet::GetBlocks(LocatorPacket::decode(r)?),
            PacketType::GetHeaders => Packet::GetHeaders(LocatorPacket::decode(r)?),
            PacketType::Headers => {
                let count = r.read_count(MAX_HEADERS, "headers")?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(r)?);
                    r.read_varint()?;
                }
                Packet::Headers(headers)
            }
            PacketType::SendHeaders => Packet::SendHeaders,
            PacketType::Block => {
                let block = Block::decode(r)?;
                let witness = block.has_witness();
                Packet::Block(BlockPacket { block, witness })
            }
            PacketType::Tx => {
                let tx = Transaction::decode(r)?;
                let witness = tx.has_witness();
                Packet::Tx(TxPacket { tx, witness })
            }
            PacketType::Reject => Packet::Reject(RejectPacket::decode(r)?),
            PacketType::Mempool => Packet::Mempool,
            PacketType::FilterLoad => {
                let filter = r.read_var_bytes(MAX_MESSAGE_FILTER, "filter")?.to_vec();
                Packet::FilterLoad(FilterLoadPacket {
                    filter,
                    n_hash_funcs: r.read_u32()?,
                    tweak: r.read_u32()?,
                    update: r.read_u8()?,
                })
            }
            PacketType::FilterAdd => {
                Packet::FilterAdd(r.read_var_bytes(MAX_MESSAGE_FILTER, "filteradd")?.to_vec())
            }
            PacketType::FilterClear => Packet::FilterClear,
            PacketType::MerkleBlock => Packet::MerkleBlock(MerkleBlock::decode(r)?),
            PacketType::FeeFilter => Packet::FeeFilter(r.read_i64()?),
            PacketType::SendCmpct => Packet::SendCmpct(SendCmpctPacket {
                mode: r.read_u8()?,
                version: r.read_u64()?,
            }),
            PacketType::CmpctBlock => {
                let block = CompactBlock::decode(r)?;
                let witness = block.has_witness();
                Packet::CmpctBlock(CmpctBlockPacket { block, witness })
            }
            PacketType::GetBlockTxn => Packet::GetBlockTxn(TxRequest::decode(r)?),
            PacketType::BlockTxn => {
                let response = TxResponse::decode(r)?;
                let witness = response.has_witness();
                Packet::BlockTxn(BlockTxnPacket { response, witness })
            }
            PacketType::Unknown | PacketType::Data => Packet::Unknown(UnknownPacket {
                command: command.to_string(),
                payload: payload.to_vec(),
            }),
        };

        Ok(packet)
    }
}

/// Decoding bound for filter payloads; size policy is enforced by the peer
const MAX_MESSAGE_FILTER: usize = crate::wire::types::MAX_MESSAGE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::make_block;
    use crate::wire::types::InvType;

    fn roundtrip(packet: Packet) {
        let payload = packet.to_payload();
        assert_eq!(payload.len(), packet.size(), "size of {}", packet.command());
        let decoded = Packet::decode(packet.command(), &payload).unwrap();
        assert_eq!(decoded, packet);
    }

    fn full_version() -> VersionPacket {
        VersionPacket {
            version: PROTOCOL_VERSION,
            services: Services::NETWORK | Services::WITNESS,
            time: 1_600_000_000,
            remote: NetAddress::from_hostname("1.2.3.4:8333", 0).unwrap(),
            local: NetAddress::from_hostname("5.6.7.8:8333", 0).unwrap(),
            nonce: 0xdead_beef,
            agent: "/mini-p2p:0.1.0/".to_string(),
            height: 500,
            no_relay: true,
        }
    }

    #[test]
    fn test_version_roundtrip() {
        roundtrip(Packet::Version(full_version()));
    }

    #[test]
    fn test_version_optional_tail() {
        let full = full_version().clone();
        let payload = Packet::Version(full.clone()).to_payload();

        // Cut right after the remote address: local, nonce, agent, height and
        // relay fall back to defaults.
        let short = &payload[..4 + 8 + 8 + 26];
        let Packet::Version(decoded) = Packet::decode("version", short).unwrap() else {
            panic!("wrong packet type");
        };
        assert_eq!(decoded.remote, full.remote);
        assert_eq!(decoded.nonce, 0);
        assert_eq!(decoded.agent, "");
        assert_eq!(decoded.height, 0);
        assert!(!decoded.no_relay);

        // Cut before the relay byte only.
        let without_relay = &payload[..payload.len() - 1];
        let Packet::Version(decoded) = Packet::decode("version", without_relay).unwrap() else {
            panic!("wrong packet type");
        };
        assert_eq!(decoded.height, 500);
        assert!(!decoded.no_relay);
    }

    #[test]
    fn test_version_negative_height_is_clamped() {
        let mut version = full_version();
        version.height = -5;
        let payload = Packet::Version(version).to_payload();
        let Packet::Version(decoded) = Packet::decode("version", &payload).unwrap() else {
            panic!("wrong packet type");
        };
        assert_eq!(decoded.height, 0);
    }

    #[test]
    fn test_version_legacy_and_negative() {
        let mut version = full_version();
        version.version = 10300;
        let payload = Packet::Version(version.clone()).to_payload();
        let Packet::Version(decoded) = Packet::decode("version", &payload).unwrap() else {
            panic!("wrong packet type");
        };
        assert_eq!(decoded.version, 300);

        version.version = -1;
        let payload = Packet::Version(version.clone()).to_payload();
        assert!(Packet::decode("version", &payload).is_err());

        version.version = PROTOCOL_VERSION;
        version.time = -1;
        let payload = Packet::Version(version).to_payload();
        assert!(Packet::decode("version", &payload).is_err());
    }

    #[test]
    fn test_simple_roundtrips() {
        roundtrip(Packet::Verack);
        roundtrip(Packet::Ping(Some(42)));
        roundtrip(Packet::Ping(None));
        roundtrip(Packet::Pong(7));
        roundtrip(Packet::GetAddr);
        roundtrip(Packet::SendHeaders);
        roundtrip(Packet::Mempool);
        roundtrip(Packet::FilterClear);
        roundtrip(Packet::FeeFilter(1000));
        roundtrip(Packet::SendCmpct(SendCmpctPacket {
            mode: 1,
            version: 2,
        }));
        roundtrip(Packet::FilterAdd(vec![1, 2, 3]));
        roundtrip(Packet::FilterLoad(FilterLoadPacket {
            filter: vec![0xff; 10],
            n_hash_funcs: 5,
            tweak: 99,
            update: 1,
        }));
    }

    #[test]
    fn test_addr_and_inv_roundtrip() {
        let mut addr = NetAddress::from_hostname("9.9.9.9:8333", 0).unwrap();
        addr.time = 1_600_000_000;
        addr.services = Services::NETWORK;
        roundtrip(Packet::Addr(vec![addr; 3]));

        let items = vec![
            InvItem::tx(Hash256::new([1; 32])),
            InvItem::block(Hash256::new([2; 32])),
            InvItem::new(InvType::WitnessBlock, Hash256::new([3; 32])),
        ];
        roundtrip(Packet::Inv(items.clone()));
        roundtrip(Packet::GetData(items.clone()));
        roundtrip(Packet::NotFound(items));
    }

    #[test]
    fn test_locator_stop_hash() {
        let locator = vec![Hash256::new([1; 32]), Hash256::new([2; 32])];
        roundtrip(Packet::GetBlocks(LocatorPacket::new(locator.clone(), None)));
        roundtrip(Packet::GetHeaders(LocatorPacket::new(
            locator,
            Some(Hash256::new([3; 32])),
        )));

        let zero_stop = Packet::GetHeaders(LocatorPacket::new(vec![], Some(Hash256::ZERO)));
        let Packet::GetHeaders(decoded) =
            Packet::decode("getheaders", &zero_stop.to_payload()).unwrap()
        else {
            panic!("wrong packet type");
        };
        assert_eq!(decoded.stop, None);
    }

    #[test]
    fn test_oversized_locator_rejected() {
        let mut payload = Vec::new();
        payload.put_u32_le(PROTOCOL_VERSION as u32);
        write_varint(&mut payload, (MAX_INV + 1) as u64);
        assert!(matches!(
            Packet::decode("getblocks", &payload),
            Err(WireError::Violation("locator", _))
        ));
    }

    #[test]
    fn test_oversized_inv_is_violation() {
        let mut payload = Vec::new();
        write_varint(&mut payload, (MAX_INV + 1) as u64);
        let err = Packet::decode("getdata", &payload).unwrap_err();
        assert!(err.is_violation());

        // Other oversized counts stay ordinary decode errors.
        let mut payload = Vec::new();
        write_varint(&mut payload, (MAX_HEADERS + 1) as u64);
        let err = Packet::decode("headers", &payload).unwrap_err();
        assert!(!err.is_violation());
    }

    #[test]
    fn test_reject_hash_presence() {
        roundtrip(Packet::Reject(RejectPacket {
            message: "tx".to_string(),
            code: RejectCode::InsufficientFee,
            reason: "mempool min fee not met".to_string(),
            hash: Some(Hash256::new([5; 32])),
        }));

        let version_reject = Packet::Reject(RejectPacket {
            message: "version".to_string(),
            code: RejectCode::Obsolete,
            reason: "old".to_string(),
            hash: None,
        });
        assert_eq!(version_reject.size(), 8 + 1 + 4);
        roundtrip(version_reject);
    }

    #[test]
    fn test_block_tx_headers_roundtrip() {
        let block = make_block(Hash256::ZERO, 7, 2, true);
        roundtrip(Packet::Headers(vec![block.header; 3]));
        roundtrip(Packet::Tx(TxPacket {
            tx: block.txs[1].clone(),
            witness: true,
        }));
        roundtrip(Packet::Block(BlockPacket {
            block,
            witness: true,
        }));
    }

    #[test]
    fn test_unknown_command_preserved() {
        let decoded = Packet::decode("sendaddrv2", &[1, 2, 3]).unwrap();
        assert_eq!(decoded.kind(), PacketType::Unknown);
        assert_eq!(decoded.command(), "sendaddrv2");
        assert_eq!(decoded.to_payload(), vec![1, 2, 3]);
    }
}
