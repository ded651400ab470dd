//! Wire protocol
//!
//! - `encoding`: bounds-checked reader and little-endian writers
//! - `types`: protocol constants, service bits, inventory and reject codes
//! - `netaddress`: peer addresses
//! - `packets`: every message kind with its payload codec
//! - `framing`: magic/command/checksum framing and the tokio codec

pub mod encoding;
pub mod framing;
pub mod netaddress;
pub mod packets;
pub mod types;

pub use encoding::{Reader, WireError};
pub use framing::{Framer, PacketCodec, Parser, HEADER_LEN};
pub use netaddress::NetAddress;
pub use packets::{
    BlockPacket, BlockTxnPacket, CmpctBlockPacket, FilterLoadPacket, LocatorPacket, Packet,
    PacketType, RejectPacket, SendCmpctPacket, TxPacket, UnknownPacket, VersionPacket,
};
pub use types::{InvItem, InvType, RejectCode, Services};
