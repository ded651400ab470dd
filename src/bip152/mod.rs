//! BIP152 compact block relay

pub mod compact;
pub mod request;

pub use compact::{CompactBlock, CompactError};
pub use request::{TxRequest, TxResponse};
