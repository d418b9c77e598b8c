//! TDX socket-protocol provider (the primary bar source).

pub mod codec;
pub mod connection;
pub mod provider;

pub use codec::{CodecError, TdxBar, TdxSecurity};
pub use connection::TdxConnection;
pub use provider::TdxProvider;
