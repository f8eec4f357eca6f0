//! TLS-over-stream socket core: one read/write/close surface regardless of
//! whether a connection is plaintext or encrypted, with adaptive TLS record
//! sizing driven by live TCP telemetry and an async session-resumption path
//! that can pause a handshake on an external lookup and replay it to
//! completion.

pub mod addr;
pub mod alpn;
pub mod backend;
pub mod buffer;
pub mod error;
pub mod export;
pub mod latency;
pub mod pool;
pub mod resumption;
pub mod socket;
pub mod tls;

pub use error::{Result, SocketError};
pub use socket::{HandshakeOutcome, Socket};
