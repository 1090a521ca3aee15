#![forbid(unsafe_code)]

mod alg;
mod chaff;
mod conn;
mod crypto;
mod handshake;
mod packet;
pub mod status;
mod tunnel;

pub use self::alg::{pack_cipheropts, unpack_cipheropts, AcceptPolicy, CipherAlg, HmacAlg};
pub use self::chaff::ChaffParams;
pub use self::conn::{Conn, ConnError, Listener, WinSize};
pub use self::handshake::{ClientParams, HandshakeError, Negotiated};
pub use self::packet::{Opcode, MAX_DATA_LEN, MAX_PAYLOAD_LEN};
pub use self::tunnel::TunnelProbe;
