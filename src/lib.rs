#![forbid(unsafe_code)]

pub use conduit::{
    pack_cipheropts, status, unpack_cipheropts, AcceptPolicy, ChaffParams, CipherAlg,
    ClientParams, Conn, ConnError, HmacAlg, Listener, Opcode, TunnelProbe, WinSize,
    MAX_DATA_LEN, MAX_PAYLOAD_LEN,
};
pub use kex::KexAlg;
pub use session::{
    client_login, op, read_session, send_session, server_verify, Authenticator, SessionError,
    SessionInfo, LOGIN_TIMEOUT,
};

#[cfg(test)]
mod test_end_to_end;
