#![forbid(unsafe_code)]

use std::io::{self, Read, Write};
use std::time::Duration;
use std::{error, fmt};

use log::{debug, warn};
use zeroize::Zeroize;

use conduit::{status, Conn};

// LOGIN_TIMEOUT guards the client against a server that accepts the
// session descriptor and then stalls before answering.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

// Session op codes: what the client is asking the far side to run. The
// byte travels as the first descriptor field; the execution subsystems
// behind it live outside this crate.
pub mod op {
    pub const SHELL: u8 = b'i';
    pub const COMMAND: u8 = b'c';
    pub const COPY_TO: u8 = b'D';
    pub const COPY_FROM: u8 = b'S';
}

// a descriptor field longer than this is not a legitimate login
const MAX_FIELD_LEN: usize = 1024 * 1024;
const MAX_HEADER_LEN: usize = 128;

// SessionInfo is the session descriptor exchanged right after the
// handshake: what to run, as whom, where from. The exit status is filled
// in when the session ends. The auth cookie is wiped as soon as the
// verdict is known, and at the latest on drop.
pub struct SessionInfo {
    op: u8,
    who: Vec<u8>,
    connhost: Vec<u8>,
    term_type: Vec<u8>,
    cmd: Vec<u8>,
    auth_cookie: Vec<u8>,
    status: u32,
}

impl SessionInfo {
    pub fn new(
        op: u8,
        who: &[u8],
        connhost: &[u8],
        term_type: &[u8],
        cmd: &[u8],
        auth_cookie: &[u8],
    ) -> Self {
        SessionInfo {
            op: op,
            who: who.to_vec(),
            connhost: connhost.to_vec(),
            term_type: term_type.to_vec(),
            cmd: cmd.to_vec(),
            auth_cookie: auth_cookie.to_vec(),
            status: status::STILL_OPEN,
        }
    }

    pub fn op(&self) -> u8 {
        self.op
    }

    pub fn who(&self) -> &[u8] {
        &self.who
    }

    pub fn connhost(&self) -> &[u8] {
        &self.connhost
    }

    pub fn term_type(&self) -> &[u8] {
        &self.term_type
    }

    pub fn cmd(&self) -> &[u8] {
        &self.cmd
    }

    pub fn auth_cookie(&self) -> &[u8] {
        &self.auth_cookie
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn set_status(&mut self, code: u32) {
        self.status = code;
    }

    pub fn zero_cookie(&mut self) {
        self.auth_cookie.zeroize();
        self.auth_cookie.clear();
    }
}

impl Drop for SessionInfo {
    fn drop(&mut self) {
        self.zero_cookie();
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never the cookie
        write!(
            f,
            "SessionInfo [ op {} who {:?} connhost {:?} term {:?} status {} ]",
            self.op,
            String::from_utf8_lossy(&self.who),
            String::from_utf8_lossy(&self.connhost),
            String::from_utf8_lossy(&self.term_type),
            self.status,
        )
    }
}

#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Malformed(String),
    Oversize(usize),
    // no auth verdict within LOGIN_TIMEOUT
    AuthTimeout,
}

impl error::Error for SessionError {
    fn cause(&self) -> Option<&dyn error::Error> {
        use self::SessionError::*;

        match self {
            Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::SessionError::*;

        match self {
            Io(e) => write!(f, "io error: {}", e),
            Malformed(msg) => write!(f, "malformed session header: {}", msg),
            &Oversize(len) => write!(f, "session field of {} bytes refused", len),
            AuthTimeout => write!(f, "no auth verdict within {:?}", LOGIN_TIMEOUT),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

// Authenticator is the seam to the credential stores, which live outside
// the core: given who is logging in from where with which cookie, answer
// yes or no.
pub trait Authenticator {
    fn verify(&self, who: &[u8], connhost: &[u8], cookie: &[u8]) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&[u8], &[u8], &[u8]) -> bool,
{
    fn verify(&self, who: &[u8], connhost: &[u8], cookie: &[u8]) -> bool {
        self(who, connhost, cookie)
    }
}

// send_session writes the descriptor: one header line carrying the six
// field lengths, then the raw field bytes back to back.
pub fn send_session<W: Write>(w: &mut W, info: &SessionInfo) -> io::Result<()> {
    write!(
        w,
        "{} {} {} {} {} {}\n",
        1,
        info.who.len(),
        info.connhost.len(),
        info.term_type.len(),
        info.cmd.len(),
        info.auth_cookie.len(),
    )?;
    w.write_all(&[info.op])?;
    w.write_all(&info.who)?;
    w.write_all(&info.connhost)?;
    w.write_all(&info.term_type)?;
    w.write_all(&info.cmd)?;
    w.write_all(&info.auth_cookie)?;
    w.flush()
}

// read_session consumes the peer's descriptor with exact-length reads;
// only the header line is delimited by a newline, and it is bounded.
pub fn read_session<R: Read>(r: &mut R) -> Result<SessionInfo, SessionError> {
    let mut line = Vec::new();
    let mut byte = [0; 1];
    loop {
        r.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_HEADER_LEN {
            return Err(SessionError::Malformed(String::from("header line too long")));
        }
    }

    let line = String::from_utf8(line)
        .map_err(|_| SessionError::Malformed(String::from("non-utf8 header")))?;
    let mut lens = [0usize; 6];
    let mut fields = line.split_whitespace();
    for slot in lens.iter_mut() {
        let text = fields
            .next()
            .ok_or_else(|| SessionError::Malformed(String::from("missing field length")))?;
        *slot = text
            .parse()
            .map_err(|_| SessionError::Malformed(String::from("bad field length")))?;
    }
    if fields.next().is_some() {
        return Err(SessionError::Malformed(String::from("trailing header junk")));
    }

    if lens[0] != 1 {
        return Err(SessionError::Malformed(String::from("op field must be 1 byte")));
    }
    for &len in &lens[1..] {
        if len > MAX_FIELD_LEN {
            return Err(SessionError::Oversize(len));
        }
    }

    let mut op = [0; 1];
    r.read_exact(&mut op)?;

    let mut read_field = |len: usize| -> Result<Vec<u8>, SessionError> {
        let mut field = vec![0; len];
        r.read_exact(&mut field)?;
        Ok(field)
    };

    let who = read_field(lens[1])?;
    let connhost = read_field(lens[2])?;
    let term_type = read_field(lens[3])?;
    let cmd = read_field(lens[4])?;
    let auth_cookie = read_field(lens[5])?;

    Ok(SessionInfo {
        op: op[0],
        who: who,
        connhost: connhost,
        term_type: term_type,
        cmd: cmd,
        auth_cookie: auth_cookie,
        status: status::STILL_OPEN,
    })
}

// client_login sends the descriptor and waits for the one-byte verdict,
// bounded by LOGIN_TIMEOUT. true means the server accepted the session.
pub fn client_login(conn: &mut Conn, info: &SessionInfo) -> Result<bool, SessionError> {
    send_session(conn, info)?;

    conn.set_read_timeout(Some(LOGIN_TIMEOUT))?;
    let mut verdict = [0; 1];
    let outcome = conn.read_exact(&mut verdict);
    let _ = conn.set_read_timeout(None);

    match outcome {
        Ok(()) => {
            debug!("auth verdict: {}", verdict[0]);
            Ok(verdict[0] == 1)
        }
        Err(e)
            if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Err(SessionError::AuthTimeout)
        }
        Err(e) => Err(SessionError::Io(e)),
    }
}

// server_verify reads the descriptor, consults the authenticator, and
// answers with exactly one byte. A rejected session is closed on the spot
// with a BAD_AUTH close status; the cookie is wiped either way.
pub fn server_verify<A: Authenticator>(
    conn: &mut Conn,
    auth: &A,
) -> Result<(SessionInfo, bool), SessionError> {
    let mut info = read_session(conn)?;
    let ok = auth.verify(&info.who, &info.connhost, &info.auth_cookie);
    info.zero_cookie();

    conn.write_all(&[if ok { 1 } else { 0 }])?;
    let _ = conn.flush();

    if !ok {
        warn!("auth rejected for {:?}", String::from_utf8_lossy(&info.who));
        conn.set_status(status::BAD_AUTH);
        conn.close();
    }
    Ok((info, ok))
}
