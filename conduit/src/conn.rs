use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{error, fmt};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use kex::KexAlg;

use crate::alg::{AcceptPolicy, CipherAlg, HmacAlg};
use crate::chaff::{self, ChaffCtl, ChaffParams};
use crate::crypto::DirectionKeys;
use crate::handshake::{self, ClientParams, HandshakeError};
use crate::packet::{self, Opcode, OpenedPacket, PacketError};
use crate::status;
use crate::tunnel::{self, TunnelMux, TunnelProbe};

// WinSize is one window-change notification received via a TermSize
// record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug)]
pub enum ConnError {
    Io(io::Error),
    Handshake(HandshakeError),
    // the peer reported an integrity failure on its read side
    Tampered,
    // we detected an integrity failure on our read side
    Integrity,
    Corrupt(String),
}

impl ConnError {
    // close_status maps the failure onto the close-status code the
    // connection was, or would have been, torn down with. Plain I/O
    // failures have no code of their own.
    pub fn close_status(&self) -> Option<u32> {
        use self::ConnError::*;

        match self {
            Io(_) => None,
            Handshake(e) => e.close_status(),
            Tampered | Integrity | Corrupt(_) => Some(status::INTEGRITY_FAILED),
        }
    }
}

impl error::Error for ConnError {
    fn cause(&self) -> Option<&dyn error::Error> {
        use self::ConnError::*;

        match self {
            Io(e) => Some(e),
            Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ConnError::*;

        match self {
            Io(e) => write!(f, "io error: {}", e),
            Handshake(e) => write!(f, "handshake failed: {}", e),
            Tampered => write!(f, "remote detected tampering"),
            Integrity => write!(f, "record integrity failure"),
            Corrupt(msg) => write!(f, "corrupt record stream: {}", msg),
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e)
    }
}

impl From<HandshakeError> for ConnError {
    fn from(e: HandshakeError) -> Self {
        ConnError::Handshake(e)
    }
}

impl From<ConnError> for io::Error {
    fn from(e: ConnError) -> io::Error {
        match e {
            ConnError::Io(e) => e,
            ConnError::Tampered => {
                io::Error::new(io::ErrorKind::ConnectionAborted, ConnError::Tampered.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

// WireWriter is the shared write half: the raw transport plus the
// write-direction crypto state behind the framing mutex. Application
// writes, the chaff worker, and every tunnel worker funnel through here,
// so frames are linearized and headers never tear.
pub(crate) struct WireWriter {
    tx: Mutex<TxHalf>,
}

struct TxHalf {
    sock: TcpStream,
    keys: DirectionKeys,
}

impl WireWriter {
    fn new(sock: TcpStream, keys: DirectionKeys) -> Self {
        WireWriter {
            tx: Mutex::new(TxHalf { sock: sock, keys: keys }),
        }
    }

    pub(crate) fn write_packet(&self, op: Opcode, data: &[u8]) -> io::Result<usize> {
        let mut tx = self.tx.lock().unwrap();

        if data.is_empty() {
            let frame = packet::seal_packet(&mut tx.keys, op as u8, data);
            tx.sock.write_all(&frame)?;
            return Ok(0);
        }

        // a control payload has structure of its own and must not be cut
        if data.len() > packet::MAX_DATA_LEN && op != Opcode::None {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control payload exceeds a single record",
            ));
        }

        // bulk data records are split into consecutive frames while the
        // mutex is held, so no other writer interleaves mid-stream
        for chunk in data.chunks(packet::MAX_DATA_LEN) {
            let frame = packet::seal_packet(&mut tx.keys, op as u8, chunk);
            tx.sock.write_all(&frame)?;
        }
        Ok(data.len())
    }

    fn flush(&self) -> io::Result<()> {
        self.tx.lock().unwrap().sock.flush()
    }
}

// Conn is the secured channel over one raw transport. It exposes a byte
// stream (io::Read / io::Write wrap everything in None records) and a
// packet-level surface for control traffic; all inbound control records
// are handled inside read, invisibly to the caller.
//
// The reading side is single-consumer by contract: exactly one task
// drives read. Writes may come from any number of tasks.
pub struct Conn {
    sock: TcpStream,
    rx: DirectionKeys,
    rbuf: Vec<u8>,
    wire: Arc<WireWriter>,

    kex: KexAlg,
    cipher: CipherAlg,
    hmac: HmacAlg,
    peer_opts: u32,
    is_client: bool,

    status: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    // the peer sent its final ExitStatus (or a clean EOF)
    remote_done: bool,
    // cleared by a truncated control op: later mismatches are logged only
    hmac_strict: bool,

    winch_tx: Sender<WinSize>,
    winch_rx: Receiver<WinSize>,

    chaff: Arc<ChaffCtl>,
    tunnels: TunnelMux,
}

impl Conn {
    // dial opens the raw transport and runs the client side of the
    // algorithm negotiation and key exchange.
    pub fn dial<A: ToSocketAddrs>(addr: A, params: &ClientParams) -> Result<Conn, ConnError> {
        let mut sock = TcpStream::connect(addr)?;
        let _ = sock.set_nodelay(true);
        let (tx, rx, peer_opts) = handshake::client_handshake(&mut sock, params)?;
        let conn = Conn::from_parts(
            sock,
            tx,
            rx,
            params.kex,
            params.cipher,
            params.hmac,
            peer_opts,
            true,
        )?;
        Ok(conn)
    }

    fn from_parts(
        sock: TcpStream,
        tx: DirectionKeys,
        rx: DirectionKeys,
        kex: KexAlg,
        cipher: CipherAlg,
        hmac: HmacAlg,
        peer_opts: u32,
        is_client: bool,
    ) -> io::Result<Conn> {
        let wsock = sock.try_clone()?;
        let wire = Arc::new(WireWriter::new(wsock, tx));
        let closed = Arc::new(AtomicBool::new(false));

        let chaff_ctl = Arc::new(ChaffCtl::new());
        let _ = chaff::spawn(wire.clone(), chaff_ctl.clone());

        let tunnels = TunnelMux::new(wire.clone(), closed.clone());
        let (winch_tx, winch_rx) = unbounded();

        Ok(Conn {
            sock: sock,
            rx: rx,
            rbuf: Vec::new(),
            wire: wire,
            kex: kex,
            cipher: cipher,
            hmac: hmac,
            peer_opts: peer_opts,
            is_client: is_client,
            status: Arc::new(AtomicU32::new(status::STILL_OPEN)),
            closed: closed,
            remote_done: false,
            hmac_strict: true,
            winch_tx: winch_tx,
            winch_rx: winch_rx,
            chaff: chaff_ctl,
            tunnels: tunnels,
        })
    }

    pub fn kex_alg(&self) -> KexAlg {
        self.kex
    }

    pub fn cipher_alg(&self) -> CipherAlg {
        self.cipher
    }

    pub fn hmac_alg(&self) -> HmacAlg {
        self.hmac
    }

    // peer_opts is the peer's opaque extension word from the handshake.
    pub fn peer_opts(&self) -> u32 {
        self.peer_opts
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(dur)
    }

    // write_packet is the packet-level API: one record with the given
    // opcode. Returns the number of data bytes accepted.
    pub fn write_packet(&self, op: Opcode, data: &[u8]) -> io::Result<usize> {
        self.wire.write_packet(op, data)
    }

    pub fn send_term_size(&self, rows: u16, cols: u16) -> io::Result<()> {
        let text = format!("{} {}", rows, cols);
        self.wire.write_packet(Opcode::TermSize, text.as_bytes())?;
        Ok(())
    }

    // window_changes yields one WinSize per received TermSize record.
    pub fn window_changes(&self) -> Receiver<WinSize> {
        self.winch_rx.clone()
    }

    pub fn set_status(&self, code: u32) {
        self.status.store(code, Ordering::SeqCst);
    }

    pub fn close_status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    // --- chaff controls ---

    pub fn setup_chaff(&self, params: ChaffParams) {
        *self.chaff.params.lock().unwrap() = params;
    }

    pub fn enable_chaff(&self) {
        debug!("chaff enabled");
        self.chaff.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable_chaff(&self) {
        debug!("chaff disabled");
        self.chaff.enabled.store(false, Ordering::Relaxed);
    }

    pub fn shutdown_chaff(&self) {
        self.chaff.enabled.store(false, Ordering::Relaxed);
        self.chaff.shutdown.store(true, Ordering::Relaxed);
    }

    // --- tunnel controls ---

    // add_client_tunnel binds lport (0 picks a free port, which is
    // returned) and forwards accepted connections to rport on the peer's
    // loopback.
    pub fn add_client_tunnel(&self, lport: u16, rport: u16) -> io::Result<u16> {
        if !self.is_client {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tunnels originate on the dialing side",
            ));
        }
        self.tunnels.open_client(lport, rport)
    }

    pub fn tunnel_probe(&self) -> TunnelProbe {
        self.tunnels.probe()
    }

    pub fn set_tunnel_stale_ticks(&self, ticks: u32) {
        self.tunnels.set_stale_ticks(ticks);
    }

    pub fn pause_tunnel_keepalives(&self, paused: bool) {
        self.tunnels.pause_keepalives(paused);
    }

    // close sends the final ExitStatus record carrying the current close
    // status, quiesces chaff first, and shuts the raw transport down.
    // Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disable_chaff();

        let mut code = [0; 4];
        BigEndian::write_u32(&mut code, self.status.load(Ordering::SeqCst));
        let _ = self.wire.write_packet(Opcode::ExitStatus, &code);
        let _ = self.wire.flush();

        self.shutdown_chaff();
        let _ = self.sock.shutdown(Shutdown::Both);
        debug!("connection closed, status {}", self.status.load(Ordering::SeqCst));
    }

    fn abort_transport(&self, code: u32) {
        self.status.store(code, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown_chaff();
        let _ = self.sock.shutdown(Shutdown::Both);
    }

    // pump reads and dispatches exactly one record.
    fn pump(&mut self) -> Result<(), ConnError> {
        let pkt = match packet::open_packet(&mut self.rx, &mut self.sock) {
            Ok(pkt) => pkt,
            Err(PacketError::RemoteIntegrity) => {
                warn!("peer reported record tampering, closing");
                self.abort_transport(status::INTEGRITY_FAILED);
                return Err(ConnError::Tampered);
            }
            Err(PacketError::Oversize(len)) => {
                self.abort_transport(status::INTEGRITY_FAILED);
                return Err(ConnError::Corrupt(format!("payload length {}", len)));
            }
            Err(PacketError::BadPad) => {
                self.abort_transport(status::INTEGRITY_FAILED);
                return Err(ConnError::Corrupt(String::from("pad header")));
            }
            Err(PacketError::Io(e)) => return Err(ConnError::Io(e)),
        };
        self.dispatch(pkt)
    }

    fn dispatch(&mut self, pkt: OpenedPacket) -> Result<(), ConnError> {
        match Opcode::from_u8(pkt.op) {
            Some(Opcode::None) => self.rbuf.extend_from_slice(&pkt.data),
            Some(Opcode::HmacInvalid) => {
                // open_packet short-circuits on this opcode; a payload
                // that decrypts to it is equally fatal
                self.abort_transport(status::INTEGRITY_FAILED);
                return Err(ConnError::Tampered);
            }
            Some(Opcode::TermSize) => self.on_term_size(&pkt.data),
            Some(Opcode::ExitStatus) => {
                if pkt.data.len() < 4 {
                    warn!("truncated ExitStatus record ({} bytes)", pkt.data.len());
                    self.status.store(status::TRUNCATED_OP, Ordering::SeqCst);
                    self.hmac_strict = false;
                } else {
                    let code = BigEndian::read_u32(&pkt.data[..4]);
                    debug!("peer exit status {}", code);
                    self.status.store(code, Ordering::SeqCst);
                }
                self.remote_done = true;
            }
            Some(Opcode::Chaff) => debug!("chaff: {} bytes discarded", pkt.data.len()),
            Some(Opcode::TunSetup) if !self.is_client => match tunnel::split_ports(&pkt.data) {
                Some((lport, rport, _)) => self.tunnels.on_setup(lport, rport),
                None => warn!("short TunSetup payload"),
            },
            Some(Opcode::TunSetupAck) if self.is_client => {
                if let Some((_, rport, _)) = tunnel::split_ports(&pkt.data) {
                    self.tunnels.on_setup_ack(rport);
                }
            }
            Some(Opcode::TunRefused) if self.is_client => {
                if let Some((_, rport, _)) = tunnel::split_ports(&pkt.data) {
                    self.tunnels.on_refused(rport);
                }
            }
            Some(Opcode::TunDisconn) if self.is_client => {
                if let Some((_, rport, _)) = tunnel::split_ports(&pkt.data) {
                    self.tunnels.on_disconn(rport);
                }
            }
            Some(Opcode::TunHangup) if !self.is_client => {
                if let Some((_, rport, _)) = tunnel::split_ports(&pkt.data) {
                    self.tunnels.on_hangup(rport);
                }
            }
            Some(Opcode::TunData) => match tunnel::split_ports(&pkt.data) {
                Some((_, rport, bytes)) => self.tunnels.on_data(rport, bytes.to_vec()),
                None => warn!("short TunData payload"),
            },
            Some(Opcode::TunKeepAlive) => self.tunnels.on_keepalive(),
            Some(op) => warn!("opcode {:?} out of role, ignored", op),
            None => warn!("unknown opcode {:#04x} ignored", pkt.op),
        }

        if !pkt.mac_ok {
            if self.hmac_strict {
                warn!("running hmac mismatch, notifying peer and closing");
                let _ = self.wire.write_packet(Opcode::HmacInvalid, &[0]);
                let _ = self.wire.flush();
                self.abort_transport(status::INTEGRITY_FAILED);
                return Err(ConnError::Integrity);
            }
            // the stream already produced a truncated control op; keep
            // going but leave a trace
            warn!("running hmac mismatch tolerated on degraded stream");
        }
        Ok(())
    }

    fn on_term_size(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let mut it = text.split_whitespace();
        let rows = it.next().and_then(|v| v.parse().ok());
        let cols = it.next().and_then(|v| v.parse().ok());
        match (rows, cols) {
            (Some(rows), Some(cols)) => {
                let _ = self.winch_tx.send(WinSize { rows: rows, cols: cols });
            }
            _ => warn!("unparseable TermSize record: {:?}", text),
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            r#"
        kex:    {}
        cipher: {}
        hmac:   {}
        status: {}
        "#,
            self.kex,
            self.cipher,
            self.hmac,
            self.status.load(Ordering::SeqCst),
        )
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.rbuf.is_empty() {
            if self.remote_done || self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.pump() {
                Ok(()) => (),
                Err(ConnError::Io(e)) => {
                    // a peer reset at a record boundary is a normal end
                    // of stream for an interactive session
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        self.remote_done = true;
                        return Ok(0);
                    }
                    return Err(e);
                }
                Err(other) => return Err(other.into()),
            }
        }
        let n = buf.len().min(self.rbuf.len());
        buf[..n].copy_from_slice(&self.rbuf[..n]);
        self.rbuf.drain(..n);
        Ok(n)
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ));
        }
        self.wire.write_packet(Opcode::None, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.wire.flush()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

// Listener accepts secured connections, applying the server's three
// allow-lists to every proposal. A denied or failed handshake surfaces as
// an error from accept and the raw transport is dropped.
pub struct Listener {
    inner: TcpListener,
    policy: AcceptPolicy,
    opts: u32,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(addr: A, policy: AcceptPolicy) -> io::Result<Listener> {
        Ok(Listener {
            inner: TcpListener::bind(addr)?,
            policy: policy,
            opts: 0,
        })
    }

    pub fn set_opts(&mut self, opts: u32) {
        self.opts = opts;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn accept(&self) -> Result<Conn, ConnError> {
        let (mut sock, peer) = self.inner.accept()?;
        debug!("accepted raw transport from {}", peer);
        let _ = sock.set_nodelay(true);

        let (tx, rx, negotiated) =
            handshake::server_handshake(&mut sock, &self.policy, self.opts)?;
        let conn = Conn::from_parts(
            sock,
            tx,
            rx,
            negotiated.kex,
            negotiated.cipher,
            negotiated.hmac,
            negotiated.peer_opts,
            false,
        )?;
        Ok(conn)
    }
}
