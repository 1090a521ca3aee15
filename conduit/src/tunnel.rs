use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, select, Receiver, SendTimeoutError, Sender};
use log::{debug, info, warn};
use rand::{thread_rng, Rng};

use crate::conn::WireWriter;
use crate::packet::Opcode;

// bounded socket deadline for tunnel workers: responsiveness to the
// liveness flag without busy looping
const POLL: Duration = Duration::from_millis(200);

const KEEPALIVE_BASE_MS: u64 = 2000;
const KEEPALIVE_JITTER_MS: u64 = 500;

const WATCHDOG_TICK: Duration = Duration::from_millis(500);
const DEFAULT_STALE_TICKS: u32 = 10;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

// one-byte commands on the endpoint control channel
const CTL_REFUSED: u8 = b'r';
const CTL_DISCONN: u8 = b'd';
const CTL_HANGUP: u8 = b'h';

#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) enum Role {
    Client,
    Server,
}

// Endpoint is one entry of the tunnel table, keyed by remote port. The
// data channel is deliberately capacity 1: a slow consumer blocks the
// producer instead of queueing without bound.
#[derive(Clone)]
pub(crate) struct Endpoint {
    lport: u16,
    rport: u16,
    data_tx: Sender<Vec<u8>>,
    data_rx: Receiver<Vec<u8>>,
    ctl_tx: Sender<u8>,
    ctl_rx: Receiver<u8>,
    dead: Arc<AtomicBool>,
    established: Arc<AtomicBool>,
    idle_ticks: Arc<AtomicU32>,
}

impl Endpoint {
    fn new(lport: u16, rport: u16) -> Self {
        let (data_tx, data_rx) = bounded(1);
        let (ctl_tx, ctl_rx) = bounded(4);
        Endpoint {
            lport: lport,
            rport: rport,
            data_tx: data_tx,
            data_rx: data_rx,
            ctl_tx: ctl_tx,
            ctl_rx: ctl_rx,
            dead: Arc::new(AtomicBool::new(false)),
            established: Arc::new(AtomicBool::new(false)),
            idle_ticks: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn mark_dead(&self, why: u8) {
        self.dead.store(true, Ordering::SeqCst);
        let _ = self.ctl_tx.try_send(why);
    }

    fn wire_header(&self) -> [u8; 4] {
        ports_header(self.lport, self.rport)
    }

    // same_entry tells whether a table slot still holds this endpoint or
    // a replacement from a newer local connection
    fn same_entry(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.dead, &other.dead)
    }
}

pub(crate) fn ports_header(lport: u16, rport: u16) -> [u8; 4] {
    let mut hdr = [0; 4];
    BigEndian::write_u16(&mut hdr[..2], lport);
    BigEndian::write_u16(&mut hdr[2..], rport);
    hdr
}

// split_ports strips the lport/rport header off a tunnel control payload.
pub(crate) fn split_ports(data: &[u8]) -> Option<(u16, u16, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let lport = BigEndian::read_u16(&data[..2]);
    let rport = BigEndian::read_u16(&data[2..4]);
    Some((lport, rport, &data[4..]))
}

// TunnelProbe is a read-only view of the tunnel table for callers that
// moved the connection into its read pump.
#[derive(Clone)]
pub struct TunnelProbe {
    table: Arc<Mutex<HashMap<u16, Endpoint>>>,
}

impl TunnelProbe {
    pub fn contains(&self, rport: u16) -> bool {
        self.table.lock().unwrap().contains_key(&rport)
    }

    pub fn dead(&self, rport: u16) -> Option<bool> {
        self.table.lock().unwrap().get(&rport).map(Endpoint::is_dead)
    }

    pub fn established(&self, rport: u16) -> Option<bool> {
        self.table
            .lock()
            .unwrap()
            .get(&rport)
            .map(|ep| ep.established.load(Ordering::SeqCst))
    }
}

// TunnelMux owns the tunnel table of one connection and the two periodic
// workers around it: the client-side keep-alive emitter and the
// server-side stale-endpoint watchdog.
#[derive(Clone)]
pub(crate) struct TunnelMux {
    wire: Arc<WireWriter>,
    table: Arc<Mutex<HashMap<u16, Endpoint>>>,
    closed: Arc<AtomicBool>,
    stale_ticks: Arc<AtomicU32>,
    keepalive_paused: Arc<AtomicBool>,
    keepalive_running: Arc<AtomicBool>,
    watchdog_running: Arc<AtomicBool>,
}

impl TunnelMux {
    pub(crate) fn new(wire: Arc<WireWriter>, closed: Arc<AtomicBool>) -> Self {
        TunnelMux {
            wire: wire,
            table: Arc::new(Mutex::new(HashMap::new())),
            closed: closed,
            stale_ticks: Arc::new(AtomicU32::new(DEFAULT_STALE_TICKS)),
            keepalive_paused: Arc::new(AtomicBool::new(false)),
            keepalive_running: Arc::new(AtomicBool::new(false)),
            watchdog_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn probe(&self) -> TunnelProbe {
        TunnelProbe { table: self.table.clone() }
    }

    pub(crate) fn set_stale_ticks(&self, ticks: u32) {
        self.stale_ticks.store(ticks.max(1), Ordering::SeqCst);
    }

    pub(crate) fn pause_keepalives(&self, paused: bool) {
        self.keepalive_paused.store(paused, Ordering::SeqCst);
    }

    // open_client binds the local listener side of a tunnel spec and
    // starts its accept worker. Returns the actual bound port so callers
    // may pass 0.
    pub(crate) fn open_client(&self, lport: u16, rport: u16) -> io::Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", lport))?;
        let bound = listener.local_addr()?.port();
        info!("tunnel {}:{} listening", bound, rport);

        self.start_keepalive();

        let mux = self.clone();
        let _ = thread::spawn(move || client_accept_loop(mux, listener, bound, rport));
        Ok(bound)
    }

    // start_keepalive runs once per connection: roughly every two seconds
    // with jitter, tell the peer our tunnels are alive.
    fn start_keepalive(&self) {
        if self.keepalive_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mux = self.clone();
        let _ = thread::spawn(move || loop {
            let jitter = thread_rng().gen_range(0..KEEPALIVE_JITTER_MS);
            thread::sleep(Duration::from_millis(KEEPALIVE_BASE_MS + jitter));
            if mux.closed.load(Ordering::SeqCst) {
                break;
            }
            if mux.keepalive_paused.load(Ordering::SeqCst) {
                continue;
            }
            if mux.wire.write_packet(Opcode::TunKeepAlive, &[0, 0]).is_err() {
                break;
            }
        });
    }

    // start_watchdog runs once per server connection: tick the endpoint
    // counters and tear down the ones the client stopped refreshing.
    fn start_watchdog(&self) {
        if self.watchdog_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mux = self.clone();
        let _ = thread::spawn(move || loop {
            thread::sleep(WATCHDOG_TICK);
            if mux.closed.load(Ordering::SeqCst) {
                break;
            }
            let stale = mux.stale_ticks.load(Ordering::SeqCst);
            let mut reap = Vec::new();
            {
                let table = mux.table.lock().unwrap();
                for (rport, ep) in table.iter() {
                    if ep.is_dead() {
                        continue;
                    }
                    let ticks = ep.idle_ticks.fetch_add(1, Ordering::SeqCst) + 1;
                    if ticks > stale {
                        reap.push((*rport, ep.clone()));
                    }
                }
            }
            for (rport, ep) in reap {
                info!("tunnel to {} stale, tearing down", rport);
                ep.mark_dead(CTL_DISCONN);
                let _ = mux.wire.write_packet(Opcode::TunDisconn, &ep.wire_header());
            }
        });
    }

    fn remove_entry(&self, rport: u16, ep: &Endpoint) {
        let mut table = self.table.lock().unwrap();
        if let Some(current) = table.get(&rport) {
            if current.same_entry(ep) {
                table.remove(&rport);
                debug!("tunnel entry for {} removed", rport);
            }
        }
    }

    // --- receive-path handlers, called from the connection read loop ---

    // on_setup handles the server side of a client's TunSetup: dial the
    // target on loopback, then either refuse or ack and start the worker
    // pair.
    pub(crate) fn on_setup(&self, lport: u16, rport: u16) {
        self.start_watchdog();

        let addr = SocketAddr::from(([127, 0, 0, 1], rport));
        let sock = match TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("tunnel dial {} refused: {}", addr, e);
                let _ = self
                    .wire
                    .write_packet(Opcode::TunRefused, &ports_header(lport, rport));
                return;
            }
        };

        let ep = Endpoint::new(lport, rport);
        ep.established.store(true, Ordering::SeqCst);
        self.table.lock().unwrap().insert(rport, ep.clone());

        if self
            .wire
            .write_packet(Opcode::TunSetupAck, &ep.wire_header())
            .is_err()
        {
            self.remove_entry(rport, &ep);
            return;
        }

        let mux = self.clone();
        let _ = thread::spawn(move || {
            serve_stream(&mux, &ep, sock, Role::Server);
            mux.remove_entry(rport, &ep);
        });
    }

    pub(crate) fn on_setup_ack(&self, rport: u16) {
        match self.table.lock().unwrap().get(&rport) {
            Some(ep) => ep.established.store(true, Ordering::SeqCst),
            None => debug!("ack for unknown tunnel {}", rport),
        }
    }

    pub(crate) fn on_refused(&self, rport: u16) {
        warn!("tunnel to {} refused by remote", rport);
        self.mark_dead(rport, CTL_REFUSED);
    }

    pub(crate) fn on_disconn(&self, rport: u16) {
        debug!("tunnel to {} disconnected by remote", rport);
        self.mark_dead(rport, CTL_DISCONN);
    }

    pub(crate) fn on_hangup(&self, rport: u16) {
        debug!("tunnel to {} hung up by remote", rport);
        self.mark_dead(rport, CTL_HANGUP);
    }

    // on_data delivers tunnel payload into the endpoint's data channel,
    // blocking (in poll steps) while the consumer is behind.
    pub(crate) fn on_data(&self, rport: u16, data: Vec<u8>) {
        let ep = match self.table.lock().unwrap().get(&rport) {
            Some(ep) => ep.clone(),
            None => {
                debug!("data for unknown tunnel {}", rport);
                return;
            }
        };

        ep.idle_ticks.store(0, Ordering::SeqCst);

        let mut data = data;
        loop {
            if ep.is_dead() {
                return;
            }
            match ep.data_tx.send_timeout(data, POLL) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => data = back,
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    pub(crate) fn on_keepalive(&self) {
        for ep in self.table.lock().unwrap().values() {
            ep.idle_ticks.store(0, Ordering::SeqCst);
        }
    }

    fn mark_dead(&self, rport: u16, why: u8) {
        if let Some(ep) = self.table.lock().unwrap().get(&rport) {
            ep.mark_dead(why);
        }
    }
}

fn client_accept_loop(mux: TunnelMux, listener: TcpListener, lport: u16, rport: u16) {
    loop {
        if mux.closed.load(Ordering::SeqCst) {
            break;
        }
        let (sock, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("tunnel {} accept failed: {}", lport, e);
                break;
            }
        };
        debug!("tunnel {}:{} accepted {}", lport, rport, peer);

        let ep = Endpoint::new(lport, rport);
        mux.table.lock().unwrap().insert(rport, ep.clone());

        if mux
            .wire
            .write_packet(Opcode::TunSetup, &ep.wire_header())
            .is_err()
        {
            break;
        }

        // one local stream at a time per tunnel spec; the next accept
        // re-establishes after this stream winds down
        serve_stream(&mux, &ep, sock, Role::Client);
        mux.remove_entry(rport, &ep);
    }
    debug!("tunnel {}:{} accept worker exits", lport, rport);
}

// serve_stream runs the worker pair for one local socket: outbound moves
// socket bytes into TunData records, inbound moves the data channel back
// into the socket. Both watch the liveness flag on POLL boundaries.
fn serve_stream(mux: &TunnelMux, ep: &Endpoint, sock: TcpStream, role: Role) {
    let _ = sock.set_nodelay(true);
    let _ = sock.set_read_timeout(Some(POLL));
    let _ = sock.set_write_timeout(Some(POLL));

    let reader = match sock.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            warn!("tunnel socket clone failed: {}", e);
            ep.mark_dead(CTL_HANGUP);
            return;
        }
    };

    let wire = mux.wire.clone();
    let out_ep = ep.clone();
    let outbound = thread::spawn(move || outbound_worker(wire, out_ep, reader, role));

    inbound_worker(ep, sock);
    let _ = outbound.join();
}

fn outbound_worker(wire: Arc<WireWriter>, ep: Endpoint, mut sock: TcpStream, role: Role) {
    let eof_op = match role {
        Role::Client => Opcode::TunHangup,
        Role::Server => Opcode::TunDisconn,
    };
    let ctl = match role {
        Role::Client => CTL_HANGUP,
        Role::Server => CTL_DISCONN,
    };

    let mut buf = [0; 4096];
    loop {
        if ep.is_dead() {
            break;
        }
        match sock.read(&mut buf) {
            Ok(0) => {
                let _ = wire.write_packet(eof_op, &ep.wire_header());
                ep.mark_dead(ctl);
                break;
            }
            Ok(n) => {
                let mut payload = Vec::with_capacity(4 + n);
                payload.extend_from_slice(&ep.wire_header());
                payload.extend_from_slice(&buf[..n]);
                if wire.write_packet(Opcode::TunData, &payload).is_err() {
                    ep.mark_dead(ctl);
                    break;
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => {
                let _ = wire.write_packet(eof_op, &ep.wire_header());
                ep.mark_dead(ctl);
                break;
            }
        }
    }
}

fn inbound_worker(ep: &Endpoint, mut sock: TcpStream) {
    let data_rx = &ep.data_rx;
    let ctl_rx = &ep.ctl_rx;
    loop {
        select! {
            recv(data_rx) -> msg => match msg {
                Ok(bytes) => {
                    if write_with_poll(&mut sock, &bytes, ep).is_err() {
                        // local writer is gone; outbound notices the same
                        // socket and reports upstream
                        ep.mark_dead(CTL_HANGUP);
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(ctl_rx) -> _ => break,
            default(POLL) => {
                if ep.is_dead() {
                    break;
                }
            }
        }
    }
}

fn write_with_poll(sock: &mut TcpStream, buf: &[u8], ep: &Endpoint) -> io::Result<()> {
    let mut off = 0;
    while off < buf.len() {
        if ep.is_dead() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel endpoint dead",
            ));
        }
        match sock.write(&buf[off..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "tunnel socket write stalled",
                ))
            }
            Ok(n) => off += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
