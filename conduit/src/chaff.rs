use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use rand::{thread_rng, Rng, RngCore};

use crate::conn::WireWriter;
use crate::packet::Opcode;

// ChaffParams shapes the cover traffic: one packet of random size up to
// size_max every rand[msecs_min, msecs_max) milliseconds.
#[derive(Copy, Clone, Debug)]
pub struct ChaffParams {
    pub msecs_min: u64,
    pub msecs_max: u64,
    pub size_max: usize,
}

impl Default for ChaffParams {
    fn default() -> Self {
        ChaffParams {
            msecs_min: 100,
            msecs_max: 5000,
            size_max: 64,
        }
    }
}

pub(crate) struct ChaffCtl {
    pub(crate) enabled: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) params: Mutex<ChaffParams>,
}

impl ChaffCtl {
    pub(crate) fn new() -> Self {
        ChaffCtl {
            enabled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            params: Mutex::new(ChaffParams::default()),
        }
    }
}

// spawn starts the connection's chaff worker. The worker exists for the
// whole connection lifetime and idles while disabled; shutdown_chaff (or
// a dead transport) terminates it.
pub(crate) fn spawn(wire: Arc<WireWriter>, ctl: Arc<ChaffCtl>) -> thread::JoinHandle<()> {
    thread::spawn(move || worker(wire, ctl))
}

fn worker(wire: Arc<WireWriter>, ctl: Arc<ChaffCtl>) {
    loop {
        let params = *ctl.params.lock().unwrap();
        let ceiling = params.msecs_max.max(params.msecs_min + 1);
        let msecs = thread_rng().gen_range(params.msecs_min..ceiling);
        thread::sleep(Duration::from_millis(msecs));

        if ctl.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if !ctl.enabled.load(Ordering::Relaxed) {
            continue;
        }

        let size = thread_rng().gen_range(1..=params.size_max.max(1));
        let mut buf = vec![0; size];
        thread_rng().fill_bytes(&mut buf);

        match wire.write_packet(Opcode::Chaff, &buf) {
            Ok(_) => trace!("chaff: {} bytes after {} ms", size, msecs),
            // transport is gone, nothing left to cover
            Err(_) => break,
        }
    }
    debug!("chaff worker exits");
}
