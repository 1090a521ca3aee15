use std::io::{self, Read};
use std::{error, fmt};

use byteorder::{BigEndian, ByteOrder};
use rand::{thread_rng, Rng, RngCore};

use crate::crypto::DirectionKeys;

// MAX_PAYLOAD_LEN bounds the encrypted payload of a single record. A
// length field beyond it is treated as stream corruption, not as a large
// record.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

// MAX_DATA_LEN is the largest data slice carried in one record: the
// payload adds the two pad header bytes and at most a full pad block on
// top of the data, so the write path splits anything bigger into
// consecutive records.
pub const MAX_DATA_LEN: usize = MAX_PAYLOAD_LEN as usize - 64;

// Padding block bounds. The pad block size is drawn uniformly from
// [PAD_BLOCK_MIN, PAD_BLOCK_MAX] per record, so the pad length lands in
// [0, PAD_BLOCK_MAX - 1].
const PAD_BLOCK_MIN: usize = 16;
const PAD_BLOCK_MAX: usize = 32;

// Opcode tags every record on the wire. Data records carry None; the rest
// are in-band control. Tunnel opcodes start at 16, leaving the low space
// reserved for session-lifecycle additions.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Opcode {
    None = 0,
    HmacInvalid = 1,
    TermSize = 2,
    ExitStatus = 3,
    Chaff = 4,
    TunSetup = 16,
    TunSetupAck = 17,
    TunRefused = 18,
    TunData = 19,
    TunDisconn = 20,
    TunHangup = 21,
    TunKeepAlive = 22,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use self::Opcode::*;

        match v {
            0 => Some(None),
            1 => Some(HmacInvalid),
            2 => Some(TermSize),
            3 => Some(ExitStatus),
            4 => Some(Chaff),
            16 => Some(TunSetup),
            17 => Some(TunSetupAck),
            18 => Some(TunRefused),
            19 => Some(TunData),
            20 => Some(TunDisconn),
            21 => Some(TunHangup),
            22 => Some(TunKeepAlive),
            _ => Option::None,
        }
    }
}

#[derive(Debug)]
pub enum PacketError {
    Io(io::Error),
    // the peer told us it detected tampering on its read side
    RemoteIntegrity,
    Oversize(u32),
    BadPad,
}

impl error::Error for PacketError {
    fn cause(&self) -> Option<&dyn error::Error> {
        use self::PacketError::*;

        match self {
            Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::PacketError::*;

        match self {
            Io(e) => write!(f, "io error: {}", e),
            RemoteIntegrity => write!(f, "remote detected tampering"),
            &Oversize(len) => write!(f, "payload length {} exceeds limit", len),
            BadPad => write!(f, "malformed pad header"),
        }
    }
}

impl From<io::Error> for PacketError {
    fn from(e: io::Error) -> Self {
        PacketError::Io(e)
    }
}

// seal_packet assembles one complete wire frame:
//
//   opcode(1) || hmacPrefix(4) || payloadLen(4, BE) || ciphertext
//
// The plaintext payload is [padSide][padLen] followed by pad||data or
// data||pad. The running write HMAC absorbs the opcode byte and the whole
// plaintext before encryption; its 4-byte prefix travels in the header.
// The caller writes the returned buffer with a single call under the
// write mutex, so concurrent writers cannot tear a header.
pub fn seal_packet(keys: &mut DirectionKeys, op: u8, data: &[u8]) -> Vec<u8> {
    let mut rng = thread_rng();

    let pad_block = rng.gen_range(PAD_BLOCK_MIN..=PAD_BLOCK_MAX);
    let mut pad_len = pad_block - data.len() % pad_block;
    if pad_len == pad_block {
        // data already block-aligned: the header alone marks the record
        pad_len = 0;
    }
    let pad_side: u8 = rng.gen_range(0..=1);

    let mut plain = Vec::with_capacity(2 + pad_len + data.len());
    plain.push(pad_side);
    plain.push(pad_len as u8);

    let mut pad = vec![0; pad_len];
    rng.fill_bytes(&mut pad);
    if pad_side == 0 {
        plain.extend_from_slice(&pad);
        plain.extend_from_slice(data);
    } else {
        plain.extend_from_slice(data);
        plain.extend_from_slice(&pad);
    }

    keys.hmac.update(&[op]);
    keys.hmac.update(&plain);
    let prefix = keys.hmac.prefix4();

    keys.cipher.apply(&mut plain);

    let mut frame = Vec::with_capacity(9 + plain.len());
    frame.push(op);
    frame.extend_from_slice(&prefix);
    let mut len = [0; 4];
    BigEndian::write_u32(&mut len, plain.len() as u32);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(&plain);
    frame
}

// OpenedPacket is one received record after decryption and pad stripping.
// The integrity verdict is reported rather than enforced here: dispatch
// happens first, and the connection decides how to react to a mismatch
// (strict close, or tolerated after a truncated control op).
pub struct OpenedPacket {
    pub op: u8,
    pub data: Vec<u8>,
    pub mac_ok: bool,
}

// open_packet reads exactly one frame from the stream. A HmacInvalid
// opcode byte short-circuits before any further read: the peer is
// reporting tampering and the channel is done.
pub fn open_packet<R: Read>(
    keys: &mut DirectionKeys,
    r: &mut R,
) -> Result<OpenedPacket, PacketError> {
    let mut op = [0; 1];
    r.read_exact(&mut op)?;
    if op[0] == Opcode::HmacInvalid as u8 {
        return Err(PacketError::RemoteIntegrity);
    }

    let mut header = [0; 8];
    r.read_exact(&mut header)?;
    let mut hmac_in = [0; 4];
    hmac_in.copy_from_slice(&header[..4]);
    let payload_len = BigEndian::read_u32(&header[4..]);

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(PacketError::Oversize(payload_len));
    }
    if payload_len < 2 {
        return Err(PacketError::BadPad);
    }

    let mut plain = vec![0; payload_len as usize];
    r.read_exact(&mut plain)?;
    keys.cipher.apply(&mut plain);
    keys.hmac.update(&op);
    keys.hmac.update(&plain);

    let pad_side = plain[0];
    let pad_len = plain[1] as usize;
    if pad_side > 1 || pad_len >= PAD_BLOCK_MAX || 2 + pad_len > plain.len() {
        return Err(PacketError::BadPad);
    }

    let data = if pad_side == 0 {
        plain[2 + pad_len..].to_vec()
    } else {
        plain[2..plain.len() - pad_len].to_vec()
    };

    let mac_ok = keys.hmac.prefix4() == hmac_in;
    Ok(OpenedPacket { op: op[0], data: data, mac_ok: mac_ok })
}
