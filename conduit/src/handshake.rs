use std::io::{Read, Write};
use std::{error, fmt, io};

use log::debug;

use kex::{KexAlg, KexError};

use crate::alg::{pack_cipheropts, unpack_cipheropts, AcceptPolicy, CipherAlg, HmacAlg};
use crate::crypto::{derive_pair, DirectionKeys};
use crate::status;

// a handshake line may carry a hex-encoded KyberKEM-1024 blob, nothing
// legitimate is longer
const MAX_LINE: usize = 8192;

// ClientParams selects the algorithms the client proposes. The server
// either accepts the proposal as-is or drops the connection; there is no
// renegotiation.
#[derive(Copy, Clone, Debug)]
pub struct ClientParams {
    pub kex: KexAlg,
    pub cipher: CipherAlg,
    pub hmac: HmacAlg,
    // opaque word handed to the peer application, not interpreted here
    pub opts: u32,
}

impl Default for ClientParams {
    fn default() -> Self {
        ClientParams {
            kex: KexAlg::X25519,
            cipher: CipherAlg::Aes256Ctr,
            hmac: HmacAlg::Sha256,
            opts: 0,
        }
    }
}

// Negotiated is what the server learned from a completed handshake.
#[derive(Copy, Clone, Debug)]
pub struct Negotiated {
    pub kex: KexAlg,
    pub cipher: CipherAlg,
    pub hmac: HmacAlg,
    pub peer_opts: u32,
}

#[derive(Debug)]
pub enum HandshakeError {
    Io(io::Error),
    Kex(KexError),
    DeniedKex(u8),
    DeniedCipher(u8),
    DeniedHmac(u8),
    Malformed(String),
}

impl HandshakeError {
    // close_status is the code the dropped connection is accounted for
    // with: a rejected proposal maps onto the denied-algorithm space,
    // other failures carry no status of their own.
    pub fn close_status(&self) -> Option<u32> {
        use self::HandshakeError::*;

        match self {
            DeniedKex(_) => Some(status::KEX_DENIED),
            DeniedCipher(_) => Some(status::CIPHER_DENIED),
            DeniedHmac(_) => Some(status::HMAC_DENIED),
            _ => None,
        }
    }
}

impl error::Error for HandshakeError {
    fn cause(&self) -> Option<&dyn error::Error> {
        use self::HandshakeError::*;

        match self {
            Io(e) => Some(e),
            Kex(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::HandshakeError::*;

        match self {
            Io(e) => write!(f, "io error: {}", e),
            Kex(e) => write!(f, "kex failure: {}", e),
            &DeniedKex(id) => write!(f, "kex algorithm {:#04x} denied", id),
            &DeniedCipher(id) => write!(f, "cipher algorithm {:#04x} denied", id),
            &DeniedHmac(id) => write!(f, "hmac algorithm {:#04x} denied", id),
            Malformed(msg) => write!(f, "malformed handshake: {}", msg),
        }
    }
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

impl From<KexError> for HandshakeError {
    fn from(e: KexError) -> Self {
        HandshakeError::Kex(e)
    }
}

// read_line consumes bytes up to a newline. Only used for the cleartext
// handshake phase; everything after key derivation reads exact lengths.
fn read_line<R: Read>(r: &mut R) -> Result<String, HandshakeError> {
    let mut line = Vec::new();
    let mut byte = [0; 1];
    loop {
        r.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(HandshakeError::Malformed(String::from("line too long")));
        }
    }
    String::from_utf8(line)
        .map_err(|_| HandshakeError::Malformed(String::from("non-utf8 handshake line")))
}

// KEX blobs travel as lowercase hex big integers: leading zero bytes are
// not transmitted, receivers left-pad back to the primitive's fixed size.
fn write_blob_line<W: Write>(w: &mut W, blob: &[u8]) -> io::Result<()> {
    let hex_part = match blob.iter().position(|&b| b != 0) {
        Some(i) => hex::encode(&blob[i..]),
        None => String::from("0"),
    };
    write!(w, "0x{}\n", hex_part)
}

fn decode_blob(line: &str, expected: usize) -> Result<Vec<u8>, HandshakeError> {
    let body = line
        .trim()
        .strip_prefix("0x")
        .ok_or_else(|| HandshakeError::Malformed(String::from("blob line missing 0x")))?;

    let padded;
    let body = if body.len() % 2 == 1 {
        padded = format!("0{}", body);
        &padded
    } else {
        body
    };

    let raw = hex::decode(body)
        .map_err(|_| HandshakeError::Malformed(String::from("blob line is not hex")))?;
    if raw.len() > expected {
        return Err(HandshakeError::Malformed(String::from("blob longer than expected")));
    }

    let mut blob = vec![0; expected - raw.len()];
    blob.extend_from_slice(&raw);
    Ok(blob)
}

fn write_opts_line<W: Write>(w: &mut W, cipheropts: u32, opts: u32) -> io::Result<()> {
    write!(w, "0x{:08x}:0x{:08x}\n", cipheropts, opts)
}

fn parse_opts_line(line: &str) -> Result<(u32, u32), HandshakeError> {
    let malformed = || HandshakeError::Malformed(String::from("bad opts line"));

    let mut parts = line.trim().splitn(2, ':');
    let left = parts.next().ok_or_else(malformed)?;
    let right = parts.next().ok_or_else(malformed)?;

    let parse = |s: &str| -> Result<u32, HandshakeError> {
        let s = s.strip_prefix("0x").ok_or_else(malformed)?;
        u32::from_str_radix(s, 16).map_err(|_| malformed())
    };

    Ok((parse(left)?, parse(right)?))
}

// client_handshake drives the initiator side over a fresh transport:
// the KEX identifier line, the initiator blob, the cipheropts line, then
// the responder's two lines, finishing with key derivation.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    params: &ClientParams,
) -> Result<(DirectionKeys, DirectionKeys, u32), HandshakeError> {
    write!(stream, "{:02x}\n", params.kex as u8)?;

    let (initiator, blob) = kex::Initiator::new(params.kex);
    write_blob_line(stream, &blob)?;
    write_opts_line(stream, pack_cipheropts(params.cipher, params.hmac), params.opts)?;
    stream.flush()?;

    let reply = decode_blob(&read_line(stream)?, params.kex.reply_blob_len())?;
    let (word, peer_opts) = parse_opts_line(&read_line(stream)?)?;

    // the server echoes the word it accepted; anything else means the
    // proposal did not survive
    match unpack_cipheropts(word) {
        Some((c, h)) if c == params.cipher && h == params.hmac => (),
        _ => {
            return Err(HandshakeError::Malformed(String::from(
                "server altered the negotiated cipheropts",
            )))
        }
    }

    let secret = initiator.finish(&reply)?;
    debug!("client handshake done: {} / {} / {}", params.kex, params.cipher, params.hmac);

    let (tx, rx) = derive_pair(secret.as_bytes(), params.cipher, params.hmac);
    Ok((tx, rx, peer_opts))
}

// server_handshake drives the responder side: parse and police the
// proposal against the three allow-lists, run the primitive, answer with
// the reply blob and the echoed cipheropts, derive keys. On a denied
// algorithm the caller simply drops the transport.
pub fn server_handshake<S: Read + Write>(
    stream: &mut S,
    policy: &AcceptPolicy,
    opts: u32,
) -> Result<(DirectionKeys, DirectionKeys, Negotiated), HandshakeError> {
    let line = read_line(stream)?;
    let id = u8::from_str_radix(line.trim(), 16)
        .map_err(|_| HandshakeError::Malformed(String::from("bad kex id line")))?;
    let alg = KexAlg::from_u8(id).ok_or(HandshakeError::DeniedKex(id))?;
    if !policy.permits_kex(alg) {
        return Err(HandshakeError::DeniedKex(id));
    }

    let blob = decode_blob(&read_line(stream)?, alg.initiator_blob_len())?;
    let (word, peer_opts) = parse_opts_line(&read_line(stream)?)?;

    let cipher_id = (word & 0xff) as u8;
    let cipher = CipherAlg::from_u8(cipher_id).ok_or(HandshakeError::DeniedCipher(cipher_id))?;
    if !policy.permits_cipher(cipher) {
        return Err(HandshakeError::DeniedCipher(cipher_id));
    }

    let hmac_id = ((word >> 8) & 0xff) as u8;
    let hmac = HmacAlg::from_u8(hmac_id).ok_or(HandshakeError::DeniedHmac(hmac_id))?;
    if !policy.permits_hmac(hmac) {
        return Err(HandshakeError::DeniedHmac(hmac_id));
    }

    let (reply, secret) = kex::respond(alg, &blob)?;
    write_blob_line(stream, &reply)?;
    write_opts_line(stream, pack_cipheropts(cipher, hmac), opts)?;
    stream.flush()?;

    debug!("server handshake done: {} / {} / {}", alg, cipher, hmac);

    let (tx, rx) = derive_pair(secret.as_bytes(), cipher, hmac);
    let negotiated = Negotiated {
        kex: alg,
        cipher: cipher,
        hmac: hmac,
        peer_opts: peer_opts,
    };
    Ok((tx, rx, negotiated))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use super::{
        client_handshake, decode_blob, parse_opts_line, server_handshake, write_blob_line,
        ClientParams, HandshakeError,
    };
    use crate::alg::{AcceptPolicy, CipherAlg, HmacAlg};
    use crate::packet::{open_packet, seal_packet, Opcode};
    use crate::status;
    use kex::KexAlg;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (join.join().unwrap(), server)
    }

    fn run(params: ClientParams, policy: AcceptPolicy) {
        let (mut client, mut server) = tcp_pair();

        let server_side = thread::spawn(move || server_handshake(&mut server, &policy, 0x77));
        let (mut ctx, mut crx, peer_opts) = client_handshake(&mut client, &params).unwrap();
        let (mut stx, mut srx, negotiated) = server_side.join().unwrap().unwrap();

        assert_eq!(peer_opts, 0x77);
        assert_eq!(negotiated.kex, params.kex);
        assert_eq!(negotiated.cipher, params.cipher);
        assert_eq!(negotiated.hmac, params.hmac);
        assert_eq!(negotiated.peer_opts, params.opts);

        // the derived states interoperate in both directions
        let frame = seal_packet(&mut ctx, Opcode::None as u8, b"ping");
        let got = open_packet(&mut srx, &mut Cursor::new(frame)).unwrap();
        assert_eq!(&got.data, b"ping");
        assert!(got.mac_ok);

        let frame = seal_packet(&mut stx, Opcode::None as u8, b"pong");
        let got = open_packet(&mut crx, &mut Cursor::new(frame)).unwrap();
        assert_eq!(&got.data, b"pong");
        assert!(got.mac_ok);
    }

    #[test]
    fn handshake_x25519() {
        run(ClientParams { opts: 5, ..Default::default() }, AcceptPolicy::default());
    }

    #[test]
    fn handshake_kyber_all_variants() {
        for alg in [KexAlg::KyberKem512, KexAlg::KyberKem768, KexAlg::KyberKem1024] {
            let params = ClientParams {
                kex: alg,
                cipher: CipherAlg::ChaCha20,
                hmac: HmacAlg::Sha512,
                opts: 1,
            };
            run(params, AcceptPolicy::default());
        }
    }

    #[test]
    fn server_denies_kex_outside_policy() {
        let (mut client, mut server) = tcp_pair();
        let policy = AcceptPolicy {
            kex: vec![KexAlg::KyberKem768],
            ..AcceptPolicy::default()
        };

        let client_side = thread::spawn(move || {
            let params = ClientParams::default();
            // the server drops the transport without answering, so the
            // client side ends in an error of some kind
            client_handshake(&mut client, &params).is_err()
        });

        match server_handshake(&mut server, &policy, 0) {
            Err(e @ HandshakeError::DeniedKex(0)) => {
                assert_eq!(e.close_status(), Some(status::KEX_DENIED));
            }
            other => panic!("expected kex denial, got {:?}", other.map(|_| ())),
        }
        drop(server);
        assert!(client_side.join().unwrap());
    }

    #[test]
    fn server_denies_cipher_outside_policy() {
        let (mut client, mut server) = tcp_pair();
        let policy = AcceptPolicy {
            ciphers: vec![CipherAlg::ChaCha20],
            ..AcceptPolicy::default()
        };

        let client_side = thread::spawn(move || {
            let params = ClientParams {
                cipher: CipherAlg::Aes256Ctr,
                ..Default::default()
            };
            client_handshake(&mut client, &params).is_err()
        });

        match server_handshake(&mut server, &policy, 0) {
            Err(e @ HandshakeError::DeniedCipher(0)) => {
                assert_eq!(e.close_status(), Some(status::CIPHER_DENIED));
            }
            other => panic!("expected cipher denial, got {:?}", other.map(|_| ())),
        }
        drop(server);
        assert!(client_side.join().unwrap());
    }

    #[test]
    fn blob_lines_strip_and_restore_leading_zeros() {
        let blob = [0x00, 0x00, 0x01, 0xab, 0x00, 0x42];
        let mut line = Vec::new();
        write_blob_line(&mut line, &blob).unwrap();
        assert_eq!(&line, b"0x01ab0042\n");

        let text = String::from_utf8(line).unwrap();
        let restored = decode_blob(text.trim_end(), blob.len()).unwrap();
        assert_eq!(restored, blob);
    }

    #[test]
    fn blob_line_odd_nibble_count() {
        let restored = decode_blob("0xabc", 2).unwrap();
        assert_eq!(restored, [0x0a, 0xbc]);
    }

    #[test]
    fn opts_line_round_trip() {
        let mut line = Vec::new();
        super::write_opts_line(&mut line, 0x0000_0101, 0xdead_beef).unwrap();
        assert_eq!(&line, b"0x00000101:0xdeadbeef\n");

        let text = String::from_utf8(line).unwrap();
        assert_eq!(parse_opts_line(text.trim_end()).unwrap(), (0x101, 0xdead_beef));
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(decode_blob("01ab", 2).is_err());
        assert!(decode_blob("0xzz", 2).is_err());
        assert!(decode_blob("0xffffff", 2).is_err());
        assert!(parse_opts_line("0x1").is_err());
        assert!(parse_opts_line("1:2").is_err());
    }
}
