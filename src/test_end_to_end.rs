use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use hex_literal::hex;
use rand::{thread_rng, RngCore};

use conduit::{
    status, AcceptPolicy, ChaffParams, CipherAlg, ClientParams, Conn, HmacAlg, Listener,
    Opcode, WinSize, MAX_DATA_LEN,
};
use kex::KexAlg;

fn pair_with(params: ClientParams) -> (Conn, Conn) {
    let listener = Listener::bind("127.0.0.1:0", AcceptPolicy::default()).unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || listener.accept().unwrap());
    let client = Conn::dial(addr, &params).unwrap();
    (client, server.join().unwrap())
}

fn pair() -> (Conn, Conn) {
    pair_with(ClientParams::default())
}

fn read_exactly(conn: &mut Conn, n: usize) -> Vec<u8> {
    let mut buf = vec![0; n];
    conn.read_exact(&mut buf).unwrap();
    buf
}

// a throwaway echo service on loopback; returns its port
fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let _ = thread::spawn(move || {
        for stream in listener.incoming() {
            let mut sock = match stream {
                Ok(sock) => sock,
                Err(_) => break,
            };
            let _ = thread::spawn(move || {
                let mut buf = [0; 1024];
                loop {
                    match sock.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

// drive a connection's read side forever; control records are handled
// inside read, which is all tunnels need
fn spawn_pump(mut conn: Conn) {
    let _ = thread::spawn(move || {
        let mut buf = [0; 4096];
        loop {
            match conn.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => (),
            }
        }
    });
}

#[test]
fn hello_round_trip() {
    let (client, mut server) = pair();

    client.write_packet(Opcode::None, b"hello").unwrap();

    let mut buf = [0; 16];
    let n = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], hex!("68656c6c6f"));
}

#[test]
fn byte_stream_both_directions_all_algorithms() {
    let combos = [
        (KexAlg::X25519, CipherAlg::Aes256Ctr, HmacAlg::Sha256),
        (KexAlg::X25519, CipherAlg::Aes256Ctr, HmacAlg::Sha512),
        (KexAlg::X25519, CipherAlg::ChaCha20, HmacAlg::Sha256),
        (KexAlg::X25519, CipherAlg::ChaCha20, HmacAlg::Sha512),
        (KexAlg::KyberKem768, CipherAlg::ChaCha20, HmacAlg::Sha256),
    ];

    for (kex, cipher, hmac) in combos {
        let params = ClientParams { kex: kex, cipher: cipher, hmac: hmac, opts: 0 };
        let (mut client, mut server) = pair_with(params);

        let mut out = vec![0; 40_000];
        thread_rng().fill_bytes(&mut out);
        client.write_all(&out).unwrap();
        let got = read_exactly(&mut server, out.len());
        assert_eq!(got, out);

        server.write_all(b"and back again").unwrap();
        let got = read_exactly(&mut client, 14);
        assert_eq!(&got, b"and back again");
    }
}

#[test]
fn exit_status_propagates_on_close() {
    let (mut client, server) = pair();

    server.set_status(7);
    server.close();

    let mut buf = [0; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert_eq!(client.close_status(), 7);

    client.close();
    assert_eq!(client.close_status(), 7);
}

#[test]
fn chaff_never_surfaces_to_the_reader() {
    let (mut client, mut server) = pair();

    client.setup_chaff(ChaffParams { msecs_min: 1, msecs_max: 5, size_max: 48 });
    client.enable_chaff();
    thread::sleep(Duration::from_millis(50));

    client.write_all(b"payload one").unwrap();
    assert_eq!(read_exactly(&mut server, 11), b"payload one");

    thread::sleep(Duration::from_millis(50));
    client.write_all(b"payload two").unwrap();
    assert_eq!(read_exactly(&mut server, 11), b"payload two");

    client.disable_chaff();
}

#[test]
fn interleaved_app_and_chaff_writers_under_load() {
    let (mut client, mut server) = pair();

    client.setup_chaff(ChaffParams { msecs_min: 1, msecs_max: 3, size_max: 32 });
    client.enable_chaff();

    let mut expected = Vec::new();
    for i in 0..200 {
        let chunk = format!("chunk {:03} ", i);
        expected.extend_from_slice(chunk.as_bytes());
        client.write_all(chunk.as_bytes()).unwrap();
    }

    // every frame parses and application bytes arrive intact and ordered
    let got = read_exactly(&mut server, expected.len());
    assert_eq!(got, expected);

    client.shutdown_chaff();
}

#[test]
fn term_size_reaches_the_window_channel() {
    let (mut client, mut server) = pair();

    client.send_term_size(48, 132).unwrap();
    client.write_all(b"!").unwrap();

    read_exactly(&mut server, 1);
    let winch = server.window_changes();
    assert_eq!(winch.try_recv().unwrap(), WinSize { rows: 48, cols: 132 });
}

#[test]
fn tunnel_carries_bytes_both_ways() {
    let echo_port = spawn_echo();
    let (client, server) = pair();

    let lport = client.add_client_tunnel(0, echo_port).unwrap();
    spawn_pump(server);
    spawn_pump(client);

    let mut local = TcpStream::connect(("127.0.0.1", lport)).unwrap();
    local
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    local.write_all(b"through the secured channel").unwrap();
    let mut buf = [0; 27];
    local.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"through the secured channel");

    // a larger transfer, written concurrently so neither side stalls
    let mut big = vec![0; 64_000];
    thread_rng().fill_bytes(&mut big);
    let mut writer_half = local.try_clone().unwrap();
    let big_copy = big.clone();
    let writer = thread::spawn(move || writer_half.write_all(&big_copy).unwrap());

    let mut echoed = vec![0; big.len()];
    local.read_exact(&mut echoed).unwrap();
    writer.join().unwrap();
    assert_eq!(echoed, big);
}

#[test]
fn refused_tunnel_marks_the_endpoint_dead() {
    // a port with nothing listening behind it
    let closed_port = {
        let throwaway = TcpListener::bind("127.0.0.1:0").unwrap();
        throwaway.local_addr().unwrap().port()
    };

    let (client, server) = pair();
    let probe = client.tunnel_probe();
    let lport = client.add_client_tunnel(0, closed_port).unwrap();
    spawn_pump(server);
    spawn_pump(client);

    let mut local = TcpStream::connect(("127.0.0.1", lport)).unwrap();
    local
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // the refusal collapses the local stream
    let mut buf = [0; 1];
    match local.read(&mut buf) {
        Ok(0) | Err(_) => (),
        Ok(n) => panic!("unexpected {} tunnel bytes", n),
    }

    // and the table entry is dead (or already reaped)
    assert_ne!(probe.dead(closed_port), Some(false));
}

#[test]
fn missing_keepalives_reap_server_tunnels() {
    let echo_port = spawn_echo();
    let (client, server) = pair();

    let server_probe = server.tunnel_probe();
    server.set_tunnel_stale_ticks(2);

    let lport = client.add_client_tunnel(0, echo_port).unwrap();
    client.pause_tunnel_keepalives(true);
    spawn_pump(server);
    spawn_pump(client);

    let mut local = TcpStream::connect(("127.0.0.1", lport)).unwrap();
    local
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    local.write_all(b"ping").unwrap();
    let mut buf = [0; 4];
    local.read_exact(&mut buf).unwrap();

    // with keep-alives silenced the server watchdog tears the endpoint
    // down and removes it from the table
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let gone = !server_probe.contains(echo_port)
            || server_probe.dead(echo_port) == Some(true);
        if gone {
            break;
        }
        assert!(Instant::now() < deadline, "stale tunnel survived");
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn server_policy_rejects_disallowed_kex() {
    let policy = AcceptPolicy {
        kex: vec![KexAlg::KyberKem768],
        ..AcceptPolicy::default()
    };
    let listener = Listener::bind("127.0.0.1:0", policy).unwrap();
    let addr = listener.local_addr().unwrap();

    // the dropped connection is accounted for with the denied status
    let server = thread::spawn(move || match listener.accept() {
        Ok(_) => None,
        Err(e) => e.close_status(),
    });
    let client = Conn::dial(addr, &ClientParams::default());

    assert_eq!(server.join().unwrap(), Some(status::KEX_DENIED));
    assert!(client.is_err());
}

#[test]
fn bulk_write_spans_multiple_records() {
    let (mut client, mut server) = pair();

    // one write_all larger than a single record splits into consecutive
    // frames instead of tripping the receiver's payload ceiling
    let len = MAX_DATA_LEN + 4096;
    let mut big = vec![0; len];
    thread_rng().fill_bytes(&mut big);

    let writer = thread::spawn(move || {
        client.write_all(&big).unwrap();
        (client, big)
    });

    let got = read_exactly(&mut server, len);
    let (_client, big) = writer.join().unwrap();
    assert_eq!(got, big);
}
