//! End-to-end scenarios: a loop and server in the test thread, plain
//! blocking std clients on helper threads.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lib_server::master::status::{self, MasterManifest};
use lib_server::{EventLoop, LoopHandle, Packet, Server, Signal, Statistics, Supervisor};

/// Drives the loop until `done` flips or the deadline passes.
fn run_until(ev: &mut EventLoop, handle: &LoopHandle, done: Arc<AtomicBool>, deadline: Duration) {
    let started = Instant::now();
    handle
        .repeat(Duration::from_millis(5), move |h| {
            if done.load(Ordering::Relaxed) || started.elapsed() > deadline {
                h.stop();
            }
            Ok(())
        })
        .unwrap();
    ev.run().unwrap();
}

#[test]
fn text_echo_round_trip() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stats = Statistics::shared();

    let mut server = Server::new("text://127.0.0.1:0")
        .name("echo")
        .on_message(|conn, packet| {
            conn.send(packet);
            Ok(())
        });
    server.start(&handle, &stats).unwrap();
    let port = server.local_addr().unwrap().port();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let client = thread::spawn(move || {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut stream = stream;
        stream.write_all(b"hello\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        flag.store(true, Ordering::Relaxed);
        line
    });

    run_until(&mut ev, &handle, done, Duration::from_secs(10));
    assert_eq!(client.join().unwrap(), "hello\n");
    assert_eq!(stats.total_request.get(), 1);
}

#[test]
fn two_length_frames_in_one_write_deliver_separately() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stats = Statistics::shared();

    let done = Arc::new(AtomicBool::new(false));
    let received: Arc<std::sync::Mutex<Vec<Vec<u8>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));

    let sink = received.clone();
    let flag = done.clone();
    let mut server = Server::new("frame://127.0.0.1:0")
        .name("frames")
        .on_message(move |_conn, packet| {
            let mut sink = sink.lock().unwrap();
            sink.push(packet.into_bytes());
            if sink.len() == 2 {
                flag.store(true, Ordering::Relaxed);
            }
            Ok(())
        });
    server.start(&handle, &stats).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // 4+1 "A" then 4+2 "BB", one write.
        stream
            .write_all(&[0, 0, 0, 5, b'A', 0, 0, 0, 6, b'B', b'B'])
            .unwrap();
        thread::sleep(Duration::from_millis(500));
    });

    run_until(&mut ev, &handle, done, Duration::from_secs(10));
    client.join().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(*received, vec![b"A".to_vec(), b"BB".to_vec()]);
    assert_eq!(stats.total_request.get(), 2);
}

#[test]
fn oversized_http_body_gets_413_and_no_message() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stats = Statistics::shared();

    let message_seen = Arc::new(AtomicBool::new(false));
    let seen = message_seen.clone();
    let mut server = Server::new("http://127.0.0.1:0")
        .name("web")
        .max_package_size(1024)
        .on_message(move |_conn, _packet| {
            seen.store(true, Ordering::Relaxed);
            Ok(())
        });
    server.start(&handle, &stats).unwrap();
    let port = server.local_addr().unwrap().port();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2048\r\n\r\n")
            .unwrap();
        let _ = stream.write_all(&[b'x'; 2048]);
        // Read just the response head; the server resets right after it.
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        while !reply.ends_with(b"\r\n\r\n") && stream.read_exact(&mut byte).is_ok() {
            reply.push(byte[0]);
        }
        flag.store(true, Ordering::Relaxed);
        reply
    });

    run_until(&mut ev, &handle, done, Duration::from_secs(10));
    let reply = client.join().unwrap();
    assert!(
        reply.starts_with(b"HTTP/1.1 413"),
        "expected 413, got {:?}",
        String::from_utf8_lossy(&reply)
    );
    assert!(!message_seen.load(Ordering::Relaxed));
}

#[test]
fn websocket_handshake_and_fragmented_text() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stats = Statistics::shared();

    let mut server = Server::new("websocket://127.0.0.1:0")
        .name("ws")
        .on_message(|conn, packet| {
            conn.send(packet);
            Ok(())
        });
    server.start(&handle, &stats).unwrap();
    let port = server.local_addr().unwrap().port();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(
                b"GET /chat HTTP/1.1\r\n\
                  Host: 127.0.0.1\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();

        // Read the 101 head.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        // "Hel" (fin=0, text) + "lo" (fin=1, continuation), masked.
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut first = vec![0x01, 0x83];
        first.extend_from_slice(&mask);
        first.extend(b"Hel".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
        let mut second = vec![0x80, 0x82];
        second.extend_from_slice(&mask);
        second.extend(b"lo".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
        stream.write_all(&first).unwrap();
        stream.write_all(&second).unwrap();

        // Echo comes back as one unmasked text frame.
        let mut frame = [0u8; 7];
        stream.read_exact(&mut frame).unwrap();
        flag.store(true, Ordering::Relaxed);
        frame.to_vec()
    });

    run_until(&mut ev, &handle, done, Duration::from_secs(10));
    let frame = client.join().unwrap();
    assert_eq!(frame[0], 0x81);
    assert_eq!(frame[1], 5);
    assert_eq!(&frame[2..], b"Hello");
    assert_eq!(stats.total_request.get(), 1);
}

#[test]
fn udp_datagram_echo() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stats = Statistics::shared();

    let mut server = Server::new("udp://127.0.0.1:0")
        .name("udp-echo")
        .on_message(|conn, packet| {
            conn.send(packet);
            Ok(())
        });
    server.start(&handle, &stats).unwrap();
    let addr = server.local_addr().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let client = thread::spawn(move || {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.send_to(b"ping", addr).unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        flag.store(true, Ordering::Relaxed);
        buf[..n].to_vec()
    });

    run_until(&mut ev, &handle, done, Duration::from_secs(10));
    assert_eq!(client.join().unwrap(), b"ping");
    assert_eq!(stats.total_request.get(), 1);
}

#[test]
fn raw_tcp_with_no_codec_delivers_chunks() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stats = Statistics::shared();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let mut server = Server::new("tcp://127.0.0.1:0")
        .name("raw")
        .on_message(move |conn, packet| {
            assert!(matches!(&packet, Packet::Bytes(b) if b == b"raw bytes"));
            conn.send_raw(Packet::Bytes(b"ok".to_vec()));
            flag.store(true, Ordering::Relaxed);
            Ok(())
        });
    server.start(&handle, &stats).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"raw bytes").unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        buf.to_vec()
    });

    run_until(&mut ev, &handle, done, Duration::from_secs(10));
    assert_eq!(client.join().unwrap(), b"ok");
}

/// Stops the spawned master if the test panics midway: a stop signal
/// first, so the master can reap its workers, then a hard kill.
struct MasterGuard(Child);

impl Drop for MasterGuard {
    fn drop(&mut self) {
        unsafe {
            libc::kill(self.0.id() as i32, libc::SIGINT);
        }
        for _ in 0..50 {
            if matches!(self.0.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn connect_with_retry(port: u16, deadline: Duration) -> TcpStream {
    let started = Instant::now();
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) if started.elapsed() < deadline => {
                thread::sleep(Duration::from_millis(50))
            }
            Err(err) => panic!("no worker accepted within {deadline:?}: {err}"),
        }
    }
}

/// Triggers a status dump on the master and reads the settled manifest
/// back from the runtime directory.
fn status_snapshot(master: i32, runtime_dir: &Path) -> Option<MasterManifest> {
    unsafe {
        libc::kill(master, libc::SIGABRT);
    }
    thread::sleep(Duration::from_millis(400));
    let dump = std::fs::read_dir(runtime_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.extension().is_some_and(|ext| ext == "status"))?;
    let content = status::read(&dump).ok()?;
    status::parse(&content).map(|(manifest, _rows)| manifest)
}

/// Re-exec target: runs a two-worker master when spawned by the reload
/// test below; a no-op pass otherwise.
#[test]
fn reload_master_stub() {
    let Ok(port) = std::env::var("RELOAD_STUB_PORT") else {
        return;
    };
    let mut supervisor = Supervisor::new().unwrap();
    supervisor.add_server(
        Server::new(&format!("text://127.0.0.1:{port}"))
            .name("reload-echo")
            .count(2)
            .on_message(|conn, packet| {
                conn.send(packet);
                Ok(())
            }),
    );
    let code = supervisor.start(false, true).unwrap_or(1);
    std::process::exit(code);
}

#[test]
fn graceful_reload_replaces_workers_and_keeps_the_held_connection_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let port = free_port();

    // The master runs in its own process (fresh, effectively
    // single-threaded at fork time): re-exec this binary filtered down to
    // the stub above.
    let child = Command::new(std::env::current_exe().unwrap())
        .args(["reload_master_stub", "--exact", "--test-threads=1", "--nocapture"])
        .env("RELOAD_STUB_PORT", port.to_string())
        .env("SERVER_RUNTIME_DIR", tmp.path())
        .env("SERVER_LOG_FILE", tmp.path().join("server.log"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let master = child.id() as i32;
    let guard = MasterGuard(child);

    // Hold a live connection against one of the workers and prove it echoes.
    let mut held = connect_with_retry(port, Duration::from_secs(15));
    held.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    held.write_all(b"hello\n").unwrap();
    let mut reader = BufReader::new(held.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "hello\n");

    // Both slots populated before the reload.
    let deadline = Instant::now() + Duration::from_secs(20);
    let before = loop {
        if let Some(manifest) = status_snapshot(master, tmp.path()) {
            let workers = &manifest.servers[0].workers;
            if workers.len() == 2 && workers.iter().all(|&pid| pid != 0) {
                break manifest;
            }
        }
        assert!(Instant::now() < deadline, "workers never came up");
    };
    let old_workers = before.servers[0].workers.clone();

    unsafe {
        libc::kill(master, libc::SIGUSR2);
    }

    // Serial rollout: wait until both slots hold fresh pids and the master
    // settled back to RUNNING.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(manifest) = status_snapshot(master, tmp.path()) {
            let workers = &manifest.servers[0].workers;
            let replaced = workers.len() == 2
                && workers
                    .iter()
                    .all(|&pid| pid != 0 && !old_workers.contains(&pid));
            if replaced && manifest.status == "RUNNING" {
                break;
            }
        }
        assert!(Instant::now() < deadline, "reload never completed");
    }

    // The held connection's worker drained and exited: the stream must see
    // a clean close with no spurious bytes after the echo.
    let mut trailing = [0u8; 64];
    match reader.read(&mut trailing) {
        Ok(0) => {}
        other => panic!("expected clean close on reload, got {other:?}"),
    }

    // The guard stops the master (and with it the pool) on the way out.
    drop(guard);
}

#[test]
fn signals_dispatch_at_tick_boundaries() {
    let mut ev = EventLoop::new().unwrap();
    let handle = ev.handle();

    handle
        .on_signal(Signal::SIGUSR2, |h, signal| {
            assert_eq!(signal, Signal::SIGUSR2);
            h.stop();
            Ok(())
        })
        .unwrap();
    // Something referenced so the loop keeps spinning until the signal.
    handle
        .repeat(Duration::from_secs(3600), |_| Ok(()))
        .unwrap();

    let pid = std::process::id();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        unsafe {
            libc::kill(pid as i32, libc::SIGUSR2);
        }
    });

    let started = Instant::now();
    ev.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
}
