//! End-to-end scenarios driven over real loopback sockets against a
//! reactor bound to an ephemeral port, one worker thread pool and all.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use reactor_httpd::config::Args;
use reactor_httpd::conn::live_count;
use reactor_httpd::Reactor;

fn spawn_reactor(mut args: Args) -> u16 {
    // Bind on an OS-assigned port up front so the caller can connect
    // immediately without a retry loop.
    args.port = free_port();
    let port = args.port;
    let config = args.into_config().unwrap();
    let mut reactor = Reactor::new(config).unwrap();
    std::thread::spawn(move || {
        let _ = reactor.run();
    });
    std::thread::sleep(Duration::from_millis(50));
    port
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn base_args() -> Args {
    Args {
        port: 0,
        trig_mode: 3,
        timeout_ms: 60_000,
        opt_linger: false,
        db_pool_size: 1,
        thread_num: 4,
        src_dir: std::env::temp_dir(),
        log_level: "error".into(),
        log_dir: None,
        log_queue_size: 64,
        max_connections: reactor_httpd::config::DEFAULT_MAX_CONNECTIONS,
    }
}

fn read_response(stream: &mut TcpStream, want: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    while !out.windows(want.len().max(1)).any(|w| w == want) {
        let n = stream.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    out
}

#[test]
fn s1_keep_alive_pipeline_serves_two_requests_on_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), b"hi").unwrap();
    let mut args = base_args();
    args.src_dir = dir.path().to_path_buf();
    let port = spawn_reactor(args);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let request = b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
    stream.write_all(request).unwrap();
    let first = read_response(&mut stream, b"\r\n\r\nhi");
    assert!(String::from_utf8_lossy(&first).starts_with("HTTP/1.1 200"));

    stream.write_all(request).unwrap();
    let second = read_response(&mut stream, b"\r\n\r\nhi");
    assert!(String::from_utf8_lossy(&second).starts_with("HTTP/1.1 200"));
}

#[test]
fn s2_malformed_request_gets_400_then_the_connection_closes() {
    let port = spawn_reactor(base_args());
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(b"NOT-HTTP\r\n\r\n").unwrap();

    let response = read_response(&mut stream, b"\r\n\r\n");
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));

    let mut probe = [0u8; 8];
    let n = stream.read(&mut probe).unwrap_or(0);
    assert_eq!(n, 0, "server should have closed the connection after a 400");
}

#[test]
fn s3_capacity_overflow_rejects_connections_past_the_configured_cap() {
    let baseline = live_count();
    let mut args = base_args();
    args.max_connections = baseline + 4;
    let port = spawn_reactor(args);

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(("127.0.0.1", port)).unwrap());
    }
    std::thread::sleep(Duration::from_millis(100));

    let mut fifth = TcpStream::connect(("127.0.0.1", port)).unwrap();
    fifth.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 32];
    let n = fifth.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"Server busy!\n");
}

#[test]
fn s4_idle_connection_is_closed_within_the_configured_window() {
    let mut args = base_args();
    args.timeout_ms = 200;
    let before = live_count();
    let port = spawn_reactor(args);
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(live_count(), before + 1);

    std::thread::sleep(Duration::from_millis(2_000));
    assert_eq!(live_count(), before, "idle connection should have been reaped");
    drop(stream);
}

#[test]
fn s5_edge_triggered_connection_drains_a_large_burst_in_one_go() {
    let dir = tempfile::tempdir().unwrap();
    let body = vec![b'x'; 128 * 1024];
    std::fs::write(dir.path().join("big.bin"), &body).unwrap();
    let mut args = base_args();
    args.src_dir = dir.path().to_path_buf();
    args.trig_mode = 3;
    let port = spawn_reactor(args);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"GET /big.bin HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert!(String::from_utf8_lossy(&out[..out.len().min(32)]).starts_with("HTTP/1.1 200"));
    assert!(out.ends_with(&body[body.len() - 16..]));
}

#[test]
fn s6_large_body_write_drains_fully_over_several_writable_events() {
    let dir = tempfile::tempdir().unwrap();
    let body = vec![b'y'; 4 * 1024 * 1024];
    std::fs::write(dir.path().join("huge.bin"), &body).unwrap();
    let mut args = base_args();
    args.src_dir = dir.path().to_path_buf();
    let port = spawn_reactor(args);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(b"GET /huge.bin HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();

    let mut total = 0usize;
    let mut buf = [0u8; 8 * 1024];
    loop {
        // A small read buffer forces the server to hit EAGAIN repeatedly
        // and re-arm for write readiness several times over.
        std::thread::sleep(Duration::from_millis(1));
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    assert!(total > body.len(), "expected headers plus the full body, got {total} bytes");
}
