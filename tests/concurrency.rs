//! Concurrency smoke test (spec.md §8): many clients, each issuing several requests over a
//! single keep-alive connection, all succeed; the cache budget invariant holds throughout.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use pgs::config::Config;
use pgs::server::Server;

const CLIENTS: usize = 1000;
const REQUESTS_PER_CLIENT: usize = 10;

fn read_one_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).expect("read headers");
        assert!(n > 0, "peer closed before a full response arrived");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]);
    let content_length: usize = headers
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(str::to_owned))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).expect("read body");
        assert!(n > 0, "peer closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }

    buf
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn log_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pgs.log")
}

#[test]
fn thousand_clients_ten_requests_each_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let www = dir.path().join("www");
    fs::create_dir(&www).unwrap();
    fs::write(www.join("index.html"), b"<h1>Hi</h1>").unwrap();

    let config = Config {
        port: 0,
        static_folder: www,
        thread_count: 16,
        rate_limit_max_requests: (CLIENTS * REQUESTS_PER_CLIENT * 2) as u32,
        rate_limit_window_seconds: 300,
        cache_size_bytes: 1024 * 1024,
        cache_max_age_seconds: 60,
    };

    let server = Server::new(config).expect("server binds");
    let addr = server.local_addr();

    let log_baseline = fs::metadata(log_path()).map(|m| m.len()).unwrap_or(0);

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).expect("connect");
                stream.set_nodelay(true).ok();
                let mut successes = 0;
                for _ in 0..REQUESTS_PER_CLIENT {
                    stream
                        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
                        .expect("write request");
                    let response = read_one_response(&mut stream);
                    if response.starts_with(b"HTTP/1.1 200 OK") && response.ends_with(b"<h1>Hi</h1>") {
                        successes += 1;
                    }
                }
                successes
            })
        })
        .collect();

    let total_successes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total_successes, CLIENTS * REQUESTS_PER_CLIENT);

    let stats = server.cache_stats();
    assert!(stats.current_size <= stats.max_size);

    server.stop();
    pgs::logger::Logger::global().shutdown();

    let log_contents = fs::read(log_path()).unwrap_or_default();
    let new_contents = &log_contents[(log_baseline as usize).min(log_contents.len())..];
    let close_summaries = String::from_utf8_lossy(new_contents)
        .lines()
        .filter(|l| l.contains("Connection closed:"))
        .count();
    assert!(
        close_summaries >= CLIENTS,
        "expected at least {CLIENTS} close summaries, saw {close_summaries}"
    );
}
