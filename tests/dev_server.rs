use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use assetpipe::PipelineError;
use assetpipe::observability::MetricsCollector;
use assetpipe::server::DevServer;
use tempfile::tempdir;

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

/// Reads from `stream` until `needle` shows up or the read times out.
fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut seen = String::new();
    let mut buffer = [0u8; 1024];
    while !seen.contains(needle) {
        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(read) => seen.push_str(&String::from_utf8_lossy(&buffer[..read])),
        }
    }
    seen
}

#[test]
fn serves_output_with_live_reload_client() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("index.html"),
        "<html><body><p>hi</p></body></html>",
    )
    .unwrap();
    fs::write(temp.path().join("main.css"), "p{color:red}").unwrap();

    let mut server =
        DevServer::start(local(), temp.path().to_path_buf(), true, MetricsCollector::new())
            .unwrap();
    let addr = server.address();

    let page = get(addr, "/");
    assert!(page.starts_with("HTTP/1.1 200"));
    assert!(page.contains("/__livereload"));
    assert!(page.contains("<p>hi</p>"));

    let css = get(addr, "/main.css");
    assert!(css.contains("text/css"));
    assert!(!css.contains("/__livereload"));

    assert!(get(addr, "/missing.js").starts_with("HTTP/1.1 404"));
    assert!(get(addr, "/../secret").starts_with("HTTP/1.1 404"));

    server.stop();
}

#[test]
fn notify_reaches_connected_clients() {
    let temp = tempdir().unwrap();
    let server =
        DevServer::start(local(), temp.path().to_path_buf(), true, MetricsCollector::new())
            .unwrap();

    let mut stream = TcpStream::connect(server.address()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "GET /__livereload HTTP/1.1\r\nHost: localhost\r\n\r\n"
    )
    .unwrap();
    let preamble = read_until(&mut stream, "retry: 1000");
    assert!(preamble.contains("text/event-stream"));

    let receivers = server.notify(&[temp.path().join("main.min.css")]);
    assert_eq!(receivers, 1);
    let event = read_until(&mut stream, "event: css");
    assert!(event.contains("main.min.css"));
}

#[test]
fn second_bind_on_same_port_fails() {
    let temp = tempdir().unwrap();
    let first =
        DevServer::start(local(), temp.path().to_path_buf(), false, MetricsCollector::new())
            .unwrap();

    let err = DevServer::start(
        first.address(),
        temp.path().to_path_buf(),
        false,
        MetricsCollector::new(),
    )
    .err()
    .expect("port already in use");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Bind { .. })
    ));
}
