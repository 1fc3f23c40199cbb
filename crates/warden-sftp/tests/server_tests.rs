//! Server startup and accept loop tests
//!
//! NIST 800-53: IA-3 (Device Identification), SC-5 (Denial of Service Protection)

mod common;

use common::{TestCustomer, generate_key, registry};
use russh::keys::ssh_key::LineEnding;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use warden_sftp::server::load_host_key;
use warden_sftp::{Config, Error, KeyFileGate, Server};

fn test_server(customer: &TestCustomer, config: Config) -> Server {
    let gate = Arc::new(KeyFileGate::new(registry(&[customer])));
    Server::with_parts(config, gate, generate_key())
}

async fn read_banner(stream: &mut TcpStream) -> String {
    let mut banner = Vec::new();
    let mut byte = [0u8; 1];
    while !banner.ends_with(b"\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        banner.push(byte[0]);
    }
    String::from_utf8(banner).unwrap()
}

/// A host key written in OpenSSH format loads back
#[test]
fn test_load_host_key() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("host_ed25519");
    let key = generate_key();
    std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();

    let loaded = load_host_key(&path).unwrap();
    assert_eq!(loaded.public_key().key_data(), key.public_key().key_data());
}

/// Missing or unreadable host keys refuse startup
#[test]
fn test_bad_host_key_refuses_startup() {
    let dir = tempfile::TempDir::new().unwrap();

    let config = Config {
        host_key_path: dir.path().join("missing"),
        ..Config::default()
    };
    assert!(matches!(Server::new(config), Err(Error::Config(_))));

    let garbage = dir.path().join("garbage");
    std::fs::write(&garbage, b"not a key").unwrap();
    let config = Config {
        host_key_path: garbage,
        ..Config::default()
    };
    assert!(matches!(Server::new(config), Err(Error::Config(_))));
}

/// Invalid customer tables refuse startup before the key is read
#[test]
fn test_invalid_config_refuses_startup() {
    let config = Config {
        port: 0,
        ..Config::default()
    };
    assert!(matches!(Server::new(config), Err(Error::Config(_))));
}

/// Occupied port is reported instead of served
#[tokio::test]
async fn test_bind_failure() {
    let richard = TestCustomer::new("richard");
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = Config {
        bind_address: "127.0.0.1".into(),
        port: occupied.local_addr().unwrap().port(),
        ..Config::default()
    };

    let result = test_server(&richard, config).run().await;
    assert!(matches!(result, Err(Error::Connection(_))));
}

/// Every connection gets its own SSH session; a peer that vanishes does not
/// stop the acceptor.
#[tokio::test]
async fn test_accepts_multiple_connections() {
    let richard = TestCustomer::new("richard");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(test_server(&richard, Config::default()).serve(listener));

    let mut first = TcpStream::connect(addr).await.unwrap();
    assert!(read_banner(&mut first).await.starts_with("SSH-2.0-"));
    drop(first);

    // Garbage instead of a version line only kills that connection.
    let mut rude = TcpStream::connect(addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut rude, b"GET / HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    drop(rude);

    let mut second = TcpStream::connect(addr).await.unwrap();
    let banner = tokio::time::timeout(Duration::from_secs(5), read_banner(&mut second))
        .await
        .unwrap();
    assert!(banner.starts_with("SSH-2.0-"));

    assert!(!server.is_finished());
    server.abort();
}
