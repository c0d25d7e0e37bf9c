use siphon::wire::handshake::{Hello, ROLE_SERVER};
use siphon::wire::Connection;
use siphon::{Address, Client, Diagnostics, Host, Router, SiphonError};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::Command;
use std::thread;
use tempfile::TempDir;

#[test]
fn test_socket_permissions() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("perm.sock");
    let address = Address::new("perm", "unix", socket_path.to_str().unwrap()).unwrap();

    let mut host = Host::new(Command::new("cat"), address, Diagnostics::discard("host"));
    host.serve().unwrap();

    let mode = fs::metadata(&socket_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600, "Socket should have 0600 permissions");

    host.un_serve().unwrap();
    assert!(!socket_path.exists(), "Socket file should be removed");
}

#[test]
fn test_protocol_mismatch_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("impostor.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let impostor = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let conn = Connection::from_unix(stream).unwrap();
        let _: Hello = conn.decode().unwrap().unwrap();
        let mut reply = Hello::new(ROLE_SERVER);
        reply.tag = "not-siphon".to_string();
        conn.encode(&reply).unwrap();
        // Sees the client hang up.
        conn.decode::<Hello>().unwrap().is_none()
    });

    let address = Address::new("impostor", "unix", socket_path.to_str().unwrap()).unwrap();
    let result = Client::connect(&address, Diagnostics::discard("client"));
    assert!(matches!(result, Err(SiphonError::ProtocolMismatch(tag)) if tag == "not-siphon"));
    assert!(impostor.join().unwrap());
}

#[test]
fn test_redirect_loop_is_bounded() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("loop.sock");
    let address = Address::new("loop", "unix", socket_path.to_str().unwrap()).unwrap();

    let mut router = Router::new(address.clone(), address.clone(), Diagnostics::discard("router"));
    router.serve().unwrap();

    let result = Client::connect(&address, Diagnostics::discard("client"));
    assert!(matches!(result, Err(SiphonError::RedirectLimit(8))));
    router.un_serve().unwrap();
}

#[test]
fn test_garbage_peer_does_not_disturb_host() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("garbage.sock");
    let address = Address::new("garbage", "unix", socket_path.to_str().unwrap()).unwrap();

    let mut host = Host::new(Command::new("cat"), address.clone(), Diagnostics::discard("host"));
    host.start().unwrap();
    host.serve().unwrap();

    let mut raw = UnixStream::connect(&socket_path).unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    drop(raw);

    let client = Client::connect(&address, Diagnostics::discard("client")).unwrap();
    assert!(client.send_resize(24, 80).unwrap());
    assert!(host.try_wait().unwrap().is_none());
    assert!(host.is_serving());

    host.un_serve().unwrap();
    host.kill().unwrap();
    let _ = host.wait();
    host.cleanup();
}
