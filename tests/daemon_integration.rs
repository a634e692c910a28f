//! End-to-end tests against the real `ptymasterd` binary and a real shell.
//! Mirrors the teacher's own `tests/integration_test.rs` style (spawn the
//! built binary, point it at a `tempfile::TempDir`-scoped resource, assert
//! on behavior) but drives the daemon through the control protocol instead
//! of a local CLI surface.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use ptymaster::client::PtyClient;

struct DaemonGuard {
    child: Child,
    socket: PathBuf,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.socket);
    }
}

fn spawn_daemon() -> DaemonGuard {
    let dir = std::env::temp_dir().join(format!("ptymaster-it-{}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    let socket = dir.join(format!("{}.sock", uuid_like()));

    let child = Command::new(env!("CARGO_BIN_EXE_ptymasterd"))
        .arg("--socket")
        .arg(&socket)
        .spawn()
        .expect("failed to spawn ptymasterd");

    wait_for_socket(&socket);
    DaemonGuard { child, socket }
}

fn uuid_like() -> String {
    format!(
        "{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        if Instant::now() > deadline {
            panic!("daemon never created its socket at {}", path.display());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn collect_until(rx: &mpsc::Receiver<Vec<u8>>, needle: &str, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    let mut acc = Vec::new();
    while Instant::now() < deadline {
        if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(100)) {
            acc.extend_from_slice(&chunk);
            let text = String::from_utf8_lossy(&acc);
            if text.contains(needle) {
                return text.to_string();
            }
        }
    }
    String::from_utf8_lossy(&acc).to_string()
}

fn connect(socket: &Path, session_id: &str) -> (PtyClient, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let sink = move |data: &[u8]| {
        let _ = tx.send(data.to_vec());
    };
    let client = PtyClient::connect(socket, session_id, sink).expect("connect failed");
    (client, rx)
}

#[test]
fn echo_scenario() {
    let daemon = spawn_daemon();
    let (mut client, rx) = connect(&daemon.socket, "echo-test");

    client.send_input("echo hi\n").unwrap();
    let seen = collect_until(&rx, "hi", Duration::from_secs(5));
    assert!(seen.contains("echo hi"), "expected echo in output, got: {seen:?}");
}

#[test]
fn two_subscribers_both_see_the_same_output() {
    let daemon = spawn_daemon();
    let (mut a, rx_a) = connect(&daemon.socket, "shared");
    let (_b, rx_b) = connect(&daemon.socket, "shared");

    a.send_input("echo hello-both\n").unwrap();

    let seen_a = collect_until(&rx_a, "hello-both", Duration::from_secs(5));
    let seen_b = collect_until(&rx_b, "hello-both", Duration::from_secs(5));
    assert!(seen_a.contains("hello-both"));
    assert!(seen_b.contains("hello-both"));
}

#[test]
fn subscriber_death_does_not_affect_survivors() {
    let daemon = spawn_daemon();
    let (mut a, rx_a) = connect(&daemon.socket, "death-test");
    let (b, _rx_b) = connect(&daemon.socket, "death-test");

    drop(b); // abrupt disconnect mid-session

    a.send_input("echo still-alive\n").unwrap();
    let seen = collect_until(&rx_a, "still-alive", Duration::from_secs(5));
    assert!(seen.contains("still-alive"));
}

#[test]
fn resize_changes_the_shells_reported_terminal_width() {
    let daemon = spawn_daemon();
    let (mut client, rx) = connect(&daemon.socket, "resize-test");

    client.send_resize(30, 40).unwrap();
    client.send_input("tput cols\n").unwrap();
    let seen = collect_until(&rx, "40", Duration::from_secs(5));
    assert!(seen.contains("40"), "expected tput cols to report 40, got: {seen:?}");
}

#[test]
fn raw_byte_fallback_without_json_wrapper() {
    let daemon = spawn_daemon();

    let mut raw = UnixStream::connect(&daemon.socket).unwrap();
    let connect_frame = br#"{"type":"connect","session_id":"raw-test"}"#;
    raw.write_all(connect_frame).unwrap();

    let mut ack = [0u8; 256];
    let n = raw.read(&mut ack).unwrap();
    assert!(String::from_utf8_lossy(&ack[..n]).contains("connected"));

    raw.write_all(b"echo raw-ok\n").unwrap();

    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 4096];
    raw.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    while Instant::now() < deadline {
        match raw.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&out).contains("raw-ok") {
                    break;
                }
            }
            Err(_) => continue,
        }
    }
    assert!(String::from_utf8_lossy(&out).contains("raw-ok"));
}
