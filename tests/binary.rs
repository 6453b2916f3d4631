//! Black-box integration tests for the `daqctld` binary: spawn the real
//! process and drive it over TCP/UDP, the way `tests/binary.rs` in the
//! teacher repo spawns `server`/`client` and exercises them as external
//! processes rather than calling into the crate directly.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::process::{Child, Command, Output};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use std::{env, thread};

fn exe_path() -> PathBuf {
    env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .join("daqctld")
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

static PORT_COUNTER: AtomicU32 = AtomicU32::new(19400);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst) as u16
}

/// RAII guard that kills the spawned daemon on drop so a failing assertion
/// can't leak a background process into the rest of the test run.
struct Daemon(Child);

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_daemon(client_port: u16, dnode_port: u16, sample_port: u16) -> Daemon {
    let child = Command::new(exe_path())
        .arg("--dont-daemonize")
        .args(["--client-port", &client_port.to_string()])
        .args(["--dnode-host", "127.0.0.1"])
        .args(["--dnode-port", &dnode_port.to_string()])
        .args(["--sample-port", &sample_port.to_string()])
        .spawn()
        .expect("failed to start daqctld");
    Daemon(child)
}

fn wait_for_connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("daqctld never started accepting on port {port}");
}

#[test]
fn test_help_flag() {
    let out = Command::new(exe_path())
        .arg("--help")
        .output()
        .expect("failed to run daqctld --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("--client-port"));
    assert!(stdout.contains("--dont-daemonize") || stdout.contains("-N"));
}

#[test]
fn test_accepts_client_connects_to_dnode_and_refuses_second_client() {
    let dnode_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dnode_port = dnode_listener.local_addr().unwrap().port();
    let client_port = next_port();
    let sample_port = next_port();

    let accepting = thread::spawn(move || dnode_listener.accept().unwrap().0);
    let _daemon = spawn_daemon(client_port, dnode_port, sample_port);

    // The daemon only connects to the data node once startup succeeds, so
    // this join also proves the session came up at all.
    let _fake_dnode = accepting
        .join()
        .expect("daqctld should have connected to the fake data node");

    let _first = wait_for_connect(client_port);
    thread::sleep(Duration::from_millis(100));

    let mut second = TcpStream::connect(("127.0.0.1", client_port)).unwrap();
    second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 1];
    let n = second.read(&mut buf).unwrap_or(1);
    assert_eq!(n, 0, "a second concurrent client should be refused immediately");
}

#[test]
fn test_udp_samples_are_dropped_without_crashing() {
    let dnode_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dnode_port = dnode_listener.local_addr().unwrap().port();
    let client_port = next_port();
    let sample_port = next_port();

    let accepting = thread::spawn(move || dnode_listener.accept().unwrap().0);
    let mut daemon = spawn_daemon(client_port, dnode_port, sample_port);
    let _fake_dnode = accepting.join().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    // A board-sample-shaped datagram; the daemon has no forward endpoint
    // wired up so this is read and discarded, per spec.md's non-goal on
    // in-core sample rewriting.
    let mut datagram = vec![0x5A, 0x00, 0x01, 0x00, 0, 0, 0, 0];
    datagram.extend_from_slice(&42u32.to_be_bytes());
    datagram.extend_from_slice(&2u16.to_be_bytes());
    datagram.extend_from_slice(&3u16.to_be_bytes());
    datagram.extend_from_slice(&[0u8; 12]);
    sender.send_to(&datagram, ("127.0.0.1", sample_port)).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(
        daemon.0.try_wait().unwrap().is_none(),
        "daqctld should still be running after a dropped UDP sample"
    );
}

#[test]
fn test_exits_nonzero_when_data_node_is_unreachable() {
    let client_port = next_port();
    // Nothing is listening on this port, so the data-node connect in
    // ControlSession::new should fail and the process should exit non-zero.
    let dnode_port = next_port();
    let sample_port = next_port();

    let status = Command::new(exe_path())
        .arg("--dont-daemonize")
        .args(["--client-port", &client_port.to_string()])
        .args(["--dnode-host", "127.0.0.1"])
        .args(["--dnode-port", &dnode_port.to_string()])
        .args(["--sample-port", &sample_port.to_string()])
        .status()
        .expect("failed to run daqctld");
    assert!(!status.success(), "expected nonzero exit with no data node listening");
}
