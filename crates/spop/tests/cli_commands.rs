#![cfg(feature = "cli")]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

struct ServeGuard(Child);

impl Drop for ServeGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral port should bind");
    listener.local_addr().expect("listener should have an address")
}

fn spawn_serve(addr: SocketAddr) -> ServeGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_spop"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(addr.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start");
    let guard = ServeGuard(child);

    let start = Instant::now();
    while TcpStream::connect(addr).is_err() {
        if start.elapsed() >= Duration::from_secs(5) {
            panic!("agent did not start listening on {addr}");
        }
        thread::sleep(Duration::from_millis(25));
    }
    guard
}

fn spop(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_spop"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .args(args)
        .output()
        .expect("spop should run")
}

#[test]
fn probe_reports_negotiated_values() {
    let addr = free_addr();
    let _agent = spawn_serve(addr);

    let output = spop(&["probe", &addr.to_string()]);
    assert!(output.status.success(), "probe failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"version\":\"2.0\""));
    assert!(stdout.contains("\"max_frame_size\":16380"));
    assert!(stdout.contains("fragmentation"));
}

#[test]
fn healthcheck_probe_succeeds() {
    let addr = free_addr();
    let _agent = spawn_serve(addr);

    let output = spop(&["probe", &addr.to_string(), "--healthcheck"]);
    assert!(output.status.success(), "health check failed: {output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("\"healthcheck\":true"));
}

#[test]
fn notify_echoes_arguments_as_txn_variables() {
    let addr = free_addr();
    let _agent = spawn_serve(addr);

    let output = spop(&[
        "notify",
        &addr.to_string(),
        "--message",
        "check",
        "--arg",
        "ip=ipv4:10.0.0.1",
        "--arg",
        "port=uint32:443",
        "--stream-id",
        "7",
        "--frame-id",
        "3",
    ]);
    assert!(output.status.success(), "notify failed: {output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"stream_id\":7"));
    assert!(stdout.contains("\"frame_id\":3"));
    assert!(stdout.contains("\"name\":\"check.ip\""));
    assert!(stdout.contains("\"value\":\"10.0.0.1\""));
    assert!(stdout.contains("\"name\":\"check.port\""));
    assert!(stdout.contains("\"scope\":\"txn\""));
}

#[test]
fn notify_without_agent_is_transport_error() {
    let addr = free_addr();
    let output = spop(&["notify", &addr.to_string(), "--message", "check"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
}

#[test]
fn bad_notify_argument_is_usage_error() {
    let addr = free_addr();
    let output = spop(&["notify", &addr.to_string(), "--message", "m", "--arg", "nope"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_extended_prints_protocol() {
    let output = spop(&["version", "--extended"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("name: spop"));
    assert!(stdout.contains("protocol: SPOP/2.0"));
}
