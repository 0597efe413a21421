#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/swcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn spawn_server(sock_path: &Path, max_frame: &str) -> Child {
    Command::new(env!("CARGO_BIN_EXE_streamwire"))
        .env("STREAMWIRE_MAX_FRAME", max_frame)
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve command should start")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        assert!(start.elapsed() < timeout, "server socket never appeared");
        thread::sleep(Duration::from_millis(25));
    }
}

fn request(sock_path: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_streamwire"))
        .arg("--format")
        .arg("json")
        .arg("--log-level")
        .arg("error")
        .arg("request")
        .arg(sock_path)
        .args(extra)
        .output()
        .expect("request command should run")
}

#[test]
fn version_request_against_server() {
    let dir = unique_temp_dir("version");
    let sock_path = dir.join("serve.sock");
    let mut child = spawn_server(&sock_path, "4096");
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let output = request(&sock_path, &["--path", "/version"]);
    assert_eq!(output.status.code(), Some(0));

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(value["statusCode"], 200);
    assert_eq!(value["streams"][0]["contentType"], "application/json");
    let body: serde_json::Value = serde_json::from_str(
        value["streams"][0]["body"]
            .as_str()
            .expect("body should be a string"),
    )
    .expect("version body should be json");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn data_is_echoed_across_small_frames() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("serve.sock");
    // Both ends must agree on the frame ceiling.
    let mut child = spawn_server(&sock_path, "64");
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let payload = "streamwire ".repeat(50);
    let output = request(
        &sock_path,
        &[
            "--verb",
            "POST",
            "--path",
            "/echo",
            "--data",
            &payload,
            "--max-frame",
            "64",
        ],
    );
    assert_eq!(output.status.code(), Some(0));

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(value["streams"][0]["body"], payload.as_str());
    assert_eq!(value["streams"][0]["contentType"], "text/plain");

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_socket_fails_with_exit_1() {
    let dir = unique_temp_dir("missing");
    let output = request(&dir.join("absent.sock"), &["--path", "/version"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"));
    let _ = std::fs::remove_dir_all(&dir);
}
