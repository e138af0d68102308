use assert_cmd::Command;
use predicates::prelude::*;

use rbcp_tools_rbcp::digest::{ChecksumAlgorithm, Digest};
use rbcp_tools_rbcp::manifest::TransferManifest;
use rbcp_tools_rbcp::planner::ChunkPolicy;
use rbcp_tools_rbcp::sidecar;

fn rbcp() -> Command {
    Command::cargo_bin("rbcp").unwrap()
}

fn write_test_file(path: &std::path::Path, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    std::fs::write(path, &data).unwrap();
    data
}

/// Starts `rbcpd` and waits for the address it announces on stderr
fn spawn_daemon(
    root: &std::path::Path,
    extra_args: &[&str],
) -> (std::process::Child, std::net::SocketAddr) {
    let mut daemon = std::process::Command::new(assert_cmd::cargo::cargo_bin("rbcpd"))
        .arg("--root")
        .arg(root)
        .args(extra_args)
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let stderr = daemon.stderr.take().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    // keep draining stderr so the daemon never writes into a closed pipe
    std::thread::spawn(move || {
        for line in std::io::BufRead::lines(std::io::BufReader::new(stderr)).map_while(Result::ok) {
            if let Some(addr) = line.strip_prefix("RBCP_TCP ") {
                let _ = tx.send(addr.to_string());
            }
        }
    });
    let addr = rx
        .recv_timeout(std::time::Duration::from_secs(30))
        .unwrap()
        .parse()
        .unwrap();
    (daemon, addr)
}

/// Test that --help lists the option groups
#[test]
fn test_help_shows_option_groups() {
    rbcp()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transfer options"))
        .stdout(predicate::str::contains("Failure handling"))
        .stdout(predicate::str::contains("--chunk-policy"));
}

#[test]
fn test_version() {
    rbcp()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

/// Test that --protocol-version works without source and destination
#[test]
fn test_protocol_version_json() {
    let output = rbcp().arg("--protocol-version").output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["semantic"], env!("CARGO_PKG_VERSION"));
    assert!(json["wire"].is_u64());
}

#[test]
fn test_missing_destination_is_usage_error() {
    rbcp().arg("/tmp/only-one").assert().failure().code(1);
}

/// Test that an invalid chunk policy is rejected at parse time
#[test]
fn test_invalid_chunk_policy() {
    rbcp()
        .args(["--chunk-policy", "adaptive:8MiB-1MiB", "/tmp/a", "/tmp/b"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("chunk-policy"));
}

#[test]
fn test_zero_streams_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    write_test_file(&src, 10);
    rbcp()
        .args(["--streams", "0"])
        .arg(&src)
        .arg(tmp.path().join("dst"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--streams"));
}

#[test]
fn test_local_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.bin");
    let dst = tmp.path().join("dst.bin");
    let data = write_test_file(&src, 200 * 1024 + 17);
    rbcp()
        .args(["--streams", "3", "--chunk-policy", "16KiB", "--summary"])
        .arg(&src)
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks verified: 13/13"));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    assert!(!sidecar::sidecar_path(&dst).exists());
}

/// Test that a destination ending in '/' receives the source file name
#[test]
fn test_local_copy_into_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("payload.bin");
    let out = tmp.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let data = write_test_file(&src, 5000);
    rbcp()
        .args(["--chunk-policy", "adaptive:1KiB-4KiB:1", "--checksum", "sha256"])
        .arg(&src)
        .arg(format!("{}/", out.display()))
        .assert()
        .success();
    assert_eq!(std::fs::read(out.join("payload.bin")).unwrap(), data);
}

#[test]
fn test_missing_source_fails() {
    let tmp = tempfile::tempdir().unwrap();
    rbcp()
        .arg(tmp.path().join("does-not-exist"))
        .arg(tmp.path().join("dst"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("does-not-exist"));
}

#[test]
fn test_resume_status_without_sidecar() {
    let tmp = tempfile::tempdir().unwrap();
    let dst = tmp.path().join("dst");
    rbcp()
        .arg("--resume-status")
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("no resume state"));
}

#[test]
fn test_resume_status_and_discard() {
    let tmp = tempfile::tempdir().unwrap();
    let dst = tmp.path().join("dst");
    let manifest = TransferManifest::new(
        std::path::Path::new("/src/file"),
        4096,
        ChunkPolicy::Fixed { size: 1024 },
        ChecksumAlgorithm::Crc32,
        2,
    );
    let digest = Digest::compute(ChecksumAlgorithm::Crc32, b"chunk");
    sidecar::Sidecar::create(
        &sidecar::sidecar_path(&dst),
        &manifest,
        &[(0, digest), (2, digest)],
    )
    .unwrap();
    rbcp()
        .arg("--resume-status")
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("verified chunks: 2/4"))
        .stdout(predicate::str::contains(&manifest.transfer_id));
    rbcp()
        .arg("--discard-resume")
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("discarded"));
    assert!(!sidecar::sidecar_path(&dst).exists());
}

#[test]
fn test_resume_flags_conflict() {
    rbcp()
        .args(["--resume-status", "/tmp/a", "--discard-resume", "/tmp/a"])
        .assert()
        .failure()
        .code(1);
}

/// Test that a daemon refuses destinations outside of --root
#[test]
fn test_daemon_rejects_destination_outside_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let src = tmp.path().join("src");
    write_test_file(&src, 1024);
    let (mut daemon, addr) = spawn_daemon(&root, &[]);
    let outside = tmp.path().join("elsewhere");
    rbcp()
        .arg(&src)
        .arg(format!("127.0.0.1:{}:{}", addr.port(), outside.display()))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("rejected"));
    let _ = daemon.kill();
    let _ = daemon.wait();
    assert!(!outside.exists());
}

#[test]
fn test_daemon_transfer() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let src = tmp.path().join("src");
    let data = write_test_file(&src, 64 * 1024);
    let (mut daemon, addr) = spawn_daemon(&root, &["--bind-ip", "127.0.0.1"]);
    let root = std::fs::canonicalize(&root).unwrap();
    rbcp()
        .args(["--streams", "2", "--chunk-policy", "8KiB"])
        .arg(&src)
        .arg(format!("127.0.0.1:{}:{}/", addr.port(), root.display()))
        .assert()
        .success();
    // without --keep-running the daemon exits after one transfer
    assert!(daemon.wait().unwrap().success());
    assert_eq!(std::fs::read(root.join("src")).unwrap(), data);
}

/// Test that --time-limit cancels resumably and a --resume rerun finishes the copy
#[test]
fn test_time_limit_then_resume() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.bin");
    let dst = tmp.path().join("dst.bin");
    let data = write_test_file(&src, 1024 * 1024);
    rbcp()
        .args([
            "--chunk-policy",
            "16KiB",
            "--bandwidth-limit",
            "64KiB",
            "--time-limit",
            "500ms",
        ])
        .arg(&src)
        .arg(&dst)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("cancelled"));
    assert!(sidecar::sidecar_path(&dst).exists());
    rbcp()
        .args(["--chunk-policy", "16KiB", "--resume", "--summary"])
        .arg(&src)
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks verified: 64/64"));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    assert!(!sidecar::sidecar_path(&dst).exists());
}

#[test]
fn test_chunk_policy_too_fine_for_file() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("sparse.bin");
    let file = std::fs::File::create(&src).unwrap();
    // sparse, nothing is read before the chunk count is checked
    file.set_len(16 * 1024 * 1024 * 1024).unwrap();
    rbcp()
        .args(["--chunk-policy", "1KiB"])
        .arg(&src)
        .arg(tmp.path().join("dst.bin"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("larger chunk size"));
    assert!(!tmp.path().join("dst.bin").exists());
}
