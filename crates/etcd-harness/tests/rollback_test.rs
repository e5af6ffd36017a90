//! Failure paths of `Harness::start`, exercised with shell scripts standing
//! in for etcd. These run without etcd installed.

#![cfg(unix)]

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use etcd_harness::{
    DiagnosticSink, Harness, HarnessConfig, HarnessError, HarnessState, ProbeConfig,
    binary_available,
};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Write an executable script named `etcd` into `dir`.
fn fake_etcd(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("etcd");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

fn fast_probe() -> ProbeConfig {
    ProbeConfig::new(5, Duration::from_millis(100))
}

#[tokio::test]
async fn absent_binary_fails_fast_without_side_effects() {
    let root = TempDir::new().unwrap();
    let binary = root.path().join("bin").join("etcd");
    assert!(!binary_available(binary.to_str().unwrap()));

    let config = HarnessConfig::new(binary.to_str().unwrap()).with_temp_root(root.path());
    let started = Instant::now();
    let err = Harness::start_with(config, DiagnosticSink::Discard)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::BinaryNotFound { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(entries(root.path()), 0, "no data dir may be created");
}

#[tokio::test]
async fn never_ready_server_times_out_and_is_rolled_back() {
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let pid_file = bin.path().join("pid");
    // `exec` keeps the pid, so the recorded pid is the process the harness owns.
    let binary = fake_etcd(bin.path(), "echo $$ > \"$FAKE_ETCD_PID_FILE\"\nexec sleep 60");

    let config = HarnessConfig::new(binary.to_str().unwrap())
        .with_temp_root(root.path())
        .with_probe(fast_probe())
        .with_env("FAKE_ETCD_PID_FILE", pid_file.to_str().unwrap());

    let mut harness = Harness::new(config);
    let started = Instant::now();
    let err = harness.launch(DiagnosticSink::Discard).await.unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        HarnessError::ReadinessTimeout { attempts, .. } => assert_eq!(*attempts, 5),
        other => panic!("expected ReadinessTimeout, got {other:?}"),
    }
    assert!(
        elapsed < fast_probe().budget() + Duration::from_secs(2),
        "took {elapsed:?}"
    );
    assert_eq!(harness.state(), HarnessState::Failed);
    assert!(harness.client().is_none());
    assert!(harness.pid().is_none());
    assert!(harness.data_dir().is_none());
    assert_eq!(entries(root.path()), 0, "data dir must be rolled back");

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .expect("fake etcd should have recorded its pid")
        .trim()
        .parse()
        .unwrap();
    assert!(!alive(pid), "fake etcd {pid} must be killed on rollback");

    // Stopping a failed harness is allowed, twice.
    harness.stop().await;
    harness.stop().await;
    assert_eq!(harness.state(), HarnessState::Stopped);
}

#[tokio::test]
async fn crashing_server_stderr_reaches_the_sink() {
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let binary = fake_etcd(
        bin.path(),
        "echo \"fake etcd got $# args\" >&2\necho ignored-stdout\nexit 1",
    );
    let captured = Captured::default();

    let config = HarnessConfig::new(binary.to_str().unwrap())
        .with_temp_root(root.path())
        .with_probe(fast_probe());
    let err = Harness::start_with(config, DiagnosticSink::writer(captured.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::ReadinessTimeout { .. }), "got {err:?}");
    let text = captured.text();
    assert!(text.contains("fake etcd got 9 args"), "sink got {text:?}");
    assert!(!text.contains("ignored-stdout"), "stdout must be discarded");
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn server_sees_its_own_data_dir() {
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let binary = fake_etcd(
        bin.path(),
        "for arg in \"$@\"; do echo \"$arg\" >&2; done\necho \"cwd=$(pwd)\" >&2\nexit 0",
    );
    let captured = Captured::default();

    let config = HarnessConfig::new(binary.to_str().unwrap())
        .with_temp_root(root.path())
        .with_probe(ProbeConfig::new(2, Duration::from_millis(50)));
    Harness::start_with(config, DiagnosticSink::writer(captured.clone()))
        .await
        .unwrap_err();

    let text = captured.text();
    let data_dir_arg = text
        .lines()
        .find_map(|l| l.strip_prefix("--data-dir="))
        .expect("data dir flag passed");
    let cwd = text
        .lines()
        .find_map(|l| l.strip_prefix("cwd="))
        .expect("cwd printed");
    assert!(
        Path::new(data_dir_arg).starts_with(root.path()),
        "{data_dir_arg} not under temp root"
    );
    assert!(
        Path::new(data_dir_arg)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("etcd_testserver")
    );
    assert_eq!(
        Path::new(cwd).file_name(),
        Path::new(data_dir_arg).file_name()
    );
    assert!(text.contains("--force-new-cluster=true"));
    assert!(text.lines().any(|l| l.starts_with("--listen-client-urls=http://127.0.0.1:")));
}

#[tokio::test]
async fn stop_after_failed_launch_against_dead_server() {
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    // Exits straight away, so rollback kills a process that is already gone.
    let binary = fake_etcd(bin.path(), "exit 0");
    let captured = Captured::default();

    let config = HarnessConfig::new(binary.to_str().unwrap())
        .with_temp_root(root.path())
        .with_probe(ProbeConfig::new(3, Duration::from_millis(50)));
    let mut harness = Harness::new(config);
    let err = harness
        .launch(DiagnosticSink::writer(captured.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ReadinessTimeout { .. }));

    harness.stop().await;
    assert_eq!(harness.state(), HarnessState::Stopped);
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn unexecutable_binary_rolls_back_data_dir() {
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    // Executable bit set but no shebang or ELF header: exec fails with ENOEXEC.
    let binary = bin.path().join("etcd");
    std::fs::write(&binary, "this is not a program\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    assert!(binary_available(binary.to_str().unwrap()));

    let config = HarnessConfig::new(binary.to_str().unwrap()).with_temp_root(root.path());
    let mut harness = Harness::new(config);
    let err = harness.launch(DiagnosticSink::Discard).await.unwrap_err();

    assert!(matches!(err, HarnessError::Launch { .. }), "got {err:?}");
    assert_eq!(harness.state(), HarnessState::Failed);
    assert!(harness.pid().is_none());
    assert!(harness.data_dir().is_none());
    assert_eq!(entries(root.path()), 0, "data dir created before spawn must be removed");
}

#[tokio::test]
async fn failed_dir_removal_is_written_to_the_sink() {
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } == 0 {
        eprintln!("running as root, permissions cannot block removal, skipping");
        return;
    }
    let bin = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    // Leaves a file inside a read-only directory, which remove_dir_all cannot delete.
    let binary = fake_etcd(
        bin.path(),
        "mkdir locked && touch locked/file && chmod 555 locked\nexec sleep 60",
    );
    let captured = Captured::default();

    let config = HarnessConfig::new(binary.to_str().unwrap())
        .with_temp_root(root.path())
        .with_probe(fast_probe());
    let err = Harness::start_with(config, DiagnosticSink::writer(captured.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ReadinessTimeout { .. }), "got {err:?}");

    let text = captured.text();
    assert!(
        text.contains("etcd-harness: failed clearing temporary dir"),
        "sink got {text:?}"
    );

    for entry in std::fs::read_dir(root.path()).unwrap() {
        let locked = entry.unwrap().path().join("locked");
        if locked.exists() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
}
