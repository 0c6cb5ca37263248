//! Integration tests for the `mdfstore` binary.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

/// Run `mdfstore` against `dir`, isolated from the user's config files.
fn mdfstore(dir: &Path, args: &[&str]) -> Output {
    mdfstore_with_stdin(dir, args, b"")
}

fn mdfstore_with_stdin(dir: &Path, args: &[&str], stdin: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_mdfstore"))
        .arg("--upload-dir")
        .arg(dir.join("uploads"))
        .args(args)
        .current_dir(dir)
        .env("HOME", dir)
        .env_remove("MDF_UPLOAD_DIR")
        .env_remove("MDF_CONVERTER")
        .env_remove("MDF_CONVERTER_INTERPRETER")
        .env_remove("MDF_SETTLE_DELAY_MS")
        .env_remove("MDF_LOG_LEVEL")
        .env("MDF_LOG", "error")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start mdfstore");

    child.stdin.take().unwrap().write_all(stdin).unwrap();
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "mdfstore failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn setup() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("uploads")).unwrap();
    temp
}

#[test]
fn test_init_prints_default_config() {
    let temp = setup();
    let out = stdout(&mdfstore(temp.path(), &["init"]));
    assert!(out.contains("[storage]"));
    assert!(out.contains("[converter]"));
    assert!(out.contains("settle_delay_ms = 500"));
}

#[test]
fn test_create_write_read_info() {
    let temp = setup();

    let id = stdout(&mdfstore(
        temp.path(),
        &["create", "--id", "u1", "--size", "15", "--meta", "filename=a.mdf"],
    ));
    assert_eq!(id.trim(), "u1");

    stdout(&mdfstore_with_stdin(temp.path(), &["write", "u1"], b"0123456789"));
    let part = temp.path().join("part");
    std::fs::write(&part, "abcde").unwrap();
    stdout(&mdfstore(temp.path(), &["write", "u1", part.to_str().unwrap()]));

    let content = mdfstore(temp.path(), &["read", "u1"]);
    assert_eq!(content.stdout, b"0123456789abcde");

    let info: serde_json::Value =
        serde_json::from_str(&stdout(&mdfstore(temp.path(), &["info", "u1"]))).unwrap();
    assert_eq!(info["ID"], "u1");
    assert_eq!(info["Size"], 15);
    assert_eq!(info["Offset"], 15);
    assert_eq!(info["MetaData"]["filename"], "a.mdf");
}

#[test]
fn test_create_generates_id() {
    let temp = setup();
    let id = stdout(&mdfstore(temp.path(), &["create", "--defer"]));
    let id = id.trim();
    assert_eq!(id.len(), 32);
    assert!(temp.path().join("uploads").join(format!("{}.bin", id)).exists());
}

#[test]
fn test_create_requires_size_or_defer() {
    let temp = setup();
    assert!(!mdfstore(temp.path(), &["create"]).status.success());
}

#[test]
fn test_declare_length() {
    let temp = setup();
    stdout(&mdfstore(temp.path(), &["create", "--id", "d", "--defer"]));
    stdout(&mdfstore(temp.path(), &["declare-length", "d", "42"]));

    let info: serde_json::Value =
        serde_json::from_str(&stdout(&mdfstore(temp.path(), &["info", "d"]))).unwrap();
    assert_eq!(info["Size"], 42);
    assert_eq!(info["SizeIsDeferred"], false);
}

#[test]
fn test_concat_and_terminate() {
    let temp = setup();
    for (id, data) in [("a", "first-"), ("b", "second")] {
        stdout(&mdfstore(temp.path(), &["create", "--id", id, "--size", "6"]));
        stdout(&mdfstore_with_stdin(temp.path(), &["write", id, "-"], data.as_bytes()));
    }
    stdout(&mdfstore(temp.path(), &["create", "--id", "final", "--defer"]));

    stdout(&mdfstore(temp.path(), &["concat", "final", "a", "b"]));
    let out = temp.path().join("out.bin");
    stdout(&mdfstore(
        temp.path(),
        &["read", "final", "--out", out.to_str().unwrap()],
    ));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "first-second");

    stdout(&mdfstore(temp.path(), &["terminate", "a"]));
    let missing = mdfstore(temp.path(), &["info", "a"]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("upload not found"));
}

#[test]
fn test_lock_status_and_held_lock() {
    let temp = setup();
    stdout(&mdfstore(temp.path(), &["create", "--id", "l", "--size", "1"]));

    assert_eq!(stdout(&mdfstore(temp.path(), &["lock", "l"])).trim(), "l: free");

    // the lock is held while the command runs
    let lock_path = temp.path().join("uploads/l.lock");
    let check = format!("test -e {}", lock_path.display());
    stdout(&mdfstore(temp.path(), &["lock", "l", "--", "sh", "-c", &check]));
    assert!(!lock_path.exists());

    let failed = mdfstore(temp.path(), &["lock", "l", "--", "sh", "-c", "exit 4"]);
    assert!(!failed.status.success());
    assert!(!lock_path.exists());
}

#[test]
fn test_unlock_stale_lock_file() {
    let temp = setup();
    let lock_path = temp.path().join("uploads/s.lock");
    std::fs::write(&lock_path, "4194304").unwrap();

    stdout(&mdfstore(temp.path(), &["unlock", "s"]));
    assert!(!lock_path.exists());
}

#[test]
fn test_finish_runs_converter() {
    let temp = setup();
    let script = temp.path().join("convert.sh");
    std::fs::write(&script, "echo \"converted $1\"\n").unwrap();
    let config = temp.path().join("config.toml");
    std::fs::write(
        &config,
        format!(
            "[converter]\nprogram = \"{}\"\ninterpreter = \"sh\"\nsettle_delay_ms = 0\n",
            script.display()
        ),
    )
    .unwrap();
    let config = config.to_str().unwrap();

    stdout(&mdfstore(temp.path(), &["--config", config, "create", "--id", "f", "--size", "0"]));
    let out = stdout(&mdfstore(temp.path(), &["--config", config, "finish", "f"]));
    assert!(out.contains("1 stdout lines"));
}

#[test]
fn test_finish_without_converter() {
    let temp = setup();
    stdout(&mdfstore(temp.path(), &["create", "--id", "f", "--size", "0"]));
    let out = stdout(&mdfstore(temp.path(), &["finish", "f"]));
    assert!(out.contains("no converter configured"));

    assert!(!mdfstore(temp.path(), &["finish", "ghost"]).status.success());
}

#[test]
fn test_capabilities() {
    let temp = setup();
    let out = stdout(&mdfstore(temp.path(), &["capabilities"]));
    let names: Vec<_> = out.lines().collect();
    assert_eq!(names.len(), 7);
    assert!(names.contains(&"locker"));
    assert!(names.contains(&"concater"));
}

#[test]
fn test_missing_upload_dir() {
    let temp = TempDir::new().unwrap();
    let output = mdfstore(temp.path(), &["create", "--size", "1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}
