use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon \
                      abandon abandon about";

fn run_rv<I, S>(args: I, phrase: Option<&str>) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_rv"));
    command.args(args).env_remove("RV_API").env_remove("RV_STATE").env_remove("RV_STORAGE_DIR");
    match phrase {
        Some(phrase) => command.env("RV_PHRASE", phrase),
        None => command.env_remove("RV_PHRASE"),
    };
    command.output().unwrap_or_else(|err| panic!("failed to execute rv binary: {err}"))
}

fn run_json<I, S>(args: I, phrase: Option<&str>) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rv(args, phrase);
    if !output.status.success() {
        panic!(
            "rv command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", parent.display()));
    }
    fs::write(path, content)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn as_u64(value: &Value, pointer: &str) -> u64 {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

#[test]
fn identity_new_prints_the_phrase_once_and_never_stores_it() {
    let dir = temp_dir();
    let state = dir.path().join("identity.json");
    let created = run_json(["--state", path_str(&state), "identity", "new"], None);
    let mnemonic = as_str(&created, "/mnemonic");
    assert_eq!(mnemonic.split_whitespace().count(), 12);
    assert_eq!(as_str(&created, "/contract_version"), "cli.v1");

    let stored = fs::read_to_string(&state).unwrap_or_else(|err| panic!("state missing: {err}"));
    assert!(!stored.contains(mnemonic));

    let shown = run_json(["--state", path_str(&state), "identity", "show"], None);
    assert_eq!(as_str(&shown, "/identity/agent_id"), as_str(&created, "/identity/agent_id"));
}

#[test]
fn derive_is_deterministic_and_rejects_bad_phrases() {
    let dir = temp_dir();
    let state = dir.path().join("identity.json");
    let first = run_json(["--state", path_str(&state), "identity", "derive"], Some(PHRASE));
    let second =
        run_json(["--state", path_str(&state), "identity", "derive", "--save"], Some(PHRASE));
    assert_eq!(as_str(&first, "/identity/agent_id"), as_str(&second, "/identity/agent_id"));
    assert!(state.exists());

    let bad = run_rv(["--state", path_str(&state), "identity", "derive"], Some("abandon abandon"));
    assert!(!bad.status.success());
    assert!(String::from_utf8_lossy(&bad.stderr).contains("invalid mnemonic"));
}

#[test]
fn offline_backup_chain_and_restore_through_storage_mirror() {
    let dir = temp_dir();
    let storage = dir.path().join("storage");
    let memory = dir.path().join("memory");
    let state = dir.path().join("identity.json");
    write_file(&memory.join("MEMORY.md"), "first");
    write_file(&memory.join("journal/day1.md"), "hello");

    let common = ["--state", path_str(&state), "--storage-dir", path_str(&storage)];
    let create = ["backup", "create", "--dir", path_str(&memory)];
    let first = run_json(common.iter().copied().chain(create), Some(PHRASE));
    assert_eq!(as_u64(&first, "/backup_seq"), 1);

    write_file(&memory.join("MEMORY.md"), "second");
    let second = run_json(common.iter().copied().chain(create), Some(PHRASE));
    assert_eq!(as_u64(&second, "/backup_seq"), 2);

    let listed = run_json(common.iter().copied().chain(["backup", "list"]), None);
    assert_eq!(as_str(&listed, "/source"), "storage");
    assert_eq!(as_u64(&listed, "/backups/0/backup_seq"), 2);
    assert_eq!(as_u64(&listed, "/backups/1/backup_seq"), 1);

    let fresh_state = dir.path().join("restored-identity.json");
    let out = dir.path().join("restored");
    let restored = run_json(
        [
            "--state",
            path_str(&fresh_state),
            "--storage-dir",
            path_str(&storage),
            "restore",
            "--out",
            path_str(&out),
        ],
        Some(PHRASE),
    );
    assert_eq!(as_u64(&restored, "/backups_found"), 2);
    assert_eq!(as_u64(&restored, "/backup_seq"), 2);
    assert_eq!(as_str(&restored, "/source"), "storage");
    let content = fs::read_to_string(out.join("MEMORY.md"))
        .unwrap_or_else(|err| panic!("restore missing: {err}"));
    assert_eq!(content, "second");
    assert!(out.join("journal").join("day1.md").exists());

    let shown = run_json(["--state", path_str(&fresh_state), "identity", "show"], None);
    assert_eq!(as_u64(&shown, "/last_backup_seq"), 2);
    assert!(shown.pointer("/recall_cache_expires_at").and_then(Value::as_i64).is_some());
}

#[test]
fn selective_restore_writes_only_the_requested_file() {
    let dir = temp_dir();
    let storage = dir.path().join("storage");
    let memory = dir.path().join("memory");
    let state = dir.path().join("identity.json");
    write_file(&memory.join("MEMORY.md"), "core");
    write_file(&memory.join("notes.md"), "side");

    run_json(
        [
            "--state",
            path_str(&state),
            "--storage-dir",
            path_str(&storage),
            "backup",
            "create",
            "--dir",
            path_str(&memory),
        ],
        Some(PHRASE),
    );
    let out = dir.path().join("restored");
    let restored = run_json(
        [
            "--state",
            path_str(&state),
            "--storage-dir",
            path_str(&storage),
            "restore",
            "--file",
            "notes.md",
            "--out",
            path_str(&out),
        ],
        Some(PHRASE),
    );
    assert_eq!(as_str(&restored, "/restored_files/0/name"), "notes.md");
    assert!(out.join("notes.md").exists());
    assert!(!out.join("MEMORY.md").exists());
}

#[test]
fn restore_with_no_backups_succeeds_empty() {
    let dir = temp_dir();
    let storage = dir.path().join("storage");
    let state = dir.path().join("identity.json");
    let restored = run_json(
        ["--state", path_str(&state), "--storage-dir", path_str(&storage), "restore"],
        Some(PHRASE),
    );
    assert_eq!(as_u64(&restored, "/backups_found"), 0);
    assert!(restored.pointer("/backup_seq").is_some_and(Value::is_null));
}

#[test]
fn service_commands_need_an_api_url() {
    let dir = temp_dir();
    let state = dir.path().join("identity.json");
    let output = run_rv(["--state", path_str(&state), "heartbeat"], Some(PHRASE));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--api"));
}
