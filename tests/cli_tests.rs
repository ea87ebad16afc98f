use assert_cmd::Command;
use kitsmith::emit::ManifestDocument;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const FIXTURE: &str = include_str!("fixtures/toolkits.toml");

fn write_fixture(dir: &Path) {
    fs::write(dir.join("toolkits.toml"), FIXTURE).unwrap();
}

fn kitsmith() -> Command {
    Command::cargo_bin("kitsmith").unwrap()
}

#[test]
fn test_split_writes_both_modes() {
    let dir = tempdir().unwrap();
    let dir_path = dir.path();
    write_fixture(dir_path);

    kitsmith()
        .current_dir(dir_path)
        .args(["split", "--name", "basic"])
        .assert()
        .success();

    let online = fs::read_to_string(dir_path.join("toolkit-manifest/online/basic.toml")).unwrap();
    let offline = fs::read_to_string(dir_path.join("toolkit-manifest/offline/basic.toml")).unwrap();
    assert!(online.starts_with("# This file was automatically generated"));
    assert!(online.contains("url = "));
    assert!(!online.contains("path = "));
    assert!(!offline.contains("url = "));
    assert!(offline.contains(r#"offline-dist-server = "toolchain""#));
    assert!(offline.contains(r#"path = "tools/cargo-nextest-0.9.87-x86_64-pc-windows-gnu.zip""#));
    assert!(offline.contains("Visual Studio Build Tools (MSVC)"));
}

#[test]
fn test_split_is_deterministic() {
    let dir = tempdir().unwrap();
    let dir_path = dir.path();
    write_fixture(dir_path);

    let run = |out: &str| {
        kitsmith()
            .current_dir(dir_path)
            .args(["split", "--out", out])
            .assert()
            .success();
    };
    run("first");
    run("second");
    for file in ["online/basic.toml", "offline/basic.toml", "online/community.toml"] {
        let first = fs::read(dir_path.join("first").join(file)).unwrap();
        let second = fs::read(dir_path.join("second").join(file)).unwrap();
        assert_eq!(first, second, "{file}");
    }
}

#[test]
fn test_unknown_toolkit_fails() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());

    kitsmith()
        .current_dir(dir.path())
        .args(["split", "--name", "missing"])
        .assert()
        .failure();
}

#[test]
fn test_missing_config_fails() {
    let dir = tempdir().unwrap();
    kitsmith()
        .current_dir(dir.path())
        .arg("list")
        .assert()
        .failure();
}

#[test]
fn test_vendor_requires_target() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());
    kitsmith()
        .current_dir(dir.path())
        .args(["vendor", "--name", "basic"])
        .assert()
        .failure();
}

#[test]
fn test_vendor_unknown_target_fails() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());
    kitsmith()
        .current_dir(dir.path())
        .args(["vendor", "--name", "basic", "--target", "riscv64gc-unknown-linux-gnu"])
        .assert()
        .failure();
}

#[test]
fn test_list() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());

    let output = kitsmith()
        .current_dir(dir.path())
        .arg("list")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let output_str = String::from_utf8_lossy(&output);
    assert!(output_str.contains("Example-Toolkit-1.0.0"));
    assert!(output_str.contains("x86_64-pc-windows-gnu [cli]"));
    let basic = output_str.find("Example-Toolkit").unwrap();
    let community = output_str.find("Community-Toolkit").unwrap();
    assert!(basic < community);
}

#[test]
fn test_resolve_json() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());

    let output = kitsmith()
        .current_dir(dir.path())
        .args(["resolve", "--name", "basic", "--target", "x86_64-pc-windows-gnu", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let table: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(table["cargo-nextest"]["version"], "0.9.87");
    assert_eq!(table["cargo-nextest"]["optional"], true);
    assert_eq!(table["mingw64"]["required"], true);
    assert!(table.get("rust-docs").is_some());
}

#[test]
fn test_dist_without_vendor_fails() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());

    let assert = kitsmith()
        .current_dir(dir.path())
        .args(["dist", "--name", "basic", "--target", "x86_64-unknown-linux-gnu"])
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("vendor"));
}

#[test]
fn test_clean_without_packages() {
    let dir = tempdir().unwrap();
    write_fixture(dir.path());

    kitsmith()
        .current_dir(dir.path())
        .args(["clean", "--name", "basic"])
        .assert()
        .success();
}

const LINUX: &str = "x86_64-unknown-linux-gnu";
const MSVC: &str = "x86_64-pc-windows-msvc";

/// Two targets, one required tool with a URL per target.
fn write_vendor_config(dir: &Path, server: &str) {
    let content = format!(
        r#"
[config]
rust-server = "{server}/rust"
rustup-server = "{server}/rustup"
package-dir = "packages"
targets = ["{LINUX}", "{MSVC}"]

[config.fetch]
retries = 1
backoff-ms = 1

[toolkit.kit.config]
date = "2024-11-28"

[toolkit.kit.value]
name = "Kit"
version = "0.1"

[toolkit.kit.value.rust]
version = "1.83.0"

[toolkit.kit.value.tools.descriptions]
req = "a tool every install needs"

[toolkit.kit.value.tools.default]
req = {{ version = "1.0", required = true }}

[toolkit.kit.value.tools.target.{LINUX}]
req = {{ url = "{server}/files/req-linux.tar.gz" }}

[toolkit.kit.value.tools.target.{MSVC}]
req = {{ url = "{server}/files/req-msvc.zip" }}
"#
    );
    fs::write(dir.join("toolkits.toml"), content).unwrap();
}

fn read_manifest(dir: &Path, mode: &str) -> ManifestDocument {
    let path = dir.join("toolkit-manifest").join(mode).join("kit.toml");
    toml::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn vendor_linux(dir: &Path) -> assert_cmd::assert::Assert {
    kitsmith()
        .current_dir(dir)
        .args(["vendor", "--name", "kit", "--target", LINUX, "--no-toolchain"])
        .assert()
}

#[test]
fn test_vendor_one_target_writes_every_target() {
    let mut server = mockito::Server::new();
    let dir = tempdir().unwrap();
    write_vendor_config(dir.path(), &server.url());
    let rustup = server
        .mock("GET", format!("/rustup/dist/{LINUX}/rustup-init").as_str())
        .with_body("rustup")
        .create();
    let req = server
        .mock("GET", "/files/req-linux.tar.gz")
        .with_body("req")
        .create();

    vendor_linux(dir.path()).success();
    rustup.assert();
    req.assert();

    let root = dir.path().join("packages").join("Kit-0.1").join(LINUX);
    assert_eq!(fs::read_to_string(root.join("tools/req-linux.tar.gz")).unwrap(), "req");

    let offline = read_manifest(dir.path(), "offline");
    let linux = &offline.tools.target[LINUX]["req"];
    assert_eq!(linux.path.as_deref(), Some("tools/req-linux.tar.gz"));
    assert!(linux.required);
    assert_eq!(
        offline.tools.target[MSVC]["req"].path.as_deref(),
        Some("tools/req-msvc.zip")
    );
    assert_eq!(offline.rust.rustup[LINUX], "tools/rustup-init");
    assert_eq!(offline.rust.rustup[MSVC], "tools/rustup-init.exe");

    let online = read_manifest(dir.path(), "online");
    assert_eq!(online.tools.target.len(), 2);
    assert!(online.tools.target[MSVC]["req"].url.is_some());
}

#[test]
fn test_vendor_failed_required_tool_keeps_manifest_entry() {
    let mut server = mockito::Server::new();
    let dir = tempdir().unwrap();
    write_vendor_config(dir.path(), &server.url());
    let _rustup = server
        .mock("GET", format!("/rustup/dist/{LINUX}/rustup-init").as_str())
        .with_body("rustup")
        .create();
    let req = server
        .mock("GET", "/files/req-linux.tar.gz")
        .with_status(404)
        .create();

    let assert = vendor_linux(dir.path()).failure();
    req.assert();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("req"), "{stderr}");

    let offline = read_manifest(dir.path(), "offline");
    assert_eq!(
        offline.tools.target[LINUX]["req"].path.as_deref(),
        Some("tools/req-linux.tar.gz")
    );
    assert!(offline.tools.target.contains_key(MSVC));
    assert_eq!(offline.rust.rustup.len(), 2);
}
