//! Site store error-message, atomic-write-safety, and compatibility tests.
//! Storage: ~/.sitegate/storage.json, site list under the "sites" key.

use assert_fs::prelude::*;
use chrono::Utc;
use predicates::prelude::predicate;
use sitegate_core::{
    store::{self, SCHEMA_VERSION},
    Domain, SiteRecord, StoreError,
};
use std::fs;

fn record(domain: &str) -> SiteRecord {
    SiteRecord::new(Domain::from(domain), Utc::now())
}

fn write_raw(home: &assert_fs::TempDir, contents: &str) {
    home.child(".sitegate/storage.json")
        .write_str(contents)
        .expect("write storage");
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_corrupt_json_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_raw(&home, "{ \"sites\": [ unclosed");

    let err = store::load_sites_at(home.path()).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("storage.json"), "must contain file path, got: {err}");
}

#[test]
fn load_wrong_shape_returns_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_raw(&home, r#"{ "sites": "not a list" }"#);

    let err = store::load_sites_at(home.path()).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
}

#[test]
fn load_future_schema_version_is_rejected() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_raw(&home, r#"{ "sites": { "version": 99, "sites": [] } }"#);

    let err = store::load_sites_at(home.path()).unwrap_err();
    match err {
        StoreError::UnsupportedVersion { found, supported, .. } => {
            assert_eq!(found, 99);
            assert_eq!(supported, SCHEMA_VERSION);
        }
        other => panic!("expected UnsupportedVersion, got: {other}"),
    }
}

// ---------------------------------------------------------------------------
// 2. Compatibility
// ---------------------------------------------------------------------------

#[test]
fn legacy_bare_array_is_read_and_upgraded_on_save() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_raw(
        &home,
        r#"{ "sites": [
            { "domain": "youtube.com", "enabled": true, "added": "2025-03-01T10:00:00.000Z" },
            { "domain": "reddit.com", "enabled": false, "disabledUntil": "2025-03-01T10:01:00.000Z" }
        ] }"#,
    );

    let sites = store::load_sites_at(home.path()).expect("load legacy");
    assert_eq!(sites.len(), 2);
    assert_eq!(sites[0].domain, Domain::from("youtube.com"));
    assert!(sites[1].disabled_until.is_some());

    store::save_sites_at(home.path(), &sites).expect("save");
    let raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(store::storage_path_at(home.path())).unwrap())
            .expect("json");
    assert_eq!(raw["sites"]["version"], serde_json::json!(SCHEMA_VERSION));
}

#[test]
fn save_preserves_foreign_keys() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_raw(&home, r#"{ "language": "ru", "sites": [] }"#);

    store::save_sites_at(home.path(), &[record("example.com")]).expect("save");

    let raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(store::storage_path_at(home.path())).unwrap())
            .expect("json");
    assert_eq!(raw["language"], serde_json::json!("ru"));
    assert_eq!(store::load_sites_at(home.path()).expect("load").len(), 1);
}

#[test]
fn document_without_sites_key_is_empty() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_raw(&home, r#"{ "language": "en" }"#);
    assert!(store::load_sites_at(home.path()).expect("load").is_empty());
}

// ---------------------------------------------------------------------------
// 3. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_creates_store_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    store::save_sites_at(home.path(), &[record("example.com")]).expect("save");
    home.child(".sitegate/storage.json").assert(predicate::path::exists());
    home.child(".sitegate/storage.json.tmp").assert(predicate::path::missing());
}

#[test]
fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    store::save_sites_at(home.path(), &[record("example.com")]).expect("save");

    let path = store::storage_path_at(home.path());
    let original_bytes = fs::read(&path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = path.with_file_name("storage.json.tmp");
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    assert_eq!(original_bytes, fs::read(&path).expect("read after crash"));
    let sites = store::load_sites_at(home.path()).expect("load after crash");
    assert_eq!(sites[0].domain, Domain::from("example.com"));
}

#[test]
fn save_replaces_previous_list() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    store::save_sites_at(home.path(), &[record("a-site.com"), record("b-site.com")]).expect("save");
    store::save_sites_at(home.path(), &[record("c-site.com")]).expect("save again");

    let sites = store::load_sites_at(home.path()).expect("load");
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].domain, Domain::from("c-site.com"));
}
