//! File-backed key-value store holding the site list.
//!
//! # Storage layout
//!
//! ```text
//! ~/.sitegate/               (mode 0700)
//!   storage.json             (mode 0600)
//!     {
//!       "sites": { "version": 1, "sites": [ SiteRecord, ... ] },
//!       ...other keys, preserved untouched...
//!     }
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home, used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::{SiteRecord, StoredSites};

/// Key the site list lives under inside `storage.json`.
pub const SITES_KEY: &str = "sites";

/// Newest schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

pub const STORAGE_FILE: &str = "storage.json";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredSitesCompat {
    Versioned(StoredSites),
    Legacy(Vec<SiteRecord>),
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.sitegate/`
pub fn sitegate_root(home: &Path) -> PathBuf {
    home.join(".sitegate")
}

/// `<home>/.sitegate/storage.json`, pure, no I/O.
pub fn storage_path_at(home: &Path) -> PathBuf {
    sitegate_root(home).join(STORAGE_FILE)
}

/// `storage_path_at` convenience wrapper.
pub fn storage_path() -> Result<PathBuf, StoreError> {
    Ok(storage_path_at(&home()?))
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load the site list.
///
/// A missing file or a missing `sites` key is an empty list. A legacy bare
/// array under `sites` is accepted and upgraded on the next save.
pub fn load_sites_at(home: &Path) -> Result<Vec<SiteRecord>, StoreError> {
    let path = storage_path_at(home);
    let document = read_document(&path)?;
    let Some(raw) = document.get(SITES_KEY) else {
        return Ok(vec![]);
    };

    let stored = StoredSitesCompat::deserialize(raw)
        .map_err(|source| StoreError::Parse { path: path.clone(), source })?;
    match stored {
        StoredSitesCompat::Versioned(stored) if stored.version > SCHEMA_VERSION => {
            Err(StoreError::UnsupportedVersion {
                path,
                found: stored.version,
                supported: SCHEMA_VERSION,
            })
        }
        StoredSitesCompat::Versioned(stored) => Ok(stored.sites),
        StoredSitesCompat::Legacy(sites) => Ok(sites),
    }
}

/// `load_sites_at` convenience wrapper.
pub fn load_sites() -> Result<Vec<SiteRecord>, StoreError> {
    load_sites_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically replace the site list, keeping every other key of the document.
///
/// Write flow: serialize → `storage.json.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_sites_at(home: &Path, sites: &[SiteRecord]) -> Result<(), StoreError> {
    let root = sitegate_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }

    let path = storage_path_at(home);
    let mut document = read_document(&path)?;
    let stored = StoredSites {
        version: SCHEMA_VERSION,
        sites: sites.to_vec(),
    };
    document.insert(SITES_KEY.to_owned(), serde_json::to_value(stored)?);

    let tmp_path = path.with_file_name(format!("{STORAGE_FILE}.tmp"));
    let json = serde_json::to_string_pretty(&Value::Object(document))?;
    std::fs::write(&tmp_path, json)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_sites_at` convenience wrapper.
pub fn save_sites(sites: &[SiteRecord]) -> Result<(), StoreError> {
    save_sites_at(&home()?, sites)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn read_document(path: &Path) -> Result<Map<String, Value>, StoreError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Domain;
    use chrono::Utc;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn record(domain: &str) -> SiteRecord {
        SiteRecord::new(Domain::from(domain), Utc::now())
    }

    #[test]
    fn storage_path_is_correct() {
        let home = make_home();
        assert!(storage_path_at(home.path()).ends_with(".sitegate/storage.json"));
    }

    #[test]
    fn load_missing_store_is_empty() {
        let home = make_home();
        assert!(load_sites_at(home.path()).expect("load").is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = make_home();
        let sites = vec![record("example.com"), record("news.ycombinator.com")];
        save_sites_at(home.path(), &sites).expect("save");
        assert_eq!(load_sites_at(home.path()).expect("load"), sites);
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        save_sites_at(home.path(), &[record("example.com")]).expect("save");
        let tmp = storage_path_at(home.path()).with_file_name("storage.json.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn store_dir_created_with_perms() {
        let home = make_home();
        save_sites_at(home.path(), &[]).expect("save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let root = sitegate_root(home.path());
            let mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
            let file = storage_path_at(home.path());
            let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(StoreError::HomeNotFound.to_string().contains("home directory"));
    }
}
