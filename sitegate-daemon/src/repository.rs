//! Async access to the site store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use sitegate_core::{store, SiteRecord, StoreError};

#[async_trait]
pub trait SiteRepository: Send + Sync {
    async fn load(&self) -> Result<Vec<SiteRecord>, StoreError>;
    async fn save(&self, sites: &[SiteRecord]) -> Result<(), StoreError>;
}

/// `~/.sitegate/storage.json`, with blocking file I/O moved off the runtime.
#[derive(Debug, Clone)]
pub struct FileRepository {
    home: PathBuf,
}

impl FileRepository {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }
}

#[async_trait]
impl SiteRepository for FileRepository {
    async fn load(&self) -> Result<Vec<SiteRecord>, StoreError> {
        let home = self.home.clone();
        tokio::task::spawn_blocking(move || store::load_sites_at(&home))
            .await
            .map_err(join_err)?
    }

    async fn save(&self, sites: &[SiteRecord]) -> Result<(), StoreError> {
        let home = self.home.clone();
        let sites = sites.to_vec();
        tokio::task::spawn_blocking(move || store::save_sites_at(&home, &sites))
            .await
            .map_err(join_err)?
    }
}

fn join_err(err: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::other(format!("store task join error: {err}")))
}

/// In-process store for tests and dry runs. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    sites: Mutex<Vec<SiteRecord>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn with_sites(sites: Vec<SiteRecord>) -> Self {
        Self {
            sites: Mutex::new(sites),
            ..Self::default()
        }
    }

    /// Make every subsequent `save` return a [`StoreError::Io`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<SiteRecord> {
        self.sites.lock().await.clone()
    }

    /// Overwrite the contents as an outside writer would, bypassing the gate.
    pub async fn replace(&self, sites: Vec<SiteRecord>) {
        *self.sites.lock().await = sites;
    }
}

#[async_trait]
impl SiteRepository for MemoryRepository {
    async fn load(&self) -> Result<Vec<SiteRecord>, StoreError> {
        Ok(self.sites.lock().await.clone())
    }

    async fn save(&self, sites: &[SiteRecord]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other(
                "simulated storage write failure",
            )));
        }
        *self.sites.lock().await = sites.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
