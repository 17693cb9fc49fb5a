//! Persistent key-value store shared with other BMC components.
//!
//! healthd owns two keys: [`BMC_HEALTH_KEY`] (`"1"` healthy, `"0"` unhealthy)
//! and [`VBOOT_ERROR_KEY`] (`"(type,code)"` of the last verified-boot error).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{HealthError, Result};

pub const BMC_HEALTH_KEY: &str = "bmc_health";
pub const VBOOT_ERROR_KEY: &str = "vboot_error";

pub const HEALTHY: &str = "1";
pub const NOT_HEALTHY: &str = "0";

/// Default location of the file-backed store on OpenBMC images.
pub const DEFAULT_KV_DIR: &str = "/mnt/data/kv_store";

/// Get/set access to the persistent store.
pub trait KvStore: Send + Sync {
    /// Read a key. `Ok(None)` when the key has never been written.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Seed keys other components expect to exist.
pub fn set_default_key_values(store: &dyn KvStore) -> Result<()> {
    if store.get(BMC_HEALTH_KEY)?.is_none() {
        store.set(BMC_HEALTH_KEY, HEALTHY)?;
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.starts_with('.') {
        return Err(HealthError::Kv {
            key: key.to_string(),
            detail: "invalid key name".to_string(),
        });
    }
    Ok(())
}

/// One file per key under a directory.
///
/// Writes go to a sibling temp file which is then renamed over the key, so
/// readers in other processes never observe a torn value.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        match std::fs::read_to_string(self.dir.join(key)) {
            Ok(value) => Ok(Some(value.trim_end_matches('\n').to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(key))?;
        Ok(())
    }
}

/// In-memory store that remembers every write, in order.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<MemoryKvInner>,
}

#[derive(Debug, Default)]
struct MemoryKvInner {
    values: HashMap<String, String>,
    writes: Vec<(String, String)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(key, value)` writes so far.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.inner.lock().writes.clone()
    }

    /// Writes to a single key, oldest first.
    pub fn writes_for(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.values.insert(key.to_string(), value.to_string());
        inner.writes.push((key.to_string(), value.to_string()));
        Ok(())
    }
}
