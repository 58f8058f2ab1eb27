//! Zip containers holding partitions as entries.
//!
//! A [`ZipContainer`] is a long-lived handle on one archive file. Reads open
//! the archive afresh, so they always observe a complete archive. Writes are
//! serialized per container and rewrite the archive into a temporary file
//! that atomically replaces the original; readers of other entries are never
//! exposed to a half-written archive.
//!
//! [`ContainerCache`] shares one handle per container path across callers.

use crate::error::{ArchiveError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Handle on one zip container file.
#[derive(Debug)]
pub struct ZipContainer {
    /// Path of the archive file.
    path: PathBuf,
    /// Entry name to uncompressed size.
    index: RwLock<BTreeMap<String, u64>>,
    /// Serializes archive rewrites.
    write_lock: Mutex<()>,
}

impl ZipContainer {
    /// Opens a container.
    ///
    /// With `create` unset, a missing archive or parent directory is
    /// `NotFound`. With `create` set, missing parent directories are created
    /// and the archive itself is written on the first entry update.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let index = if path.exists() {
            read_index(path)?
        } else if create {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            BTreeMap::new()
        } else {
            return Err(ArchiveError::NotFound(format!(
                "container {}",
                path.display()
            )));
        };

        Ok(Self {
            path: path.to_path_buf(),
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the entry exists.
    pub fn contains(&self, name: &str) -> bool {
        self.read_index().contains_key(name)
    }

    /// Returns the uncompressed size of an entry.
    pub fn entry_size(&self, name: &str) -> Option<u64> {
        self.read_index().get(name).copied()
    }

    /// Returns all entries whose name starts with `prefix`, with their sizes.
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, u64)> {
        self.read_index()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, size)| (name.clone(), *size))
            .collect()
    }

    /// Reads an entry fully into memory.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        self.read_entry_prefix(name, usize::MAX)
    }

    /// Reads at most `limit` leading bytes of an entry.
    pub fn read_entry_prefix(&self, name: &str, limit: usize) -> Result<Vec<u8>> {
        if !self.contains(name) {
            return Err(self.missing(name));
        }
        let mut archive = ZipArchive::new(BufReader::new(File::open(&self.path)?))?;
        let entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Err(self.missing(name)),
            Err(err) => return Err(err.into()),
        };
        let mut bytes = Vec::with_capacity(entry.size().min(limit as u64) as usize);
        entry.take(limit as u64).read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Applies a set of entry updates in one archive rewrite.
    ///
    /// `Some(bytes)` replaces or adds the entry, `None` removes it. Either
    /// every update becomes visible or none does.
    pub fn write_entries(&self, updates: Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let changed: HashMap<&str, Option<&Vec<u8>>> = updates
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_ref()))
            .collect();
        let tmp_path = self.path.with_extension("zip.tmp");

        let result = (|| -> Result<BTreeMap<String, u64>> {
            let mut writer = ZipWriter::new(BufWriter::new(File::create(&tmp_path)?));
            let mut index = BTreeMap::new();

            if self.path.exists() {
                let mut archive = ZipArchive::new(BufReader::new(File::open(&self.path)?))?;
                for i in 0..archive.len() {
                    let entry = archive.by_index_raw(i)?;
                    if changed.contains_key(entry.name()) {
                        continue;
                    }
                    index.insert(entry.name().to_string(), entry.size());
                    writer.raw_copy_file(entry)?;
                }
            }

            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            for (name, bytes) in &updates {
                if let Some(bytes) = bytes {
                    writer.start_file(name.as_str(), options)?;
                    writer.write_all(bytes)?;
                    index.insert(name.clone(), bytes.len() as u64);
                }
            }

            let file = writer
                .finish()?
                .into_inner()
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            file.sync_all()?;
            Ok(index)
        })();

        match result {
            Ok(index) => {
                fs::rename(&tmp_path, &self.path)?;
                *self.index.write().unwrap_or_else(|err| err.into_inner()) = index;
                debug!(
                    container = %self.path.display(),
                    updates = updates.len(),
                    "rewrote container"
                );
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                Err(err)
            }
        }
    }

    /// Renames an entry.
    pub fn rename_entry(&self, from: &str, to: &str) -> Result<()> {
        let bytes = self.read_entry(from)?;
        self.write_entries(vec![(from.to_string(), None), (to.to_string(), Some(bytes))])
    }

    /// Removes an entry.
    pub fn remove_entry(&self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(self.missing(name));
        }
        self.write_entries(vec![(name.to_string(), None)])
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, u64>> {
        self.index.read().unwrap_or_else(|err| err.into_inner())
    }

    fn missing(&self, name: &str) -> ArchiveError {
        ArchiveError::NotFound(format!("entry {} in {}", name, self.path.display()))
    }
}

fn read_index(path: &Path) -> Result<BTreeMap<String, u64>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let mut index = BTreeMap::new();
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        if entry.is_file() {
            index.insert(entry.name().to_string(), entry.size());
        }
    }
    Ok(index)
}

/// Shares one [`ZipContainer`] handle per container path.
///
/// Handles stay cached until [`ContainerCache::release`] or
/// [`ContainerCache::release_all`] is called, typically when a root is
/// unmounted or the engine shuts down.
#[derive(Debug, Default)]
pub struct ContainerCache {
    handles: Mutex<HashMap<PathBuf, Arc<ZipContainer>>>,
}

impl ContainerCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `path`, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when `create` is unset and the container does not
    /// exist. A failed open leaves nothing cached.
    pub fn get(&self, path: &Path, create: bool) -> Result<Arc<ZipContainer>> {
        let mut handles = self.handles.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(handle) = handles.get(path) {
            if create || handle.path().exists() || !handle.read_index().is_empty() {
                return Ok(Arc::clone(handle));
            }
            return Err(ArchiveError::NotFound(format!(
                "container {}",
                path.display()
            )));
        }

        let handle = Arc::new(ZipContainer::open(path, create)?);
        handles.insert(path.to_path_buf(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops the cached handle for `path`. Returns true if one was cached.
    pub fn release(&self, path: &Path) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(path)
            .is_some()
    }

    /// Drops every cached handle. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(|err| err.into_inner());
        let released = handles.len();
        handles.clear();
        released
    }

    /// Returns the number of cached handles.
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    /// Returns true if no handle is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
