//! Filesystem layout helpers and atomic write operations
//!
//! Manages the .pausable/ directory structure: the runtime configuration and
//! one journal file per instance. Configuration writes are atomic via temp
//! files and renames.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

use super::RuntimeConfig;
use super::instance::InstanceId;

const JOURNAL_EXTENSION: &str = "journal";

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the journal directory path
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    /// Journal file of one instance.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced so an id can never
    /// escape the journal directory.
    pub fn journal_path(&self, instance_id: &InstanceId) -> PathBuf {
        let name: String = instance_id
            .as_str()
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
                _ => '_',
            })
            .collect();
        self.journal_dir().join(format!("{name}.{JOURNAL_EXTENSION}"))
    }

    /// Instance ids of every journal file, sorted
    pub fn list_journals(&self) -> Result<Vec<InstanceId>> {
        let dir = self.journal_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<InstanceId> = self
            .list_dir(&dir)?
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == JOURNAL_EXTENSION))
            .filter_map(|path| path.file_stem()?.to_str().map(InstanceId::new))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        // Write to temporary file
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

        file.write_all(data)
            .context("Failed to write data")?;

        file.sync_all()
            .context("Failed to sync file")?;

        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        // Sync parent directory
        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;

            dir.sync_all()
                .context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }

    /// List files in a directory
    pub fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(path)
            .with_context(|| format!("Failed to read directory: {:?}", path))?
        {
            let entry = entry?;
            entries.push(entry.path());
        }

        Ok(entries)
    }
}

/// Initialize storage directories for a new runtime
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());

    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.journal_dir())?;

    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> Result<()> {
    let storage = Storage::new(config.root.clone());
    let config_path = storage.config_path();

    let json = serde_json::to_vec_pretty(config)
        .context("Failed to serialize config")?;

    storage.write_atomic(&config_path, &json)?;

    Ok(())
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> Result<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let config_path = storage.config_path();

    let data = storage.read_file(&config_path)?;
    let config: RuntimeConfig = serde_json::from_slice(&data)
        .context("Failed to deserialize config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        init_storage(root).unwrap();

        assert!(root.join("journal").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            root: root.clone(),
            pause_timeout: Duration::from_secs(90),
            debug: true,
            ..RuntimeConfig::default()
        };

        write_config(&config).unwrap();
        let loaded = load_config(&root).unwrap();

        assert_eq!(loaded.pause_timeout, Duration::from_secs(90));
        assert!(loaded.durable);
        assert_eq!(loaded.adapter, config.adapter);
        assert_eq!(loaded.debug, true);
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");

        let data = b"Hello, world!";
        storage.write_atomic(&test_file, data).unwrap();

        let read_data = storage.read_file(&test_file).unwrap();
        assert_eq!(data, &read_data[..]);
    }

    #[test]
    fn test_journal_paths_stay_inside_root() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        let path = storage.journal_path(&InstanceId::new("../etc/passwd"));
        assert_eq!(path.parent().unwrap(), storage.journal_dir());
        assert_eq!(path.file_name().unwrap(), ".._etc_passwd.journal");
    }

    #[test]
    fn test_list_journals() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        assert!(storage.list_journals().unwrap().is_empty());

        init_storage(temp.path()).unwrap();
        for id in ["wf-b", "wf-a"] {
            fs::write(storage.journal_path(&InstanceId::new(id)), b"").unwrap();
        }
        fs::write(storage.journal_dir().join("notes.txt"), b"").unwrap();

        let ids = storage.list_journals().unwrap();
        assert_eq!(ids, vec![InstanceId::new("wf-a"), InstanceId::new("wf-b")]);
    }
}
