//! Host list persistence layer
//!
//! Saves the address manager as a single JSON document, written to a
//! temporary file and renamed into place, with rotating backups.

use crate::network::addrman::HostListJson;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub hosts_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".p2p_data"),
            hosts_file: "hosts.json".to_string(),
            backup_enabled: true,
            max_backups: 3,
        }
    }
}

impl StorageConfig {
    /// Configuration for an explicit host file location
    pub fn for_file(path: &Path) -> Self {
        let data_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let hosts_file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hosts.json".to_string());
        Self {
            data_dir,
            hosts_file,
            ..Self::default()
        }
    }
}

/// Host list storage manager
#[derive(Debug, Clone)]
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    /// Get the host file path
    pub fn hosts_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.hosts_file)
    }

    /// Get a backup file path
    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.hosts_file, index))
    }

    /// Save the host list to disk
    pub fn save(&self, hosts: &HostListJson) -> Result<(), StorageError> {
        let path = self.hosts_path();

        // Create backup if enabled
        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        // Write to temporary file first
        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.hosts_file));
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, hosts)?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;

        log::debug!("Saved host list to {}", path.display());

        Ok(())
    }

    /// Load the host list; `None` when nothing was saved yet
    pub fn load(&self) -> Result<Option<HostListJson>, StorageError> {
        let path = self.hosts_path();

        if !path.exists() {
            return Ok(None);
        }

        load_from_file(&path).map(Some)
    }

    /// Rotate backup files
    fn rotate_backups(&self) -> Result<(), StorageError> {
        // Delete oldest backup
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        // Shift existing backups
        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                let next = self.backup_path(i + 1);
                fs::rename(&current, &next)?;
            }
        }

        Ok(())
    }
}

/// Load a host list from a specific file path
fn load_from_file(path: &Path) -> Result<HostListJson, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Network;
    use crate::network::addrman::{HostList, HostListOptions};
    use crate::wire::netaddress::NetAddress;
    use crate::wire::types::Services;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_hosts(count: u8) -> HostList {
        let mut options = HostListOptions::new(Network::main());
        options.seeds.clear();
        let mut hosts = HostList::new(options);
        let now = chrono::Utc::now().timestamp() as u64;
        for i in 0..count {
            let addr = NetAddress::new(
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, i + 1)),
                8333,
                Services::NETWORK | Services::WITNESS,
                now,
            );
            hosts.add(addr, None);
        }
        hosts
    }

    #[test]
    fn test_save_load_hosts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        let storage = Storage::new(config).unwrap();
        assert!(storage.load().unwrap().is_none());

        let hosts = sample_hosts(4);
        storage.save(&hosts.to_json()).unwrap();
        assert!(storage.hosts_path().exists());

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded, hosts.to_json());

        let mut restored = HostList::new(hosts.options().clone());
        restored.from_json(&loaded).unwrap();
        assert_eq!(restored.size(), 4);
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 2,
            ..Default::default()
        };

        let storage = Storage::new(config).unwrap();

        for i in 1..=4 {
            storage.save(&sample_hosts(i).to_json()).unwrap();
        }

        // Newest backup is the previous save.
        assert_eq!(load_from_file(&storage.backup_path(0)).unwrap().addrs.len(), 3);
        assert_eq!(load_from_file(&storage.backup_path(1)).unwrap().addrs.len(), 2);
        assert!(!storage.backup_path(2).exists());
        assert_eq!(storage.load().unwrap().unwrap().addrs.len(), 4);
    }

    #[test]
    fn test_corrupt_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("peers.json");
        std::fs::write(&path, "not json").unwrap();

        let storage = Storage::new(StorageConfig::for_file(&path)).unwrap();
        assert!(matches!(
            storage.load(),
            Err(StorageError::SerializationError(_))
        ));
    }
}
