//! On-disk contract registry.
//!
//! The registry is the JSON file downstream components read to find deployed contracts:
//!
//! ```json
//! {
//!     "contracts": { "<Name>": { "address": "0x…", "abi": [ … ] } },
//!     "timestamp": "2024-01-31 12:00:00",
//!     "network": "anvil"
//! }
//! ```
//!
//! Every write first copies the previous file to a timestamped backup next to it, then
//! replaces the registry atomically.

use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, B256},
};
use anyhow::Context;
use chrono::{DateTime, Local};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, ser::PrettyFormatter};

use crate::{
    deployment::DeployedContract,
    error::{RegistryLoadError, RegistryPersistError},
    fs::FsHandler,
};

/// Format of [`RegistrySnapshot::timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp format embedded in backup file names.
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// Network identifier written to the registry. Defaults to the backend kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("contract_addresses.json"),
            network: None,
        }
    }
}

/// One deployed contract in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub address: String,
    pub abi: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_fallback_gas_limit: Option<bool>,
}

impl RegistryEntry {
    pub fn new(address: impl Into<String>, abi: Value) -> Self {
        Self {
            address: address.into(),
            abi,
            transaction_hash: None,
            gas_used: None,
            used_fallback_gas_limit: None,
        }
    }

    /// Non-empty address and non-empty interface descriptor.
    pub fn is_well_formed(&self) -> bool {
        let has_abi = match &self.abi {
            Value::Array(items) => !items.is_empty(),
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        };
        !self.address.trim().is_empty() && has_abi
    }

    pub fn parse_address(&self) -> anyhow::Result<Address> {
        self.address
            .parse()
            .with_context(|| format!("Invalid contract address {}", self.address))
    }

    pub fn parse_abi(&self) -> anyhow::Result<JsonAbi> {
        match &self.abi {
            Value::String(raw) => serde_json::from_str(raw),
            value => serde_json::from_value(value.clone()),
        }
        .context("Invalid contract ABI")
    }
}

impl TryFrom<&DeployedContract> for RegistryEntry {
    type Error = serde_json::Error;

    fn try_from(contract: &DeployedContract) -> Result<Self, Self::Error> {
        Ok(Self {
            address: contract.address.to_checksum(None),
            abi: serde_json::to_value(&contract.abi)?,
            transaction_hash: Some(contract.transaction_hash),
            gas_used: Some(contract.gas_used),
            used_fallback_gas_limit: Some(contract.used_fallback_gas_limit),
        })
    }
}

/// Content of the registry file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub contracts: BTreeMap<String, RegistryEntry>,
    pub timestamp: String,
    pub network: String,
}

/// The file as found on disk, entries not yet checked.
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    contracts: BTreeMap<String, Value>,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    network: String,
}

impl From<RawSnapshot> for RegistrySnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let contracts = raw
            .contracts
            .into_iter()
            .filter_map(|(name, value)| {
                match serde_json::from_value::<RegistryEntry>(value) {
                    Ok(entry) if entry.is_well_formed() => Some((name, entry)),
                    Ok(_) => {
                        tracing::warn!(
                            contract = %name,
                            "Dropping registry entry with empty address or ABI"
                        );
                        None
                    }
                    Err(err) => {
                        tracing::warn!(
                            contract = %name,
                            error = %err,
                            "Dropping malformed registry entry"
                        );
                        None
                    }
                }
            })
            .collect();

        Self {
            contracts,
            timestamp: raw.timestamp,
            network: raw.network,
        }
    }
}

impl RegistrySnapshot {
    /// Every name in `required` is present.
    pub fn contains_all(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|name| self.contracts.get(name).is_some_and(RegistryEntry::is_well_formed))
    }

    /// Names of `required` missing from the snapshot.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| !self.contracts.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// A backup taken before a registry write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub source: PathBuf,
    pub backup: PathBuf,
    pub created_at: DateTime<Local>,
}

/// Result of [`RegistryStore::persist`].
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    /// The snapshot now on disk.
    pub snapshot: RegistrySnapshot,
    /// `None` when there was no previous file or the backup failed.
    pub backup: Option<BackupRecord>,
}

/// Reads and writes the registry file.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        FsHandler::with_suffix(&self.path, ".lock")
    }

    /// Load the registry. `None` when the file does not exist.
    ///
    /// Malformed entries are dropped with a warning.
    pub fn load(&self) -> Result<Option<RegistrySnapshot>, RegistryLoadError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RegistryLoadError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let raw: RawSnapshot =
            serde_json::from_str(&content).map_err(|source| RegistryLoadError::Parse {
                path: self.path.clone(),
                source,
            })?;

        Ok(Some(raw.into()))
    }

    /// Every required contract has a non-empty address.
    pub fn is_valid(snapshot: &RegistrySnapshot, required: &[String]) -> bool {
        snapshot.contains_all(required)
    }

    /// Write `new_entries` to the registry.
    ///
    /// 1. An existing file is copied to `<stem>_backup_<YYYYMMDD_HHMMSS><ext>`. A failed
    ///    backup is logged and does not stop the write.
    /// 2. New entries overwrite existing ones by name. Existing entries are dropped when
    ///    `reset_existing` is set or when the previous file cannot be parsed.
    /// 3. The result replaces the file atomically.
    pub fn persist(
        &self,
        new_entries: BTreeMap<String, RegistryEntry>,
        network: &str,
        reset_existing: bool,
    ) -> Result<PersistOutcome, RegistryPersistError> {
        FsHandler::create_parent_directory(&self.path).map_err(|source| {
            RegistryPersistError::Write {
                path: self.path.clone(),
                source,
            }
        })?;

        let lock_path = self.lock_path();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| RegistryPersistError::Write {
                path: lock_path.clone(),
                source,
            })?;
        lock.try_lock_exclusive()
            .map_err(|source| RegistryPersistError::Locked {
                path: self.path.clone(),
                source,
            })?;

        let now = Local::now();
        let exists = self.path.exists();

        let backup = if exists { self.backup(now) } else { None };

        let mut contracts = if exists && !reset_existing {
            self.existing_entries()
        } else {
            BTreeMap::new()
        };

        for (name, entry) in new_entries {
            if entry.is_well_formed() {
                contracts.insert(name, entry);
            } else {
                tracing::warn!(
                    contract = %name,
                    "Not writing registry entry with empty address or ABI"
                );
            }
        }

        let snapshot = RegistrySnapshot {
            contracts,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            network: network.to_string(),
        };

        let json = to_json(&snapshot).map_err(RegistryPersistError::Serialize)?;

        FsHandler::write_atomic(&self.path, &json).map_err(|source| {
            RegistryPersistError::Write {
                path: self.path.clone(),
                source,
            }
        })?;

        tracing::info!(
            path = %self.path.display(),
            contracts = snapshot.contracts.len(),
            network,
            reset_existing,
            "Registry written"
        );

        let _ = FileExt::unlock(&lock);

        Ok(PersistOutcome { snapshot, backup })
    }

    fn backup(&self, now: DateTime<Local>) -> Option<BackupRecord> {
        let mut target = backup_path(&self.path, now, 0);
        let mut result = FsHandler::copy_new(&self.path, &target);

        // Two writes within the same second.
        let mut collision = 0;
        while collision < 100
            && matches!(&result, Err(err) if err.kind() == io::ErrorKind::AlreadyExists)
        {
            collision += 1;
            target = backup_path(&self.path, now, collision);
            result = FsHandler::copy_new(&self.path, &target);
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    source = %self.path.display(),
                    backup = %target.display(),
                    "Registry backed up"
                );
                Some(BackupRecord {
                    source: self.path.clone(),
                    backup: target,
                    created_at: now,
                })
            }
            Err(err) => {
                tracing::warn!(
                    source = %self.path.display(),
                    backup = %target.display(),
                    error = %err,
                    "Failed to back up registry, writing anyway"
                );
                None
            }
        }
    }

    fn existing_entries(&self) -> BTreeMap<String, RegistryEntry> {
        match self.load() {
            Ok(Some(snapshot)) => snapshot.contracts,
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                tracing::warn!(error = ?err, "Previous registry unreadable, not merging it");
                BTreeMap::new()
            }
        }
    }
}

/// Backup location of `path` for a write at `now`. A non-zero `index` disambiguates
/// backups taken within the same second.
pub fn backup_path(path: &Path, now: DateTime<Local>, index: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "registry".to_string());
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let index = if index == 0 {
        String::new()
    } else {
        format!("_{}", index)
    };

    path.with_file_name(format!(
        "{}_backup_{}{}{}",
        stem,
        now.format(BACKUP_TIMESTAMP_FORMAT),
        index,
        extension
    ))
}

/// Pretty JSON with four-space indentation.
fn to_json(snapshot: &RegistrySnapshot) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    snapshot.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;
    use tempdir::TempDir;

    use super::*;

    fn entry(address: &str) -> RegistryEntry {
        RegistryEntry::new(address, serde_json::json!([{ "type": "constructor", "inputs": [] }]))
    }

    fn entries(items: &[(&str, &str)]) -> BTreeMap<String, RegistryEntry> {
        items
            .iter()
            .map(|(name, address)| (name.to_string(), entry(address)))
            .collect()
    }

    fn backups(dir: &Path) -> Vec<PathBuf> {
        let mut backups: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("contract_addresses_backup_")
            })
            .collect();
        backups.sort();
        backups
    }

    #[test]
    fn test_backup_path_pattern() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            backup_path(Path::new("/data/contract_addresses.json"), now, 0),
            PathBuf::from("/data/contract_addresses_backup_20240309_140507.json")
        );
        assert_eq!(
            backup_path(Path::new("registry"), now, 0),
            PathBuf::from("registry_backup_20240309_140507")
        );
        assert_eq!(
            backup_path(Path::new("contract_addresses.json"), now, 2),
            PathBuf::from("contract_addresses_backup_20240309_140507_2.json")
        );
    }

    #[test]
    fn test_load_absent_registry() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_load_drops_malformed_entries() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let path = dir.path().join("contract_addresses.json");
        fs::write(
            &path,
            serde_json::json!({
                "contracts": {
                    "Good": { "address": "0xAA", "abi": [{ "type": "fallback" }] },
                    "NoAddress": { "address": "", "abi": [{ "type": "fallback" }] },
                    "NoAbi": { "address": "0xBB" },
                    "Garbage": 42
                },
                "timestamp": "2024-01-01 00:00:00",
                "network": "ganache"
            })
            .to_string(),
        )
        .unwrap();

        let snapshot = RegistryStore::new(&path).load().unwrap().unwrap();
        assert_eq!(snapshot.contracts.keys().collect::<Vec<_>>(), ["Good"]);
        assert_eq!(snapshot.network, "ganache");

        assert!(RegistryStore::is_valid(&snapshot, &["Good".to_string()]));
        let required = ["Good".to_string(), "NoAddress".to_string()];
        assert!(!RegistryStore::is_valid(&snapshot, &required));
    }

    #[test]
    fn test_load_unparseable_registry() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let path = dir.path().join("contract_addresses.json");
        fs::write(&path, "{ not json").unwrap();

        let err = RegistryStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RegistryLoadError::Parse { .. }));
    }

    #[test]
    fn test_first_persist_takes_no_backup() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));

        let outcome = store.persist(entries(&[("A", "0xAA")]), "anvil", false).unwrap();
        assert!(outcome.backup.is_none());
        assert!(backups(dir.path()).is_empty());

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\n    \"contracts\": {"));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, outcome.snapshot);
        assert_eq!(loaded.network, "anvil");
    }

    #[test]
    fn test_persist_backs_up_previous_file() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));

        store.persist(entries(&[("A", "0xAA")]), "anvil", false).unwrap();
        let previous = fs::read(store.path()).unwrap();

        let outcome = store.persist(entries(&[("B", "0xBB")]), "anvil", false).unwrap();

        let backups = backups(dir.path());
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(&backups[0]).unwrap(), previous);
        assert_eq!(outcome.backup.unwrap().backup, backups[0]);

        // Merged: A retained, B added.
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.contracts.keys().collect::<Vec<_>>(), ["A", "B"]);
    }

    #[test]
    fn test_failed_backup_does_not_block_write() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let path = dir.path().join("contract_addresses.json");
        let store = RegistryStore::new(&path);
        store.persist(entries(&[("A", "0xAA")]), "anvil", false).unwrap();

        // Occupy every backup name of this second and the next ones.
        let now = Local::now();
        for offset in 0..3 {
            let at = now + chrono::TimeDelta::seconds(offset);
            for index in 0..=100 {
                fs::create_dir_all(backup_path(&path, at, index)).unwrap();
            }
        }

        let outcome = store.persist(entries(&[("B", "0xBB")]), "anvil", false).unwrap();
        assert_eq!(outcome.backup, None);

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.contracts.keys().collect::<Vec<_>>(), ["A", "B"]);
        assert!(backups(dir.path()).iter().all(|backup| backup.is_dir()));
    }

    #[test]
    fn test_persist_overwrites_by_name() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));

        store.persist(entries(&[("A", "0x01"), ("B", "0x02")]), "anvil", false).unwrap();
        store.persist(entries(&[("A", "0x03")]), "anvil", false).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.contracts["A"].address, "0x03");
        assert_eq!(loaded.contracts["B"].address, "0x02");
    }

    #[test]
    fn test_reset_existing_keeps_only_new_entries() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));

        store.persist(entries(&[("A", "0xAA")]), "anvil", false).unwrap();
        let previous = fs::read(store.path()).unwrap();

        store.persist(entries(&[("B", "0xBB")]), "anvil", true).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.contracts.keys().collect::<Vec<_>>(), ["B"]);

        let backups = backups(dir.path());
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(&backups[0]).unwrap(), previous);
    }

    #[test]
    fn test_unparseable_previous_file_is_backed_up_and_replaced() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));
        fs::write(store.path(), "{ truncated").unwrap();

        store.persist(entries(&[("A", "0xAA")]), "anvil", false).unwrap();

        let backups = backups(dir.path());
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(&backups[0]).unwrap(), "{ truncated");
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn test_malformed_new_entries_are_not_written() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));

        let mut new_entries = entries(&[("A", "0xAA")]);
        new_entries.insert("B".to_string(), RegistryEntry::new("0xBB", serde_json::json!([])));

        let outcome = store.persist(new_entries, "anvil", false).unwrap();
        assert!(outcome.snapshot.contracts.contains_key("A"));
        assert!(!outcome.snapshot.contracts.contains_key("B"));
    }

    #[test]
    fn test_persist_fails_fast_when_locked() {
        let dir = TempDir::new("chainup-registry").unwrap();
        let store = RegistryStore::new(dir.path().join("contract_addresses.json"));
        store.persist(entries(&[("A", "0xAA")]), "anvil", false).unwrap();
        let previous = fs::read(store.path()).unwrap();

        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(store.lock_path())
            .unwrap();
        holder.lock_exclusive().unwrap();

        let err = store.persist(entries(&[("B", "0xBB")]), "anvil", false).unwrap_err();
        assert!(matches!(err, RegistryPersistError::Locked { .. }));
        assert_eq!(fs::read(store.path()).unwrap(), previous);

        FileExt::unlock(&holder).unwrap();
        assert!(store.persist(entries(&[("B", "0xBB")]), "anvil", false).is_ok());
    }
}
