use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::account::RemoteAccount;
use crate::{Error, Result};

pub const REGISTRY_SCHEMA_VERSION: u32 = 1;
pub const REGISTRY_FILE: &str = "accounts.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    #[serde(default)]
    pub active_account: Option<String>,
    #[serde(default)]
    pub accounts: Vec<RemoteAccount>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            version: REGISTRY_SCHEMA_VERSION,
            active_account: None,
            accounts: Vec::new(),
        }
    }
}

pub fn parse_registry(text: &str) -> std::result::Result<RegistrySnapshot, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(REGISTRY_SCHEMA_VERSION) => {
            let mut snapshot = toml::from_str::<RegistrySnapshot>(text)?;
            normalize_registry(&mut snapshot);
            Ok(snapshot)
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported registry schema version: {other} (expected {REGISTRY_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom(
            "registry version missing".to_string(),
        )),
    }
}

fn normalize_registry(snapshot: &mut RegistrySnapshot) {
    for account in &mut snapshot.accounts {
        account.normalize();
    }
}

pub fn validate_registry(snapshot: &RegistrySnapshot) -> Result<()> {
    if snapshot.version != REGISTRY_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "registry version must be {REGISTRY_SCHEMA_VERSION} (got {})",
                snapshot.version
            ),
        });
    }

    let mut names = HashSet::<&str>::new();
    for account in &snapshot.accounts {
        if account.name.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "accounts[].name must not be empty".to_string(),
            });
        }
        if !names.insert(account.name.as_str()) {
            return Err(Error::InvalidConfig {
                message: format!("duplicate account name: {}", account.name),
            });
        }
    }

    if let Some(active) = &snapshot.active_account
        && !names.contains(active.as_str())
    {
        return Err(Error::InvalidConfig {
            message: format!("active_account references unknown account: {active}"),
        });
    }

    Ok(())
}

pub trait RegistryStore: Send + Sync {
    fn load(&self) -> Result<RegistrySnapshot>;
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;
}

pub struct TomlRegistryStore {
    path: PathBuf,
}

impl TomlRegistryStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for TomlRegistryStore {
    fn load(&self) -> Result<RegistrySnapshot> {
        if !self.path.exists() {
            return Ok(RegistrySnapshot::default());
        }

        let text = std::fs::read_to_string(&self.path).map_err(|e| Error::InvalidConfig {
            message: format!("registry read failed: {e}"),
        })?;
        let snapshot = parse_registry(&text).map_err(|e| Error::InvalidConfig {
            message: format!("registry invalid: {e}"),
        })?;
        validate_registry(&snapshot)?;
        Ok(snapshot)
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        validate_registry(snapshot)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
                message: format!("registry dir create failed: {e}"),
            })?;
        }

        let text = toml::to_string(snapshot).map_err(|e| Error::InvalidConfig {
            message: format!("registry encode failed: {e}"),
        })?;
        atomic_write(&self.path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
            message: format!("registry write failed: {e}"),
        })?;
        debug!(
            event = "registry.save",
            path = %self.path.display(),
            accounts = snapshot.accounts.len(),
            "registry.save"
        );
        Ok(())
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[derive(Default)]
pub struct InMemoryRegistryStore {
    inner: std::sync::Mutex<RegistrySnapshot>,
    pub saves: AtomicUsize,
    pub fail_next_save: AtomicBool,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: std::sync::Mutex::new(snapshot),
            saves: AtomicUsize::new(0),
            fail_next_save: AtomicBool::new(false),
        }
    }

    pub fn stored(&self) -> RegistrySnapshot {
        self.inner.lock().expect("registry store poisoned").clone()
    }
}

impl RegistryStore for InMemoryRegistryStore {
    fn load(&self) -> Result<RegistrySnapshot> {
        Ok(self.stored())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(Error::InvalidConfig {
                message: "registry save failed (injected)".to_string(),
            });
        }
        validate_registry(snapshot)?;
        *self.inner.lock().expect("registry store poisoned") = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory account registry backed by a snapshot store. Reads always see
/// the latest successful in-process write; every mutation persists the whole
/// snapshot before it becomes visible.
pub struct AccountRegistry {
    store: Arc<dyn RegistryStore>,
    snapshot: RegistrySnapshot,
}

impl std::fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRegistry")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl AccountRegistry {
    pub fn open(store: Arc<dyn RegistryStore>) -> Result<Self> {
        let snapshot = store.load()?;
        Ok(Self { store, snapshot })
    }

    pub fn accounts(&self) -> &[RemoteAccount] {
        &self.snapshot.accounts
    }

    pub fn account_names(&self) -> Vec<String> {
        self.snapshot
            .accounts
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&RemoteAccount> {
        self.snapshot.accounts.iter().find(|a| a.name == name)
    }

    pub fn active_account(&self) -> Option<&str> {
        self.snapshot.active_account.as_deref()
    }

    pub fn snapshot(&self) -> &RegistrySnapshot {
        &self.snapshot
    }

    /// Creates (`editing = false`) or replaces in place (`editing = true`).
    /// Creating over an existing name fails with `DuplicateName`; editing a
    /// missing name fails with `NotFound`. Position in the persisted order
    /// is preserved on edit.
    pub fn upsert(&mut self, mut account: RemoteAccount, editing: bool) -> Result<()> {
        if account.name.trim().is_empty() {
            return Err(Error::Validation {
                message: "account name must not be empty".to_string(),
            });
        }
        account.normalize();

        let existing = self
            .snapshot
            .accounts
            .iter()
            .position(|a| a.name == account.name);
        let mut next = self.snapshot.clone();
        match (existing, editing) {
            (Some(_), false) => {
                return Err(Error::DuplicateName { name: account.name });
            }
            (None, true) => {
                return Err(Error::NotFound { name: account.name });
            }
            (Some(index), true) => {
                next.accounts[index] = account;
            }
            (None, false) => {
                next.accounts.push(account);
            }
        }
        self.commit(next)
    }

    /// Removes `name`, failing with `NotFound` when absent so callers can
    /// tell "already gone" from "removed". Clears the active-account scalar
    /// when it pointed at the removed record.
    pub fn delete(&mut self, name: &str) -> Result<RemoteAccount> {
        let index = self
            .snapshot
            .accounts
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })?;

        let mut next = self.snapshot.clone();
        let removed = next.accounts.remove(index);
        if next.active_account.as_deref() == Some(name) {
            next.active_account = None;
        }
        self.commit(next)?;
        info!(event = "registry.delete", name, "registry.delete");
        Ok(removed)
    }

    pub fn set_active_account(&mut self, name: Option<&str>) -> Result<()> {
        if let Some(name) = name
            && self.find_by_name(name).is_none()
        {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        }
        let mut next = self.snapshot.clone();
        next.active_account = name.map(str::to_string);
        self.commit(next)
    }

    fn commit(&mut self, next: RegistrySnapshot) -> Result<()> {
        self.store.save(&next)?;
        self.snapshot = next;
        Ok(())
    }
}
