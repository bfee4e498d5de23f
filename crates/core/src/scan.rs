use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::format::format_size;
use crate::index::{
    BackupEntry, EntryIdentity, Location, OpType, SelectionType, SubjectDetail, SubjectKind,
};
use crate::{Error, Result};

pub const ENTRY_META_FILE: &str = "entry.toml";

/// Repopulates the backup index. `scan` walks everything in its scope and
/// returns the full entry set; the caller replaces that population wholesale.
pub trait Scanner: Send + Sync {
    fn scan<'a>(
        &'a self,
        cancel: Option<&'a CancellationToken>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BackupEntry>>> + Send + 'a>>;
}

/// Executes batch effects requested by the engine: removing snapshot
/// directories and running backup/restore payload work.
pub trait BatchExecutor: Send + Sync {
    fn delete<'a>(
        &'a self,
        identity: &'a EntryIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn process<'a>(
        &'a self,
        selection: SelectionType,
        identities: &'a [EntryIdentity],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Sidecar metadata written next to each snapshot's payload.
#[derive(Debug, Default, Deserialize)]
struct EntryMeta {
    #[serde(default)]
    label: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    system_app: bool,
    #[serde(default)]
    has_keystore: bool,
    #[serde(default)]
    ssaid: String,
    #[serde(default)]
    installed: bool,
    #[serde(default)]
    path: String,
    #[serde(default)]
    created_at: Option<String>,
}

/// Scans an artifact tree laid out as
/// `<root>/packages/<subject>/<user_id>/<preserve_id>/` and
/// `<root>/media/<subject>/<preserve_id>/`, one snapshot per leaf
/// directory. Every snapshot yields a restore entry; the `preserve_id = 0`
/// slot additionally yields the backup entry a new run would overwrite.
pub struct TreeScanner {
    root: PathBuf,
    location: Location,
    scope: Option<SubjectKind>,
}

impl TreeScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_location(root, Location::Local)
    }

    pub fn with_location(root: impl Into<PathBuf>, location: Location) -> Self {
        Self {
            root: root.into(),
            location,
            scope: None,
        }
    }

    /// Limits the scan to one subject kind's subtree. Per-kind refreshes
    /// must not walk (or repopulate) the other kind's artifacts.
    pub fn scoped(root: impl Into<PathBuf>, kind: SubjectKind) -> Self {
        Self {
            root: root.into(),
            location: Location::Local,
            scope: Some(kind),
        }
    }

    fn scan_packages(
        &self,
        cancel: Option<&CancellationToken>,
        out: &mut Vec<BackupEntry>,
    ) -> Result<()> {
        let base = self.root.join("packages");
        if !base.is_dir() {
            return Ok(());
        }

        for (subject, subject_dir) in sorted_dirs(&base)? {
            if let Some(cancel) = cancel
                && cancel.is_cancelled()
            {
                return Err(Error::Cancelled);
            }

            for (user_name, user_dir) in sorted_dirs(&subject_dir)? {
                let Ok(user_id) = user_name.parse::<u32>() else {
                    warn!(event = "scan.skip", path = %user_dir.display(), "scan.skip: non-numeric user dir");
                    continue;
                };
                for (preserve_name, preserve_dir) in sorted_dirs(&user_dir)? {
                    let Ok(preserve_id) = preserve_name.parse::<i64>() else {
                        warn!(event = "scan.skip", path = %preserve_dir.display(), "scan.skip: non-numeric preserve dir");
                        continue;
                    };
                    let Some(meta) = read_meta(&preserve_dir) else {
                        continue;
                    };
                    let detail = SubjectDetail::Package {
                        label: meta.label.clone(),
                        version: meta.version.clone(),
                        system_app: meta.system_app,
                        has_keystore: meta.has_keystore,
                        ssaid: meta.ssaid.clone(),
                        installed: meta.installed,
                    };
                    self.push_snapshot(
                        out,
                        &subject,
                        Some(user_id),
                        preserve_id,
                        &preserve_dir,
                        detail,
                        parse_created_at(&meta),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn scan_media(
        &self,
        cancel: Option<&CancellationToken>,
        out: &mut Vec<BackupEntry>,
    ) -> Result<()> {
        let base = self.root.join("media");
        if !base.is_dir() {
            return Ok(());
        }

        for (subject, subject_dir) in sorted_dirs(&base)? {
            if let Some(cancel) = cancel
                && cancel.is_cancelled()
            {
                return Err(Error::Cancelled);
            }

            for (preserve_name, preserve_dir) in sorted_dirs(&subject_dir)? {
                let Ok(preserve_id) = preserve_name.parse::<i64>() else {
                    warn!(event = "scan.skip", path = %preserve_dir.display(), "scan.skip: non-numeric preserve dir");
                    continue;
                };
                let Some(meta) = read_meta(&preserve_dir) else {
                    continue;
                };
                let detail = SubjectDetail::Media {
                    path: meta.path.clone(),
                };
                self.push_snapshot(
                    out,
                    &subject,
                    None,
                    preserve_id,
                    &preserve_dir,
                    detail,
                    parse_created_at(&meta),
                )?;
            }
        }
        Ok(())
    }

    fn push_snapshot(
        &self,
        out: &mut Vec<BackupEntry>,
        subject: &str,
        user_id: Option<u32>,
        preserve_id: i64,
        dir: &Path,
        detail: SubjectDetail,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let size_bytes = dir_size(dir)?;
        let entry = BackupEntry {
            subject_id: subject.to_string(),
            op_type: OpType::Restore,
            user_id,
            preserve_id,
            location: self.location.clone(),
            backup_dir: dir.to_string_lossy().into_owned(),
            size_bytes,
            size_display: format_size(size_bytes),
            detail,
            created_at,
        };
        if preserve_id == 0 {
            let mut slot = entry.clone();
            slot.op_type = OpType::Backup;
            out.push(slot);
        }
        out.push(entry);
        Ok(())
    }
}

impl Scanner for TreeScanner {
    fn scan<'a>(
        &'a self,
        cancel: Option<&'a CancellationToken>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BackupEntry>>> + Send + 'a>> {
        Box::pin(async move {
            info!(event = "scan.start", root = %self.root.display(), "scan.start");
            let mut out = Vec::new();
            if self.scope != Some(SubjectKind::Media) {
                self.scan_packages(cancel, &mut out)?;
            }
            if self.scope != Some(SubjectKind::Package) {
                self.scan_media(cancel, &mut out)?;
            }
            info!(event = "scan.done", entries = out.len(), "scan.done");
            Ok(out)
        })
    }
}

fn sorted_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

fn read_meta(dir: &Path) -> Option<EntryMeta> {
    let path = dir.join(ENTRY_META_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => {
            warn!(event = "scan.skip", path = %dir.display(), "scan.skip: missing entry.toml");
            return None;
        }
    };
    match toml::from_str(&text) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(event = "scan.skip", path = %dir.display(), error = %e, "scan.skip: invalid entry.toml");
            None
        }
    }
}

fn parse_created_at(meta: &EntryMeta) -> Option<DateTime<Utc>> {
    meta.created_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Local reference executor. Deleting removes the snapshot directory;
/// remote entries need the helper and are refused here. Payload processing
/// is the out-of-scope transfer engine's job, so `process` only validates
/// and records the request.
#[derive(Default)]
pub struct TreeExecutor;

impl TreeExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl BatchExecutor for TreeExecutor {
    fn delete<'a>(
        &'a self,
        identity: &'a EntryIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if identity.location.is_remote() {
                return Err(Error::CapabilityMissing {
                    message: format!(
                        "deleting on {} requires the helper",
                        identity.location.label()
                    ),
                });
            }
            match tokio::fs::remove_dir_all(&identity.backup_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(event = "executor.delete", identity = %identity, "executor.delete");
            Ok(())
        })
    }

    fn process<'a>(
        &'a self,
        selection: SelectionType,
        identities: &'a [EntryIdentity],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                event = "executor.process",
                selection = %selection,
                entries = identities.len(),
                "executor.process"
            );
            Ok(())
        })
    }
}

/// Fixed-answer scanner for tests: returns a canned entry set, counts
/// calls, and can be gated on a semaphore to simulate a long scan.
pub struct ScriptedScanner {
    entries: Vec<BackupEntry>,
    pub calls: AtomicUsize,
    gate: Option<std::sync::Arc<tokio::sync::Semaphore>>,
}

impl ScriptedScanner {
    pub fn new(entries: Vec<BackupEntry>) -> Self {
        Self {
            entries,
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(
        entries: Vec<BackupEntry>,
        gate: std::sync::Arc<tokio::sync::Semaphore>,
    ) -> Self {
        Self {
            entries,
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        }
    }
}

impl Scanner for ScriptedScanner {
    fn scan<'a>(
        &'a self,
        _cancel: Option<&'a CancellationToken>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BackupEntry>>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.map_err(|_| Error::Cancelled)?;
                permit.forget();
            }
            Ok(self.entries.clone())
        })
    }
}

/// Recording executor double.
#[derive(Default)]
pub struct ScriptedExecutor {
    pub deleted: std::sync::Mutex<Vec<EntryIdentity>>,
    pub processed: std::sync::Mutex<Vec<(SelectionType, Vec<EntryIdentity>)>>,
    pub fail_deletes: bool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchExecutor for ScriptedExecutor {
    fn delete<'a>(
        &'a self,
        identity: &'a EntryIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_deletes {
                return Err(Error::Probe {
                    message: "delete failed (injected)".to_string(),
                });
            }
            self.deleted
                .lock()
                .expect("executor poisoned")
                .push(identity.clone());
            Ok(())
        })
    }

    fn process<'a>(
        &'a self,
        selection: SelectionType,
        identities: &'a [EntryIdentity],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.processed
                .lock()
                .expect("executor poisoned")
                .push((selection, identities.to_vec()));
            Ok(())
        })
    }
}
