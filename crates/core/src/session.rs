use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::account::{ProtocolExtra, RemoteAccount};
use crate::capability::HelperCapability;
use crate::catalog::{BackupCatalog, CATALOG_FILE};
use crate::index::SubjectKind;
use crate::probe::{HelperClientFactory, PathSelection, Prober};
use crate::registry::{AccountRegistry, TomlRegistryStore};
use crate::remote_config::{self, REMOTES_FILE};
use crate::runtime::EngineDeps;
use crate::scan::{TreeExecutor, TreeScanner};
use crate::{Error, Result};

pub const HELPER_ENV: &str = "PACKSTASH_HELPER";
pub const DEFAULT_HELPER: &str = "packstash-helper";

/// One process's view of the stash: registry, catalog, prober and the
/// directories they live in. The CLI builds exactly one per invocation.
pub struct Session {
    config_dir: PathBuf,
    data_dir: PathBuf,
    registry: AccountRegistry,
    catalog: Arc<BackupCatalog>,
    prober: Prober,
    capability: Arc<HelperCapability>,
}

impl Session {
    pub async fn open(config_dir: &Path, data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        std::fs::create_dir_all(data_dir)?;

        let registry = AccountRegistry::open(Arc::new(TomlRegistryStore::new(config_dir)))?;
        let catalog = Arc::new(BackupCatalog::open(&data_dir.join(CATALOG_FILE)).await?);

        let capability = Arc::new(HelperCapability::new(resolve_helper()));
        let factory = Arc::new(HelperClientFactory::new(
            capability.helper_path(),
            capability.clone(),
        ));
        let prober = Prober::new(factory);

        info!(
            event = "session.open",
            config_dir = %config_dir.display(),
            data_dir = %data_dir.display(),
            accounts = registry.accounts().len(),
            "session.open"
        );

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            registry,
            catalog,
            prober,
            capability,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Root of the local artifact tree the scanner walks.
    pub fn backup_root(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AccountRegistry {
        &mut self.registry
    }

    pub fn catalog(&self) -> Arc<BackupCatalog> {
        self.catalog.clone()
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    pub fn capability(&self) -> &HelperCapability {
        &self.capability
    }

    /// Registry upsert with the extra check external accounts need: the
    /// referenced remote must be defined in `remotes.toml`.
    pub fn upsert_account(&mut self, account: RemoteAccount, editing: bool) -> Result<()> {
        if let ProtocolExtra::External { config_name } = &account.extra
            && remote_config::find_external_remote(&self.config_dir, config_name)?.is_none()
        {
            return Err(Error::Validation {
                message: format!("remote not defined in {REMOTES_FILE}: {config_name}"),
            });
        }
        self.registry.upsert(account, editing)
    }

    /// Deletes an account unless backup entries still reference it. The
    /// guard keeps catalog rows from pointing at a location nobody can
    /// resolve anymore.
    pub async fn delete_account(&mut self, name: &str) -> Result<RemoteAccount> {
        let entries = self.catalog.remote_use_count(name).await?;
        if entries > 0 {
            return Err(Error::AccountInUse {
                name: name.to_string(),
                entries,
            });
        }
        self.registry.delete(name)
    }

    /// Writes an accepted browse result back onto the account: the picked
    /// path becomes the remote root, and for SMB the picked share sticks.
    pub fn apply_path_selection(&mut self, name: &str, selection: &PathSelection) -> Result<()> {
        let Some(account) = self.registry.find_by_name(name) else {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        };

        let mut updated = account.clone();
        updated.remote_root = selection.path.clone();
        if let ProtocolExtra::Smb { share, .. } = &mut updated.extra
            && !selection.share.is_empty()
        {
            *share = selection.share.clone();
        }
        self.registry.upsert(updated, true)
    }

    pub fn engine_deps(&self, kind: SubjectKind) -> EngineDeps {
        EngineDeps {
            kind,
            catalog: self.catalog.clone(),
            scanner: Arc::new(TreeScanner::scoped(self.backup_root(), kind)),
            executor: Arc::new(TreeExecutor::new()),
            accounts: self.registry.account_names(),
        }
    }
}

/// `PACKSTASH_HELPER` wins; a bare name falls back to a `PATH` search so
/// the capability check sees the same binary a spawn would.
fn resolve_helper() -> PathBuf {
    let configured = std::env::var(HELPER_ENV).unwrap_or_else(|_| DEFAULT_HELPER.to_string());
    let configured = PathBuf::from(configured);
    if configured.components().count() > 1 {
        return configured;
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(&configured);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    configured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::SmbAuthMode;
    use crate::index::{BackupEntry, Location, OpType, SubjectDetail};

    fn smb_account(name: &str) -> RemoteAccount {
        RemoteAccount {
            name: name.to_string(),
            remote_root: String::new(),
            host: "10.0.0.5".to_string(),
            port: Some(445),
            user: "alice".to_string(),
            pass: "secret".to_string(),
            extra: ProtocolExtra::Smb {
                domain: String::new(),
                share: String::new(),
                auth_mode: SmbAuthMode::Password,
            },
        }
    }

    fn remote_entry(name: &str, remote: &str) -> BackupEntry {
        BackupEntry {
            subject_id: name.to_string(),
            op_type: OpType::Restore,
            user_id: Some(0),
            preserve_id: 1000,
            location: Location::Remote(remote.to_string()),
            backup_dir: format!("/b/{name}"),
            size_bytes: 1,
            size_display: "1 B".to_string(),
            detail: SubjectDetail::Package {
                label: name.to_string(),
                version: "1.0".to_string(),
                system_app: false,
                has_keystore: false,
                ssaid: String::new(),
                installed: true,
            },
            created_at: None,
        }
    }

    #[tokio::test]
    async fn session_persists_accounts_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");
        let data = dir.path().join("data");

        {
            let mut session = Session::open(&config, &data).await.unwrap();
            session.upsert_account(smb_account("nas1"), false).unwrap();
            session
                .registry_mut()
                .set_active_account(Some("nas1"))
                .unwrap();
        }

        let session = Session::open(&config, &data).await.unwrap();
        assert_eq!(session.registry().account_names(), vec!["nas1"]);
        assert_eq!(session.registry().active_account(), Some("nas1"));
    }

    #[tokio::test]
    async fn delete_is_refused_while_entries_reference_the_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(&dir.path().join("c"), &dir.path().join("d"))
            .await
            .unwrap();
        session.upsert_account(smb_account("nas1"), false).unwrap();

        session
            .catalog()
            .replace_all(SubjectKind::Package, &[remote_entry("com.a", "nas1")])
            .await
            .unwrap();

        let err = session.delete_account("nas1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::AccountInUse { ref name, entries: 1 } if name == "nas1"
        ));

        session
            .catalog()
            .replace_all(SubjectKind::Package, &[])
            .await
            .unwrap();
        let removed = session.delete_account("nas1").await.unwrap();
        assert_eq!(removed.name, "nas1");
    }

    #[tokio::test]
    async fn external_accounts_must_reference_a_defined_remote() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("c");
        let mut session = Session::open(&config, &dir.path().join("d"))
            .await
            .unwrap();

        let mut account = smb_account("cloud1");
        account.extra = ProtocolExtra::External {
            config_name: "gdrive".to_string(),
        };

        let err = session.upsert_account(account.clone(), false).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        std::fs::write(
            config.join(REMOTES_FILE),
            "[gdrive]\ntype = \"drive\"\n",
        )
        .unwrap();
        session.upsert_account(account, false).unwrap();
        assert_eq!(session.registry().account_names(), vec!["cloud1"]);
    }

    #[tokio::test]
    async fn accepted_browse_updates_root_and_share() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(&dir.path().join("c"), &dir.path().join("d"))
            .await
            .unwrap();
        session.upsert_account(smb_account("nas1"), false).unwrap();

        session
            .apply_path_selection(
                "nas1",
                &PathSelection {
                    path: "/backups/phone".to_string(),
                    share: "backups".to_string(),
                },
            )
            .unwrap();

        let account = session.registry().find_by_name("nas1").unwrap();
        assert_eq!(account.remote_root, "/backups/phone");
        let ProtocolExtra::Smb { ref share, .. } = account.extra else {
            panic!("expected an smb account");
        };
        assert_eq!(share, "backups");

        let err = session
            .apply_path_selection(
                "ghost",
                &PathSelection {
                    path: "/x".to_string(),
                    share: String::new(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
