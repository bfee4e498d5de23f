use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::account::{Protocol, ProtocolExtra, RemoteAccount};
use crate::capability::CapabilityGate;
use crate::{Error, Result};

pub mod helper;
pub mod webdav;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Outcome of an accepted browse: the directory path on the remote and, for
/// SMB, the share it lives in (empty for other protocols).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSelection {
    pub path: String,
    pub share: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChoice {
    Enter(String),
    Accept,
    Cancel,
}

/// Decides where to go at each step of a browse. Interactive in a UI;
/// scripted in the CLI and in tests.
pub trait PathChooser {
    fn choose_share(&mut self, shares: &[String]) -> Option<String>;
    fn choose_path(&mut self, current: &str, listing: &[RemoteEntry]) -> PathChoice;
}

/// Protocol session used by probe and browse. Implementations never mutate
/// the account record.
pub trait RemoteClient: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn authenticate<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn list_shares<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

    fn list_dir<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteEntry>>> + Send + 'a>>;
}

impl std::fmt::Debug for dyn RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient").finish_non_exhaustive()
    }
}

pub trait ClientFactory: Send + Sync {
    fn client_for(&self, account: &RemoteAccount) -> Result<Arc<dyn RemoteClient>>;
}

/// Production factory: WebDAV speaks HTTP natively, everything else goes
/// through the helper subprocess. The capability gate is consulted only for
/// helper-backed protocols; WebDAV works without the helper installed.
pub struct HelperClientFactory {
    helper: PathBuf,
    capability: Arc<dyn CapabilityGate>,
}

impl HelperClientFactory {
    pub fn new(helper: impl Into<PathBuf>, capability: Arc<dyn CapabilityGate>) -> Self {
        Self {
            helper: helper.into(),
            capability,
        }
    }
}

impl ClientFactory for HelperClientFactory {
    fn client_for(&self, account: &RemoteAccount) -> Result<Arc<dyn RemoteClient>> {
        match &account.extra {
            ProtocolExtra::WebDav { .. } => Ok(Arc::new(webdav::WebDavClient::new(account)?)),
            ProtocolExtra::Smb { .. } | ProtocolExtra::Ftp {} | ProtocolExtra::External { .. } => {
                self.capability.ensure_available()?;
                Ok(Arc::new(helper::HelperClient::new(&self.helper, account)?))
            }
        }
    }
}

/// Connection prober: read-only, cancellable checks against an account's
/// remote. Failures are recoverable and leave the account untouched.
pub struct Prober {
    factory: Arc<dyn ClientFactory>,
    timeout: Duration,
}

impl Prober {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_timeout(factory, PROBE_TIMEOUT)
    }

    pub fn with_timeout(factory: Arc<dyn ClientFactory>, timeout: Duration) -> Self {
        Self { factory, timeout }
    }

    pub async fn test_connection(
        &self,
        account: &RemoteAccount,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        account.ensure_complete()?;
        check_cancelled(cancel)?;

        let client = self.factory.client_for(account)?;
        info!(
            event = "probe.start",
            account = %account.name,
            protocol = %client.protocol(),
            "probe.start"
        );

        let result = self.run_step(client.authenticate(), cancel).await;
        match &result {
            Ok(()) => info!(event = "probe.ok", account = %account.name, "probe.ok"),
            Err(e) => warn!(event = "probe.failed", account = %account.name, error = %e, "probe.failed"),
        }
        result
    }

    /// Walks the remote under the chooser's direction. `Ok(None)` is the
    /// "nothing picked" outcome: the chooser backed out, or an SMB host
    /// exposed no shares.
    pub async fn browse_remote_path(
        &self,
        account: &RemoteAccount,
        chooser: &mut dyn PathChooser,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<PathSelection>> {
        account.ensure_complete()?;
        check_cancelled(cancel)?;

        let client = self.factory.client_for(account)?;
        info!(
            event = "browse.start",
            account = %account.name,
            protocol = %client.protocol(),
            "browse.start"
        );
        self.run_step(client.authenticate(), cancel).await?;

        let mut share = String::new();
        if let ProtocolExtra::Smb {
            share: configured, ..
        } = &account.extra
        {
            share = configured.clone();
            if share.is_empty() {
                let shares = self.run_step(client.list_shares(), cancel).await?;
                if shares.is_empty() {
                    info!(event = "browse.no_shares", account = %account.name, "browse.no_shares");
                    return Ok(None);
                }
                match chooser.choose_share(&shares) {
                    Some(choice) => share = choice,
                    None => return Ok(None),
                }
            }
        }

        let mut path = if share.is_empty() {
            "/".to_string()
        } else {
            format!("/{share}")
        };

        loop {
            check_cancelled(cancel)?;
            let listing = self.run_step(client.list_dir(&path), cancel).await?;
            match chooser.choose_path(&path, &listing) {
                PathChoice::Enter(name) => {
                    path = join_remote(&path, &name);
                }
                PathChoice::Accept => {
                    info!(event = "browse.done", account = %account.name, path = %path, "browse.done");
                    return Ok(Some(PathSelection { path, share }));
                }
                PathChoice::Cancel => return Ok(None),
            }
        }
    }

    async fn run_step<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T> {
        let work = tokio::time::timeout(self.timeout, fut);
        let res = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    res = work => res,
                }
            }
            None => work.await,
        };
        match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::Probe {
                message: format!("timed out after {}s", self.timeout.as_secs()),
            }),
        }
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(cancel) = cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn join_remote(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Chooser driven by a fixed script: an optional share pick plus directory
/// segments to descend, then accept. Used by the CLI and by tests.
pub struct ScriptedChooser {
    share: Option<String>,
    segments: std::collections::VecDeque<String>,
}

impl ScriptedChooser {
    pub fn new(share: Option<String>, segments: Vec<String>) -> Self {
        Self {
            share,
            segments: segments.into(),
        }
    }
}

impl PathChooser for ScriptedChooser {
    fn choose_share(&mut self, shares: &[String]) -> Option<String> {
        let wanted = self.share.as_deref()?;
        shares.iter().find(|s| s.as_str() == wanted).cloned()
    }

    fn choose_path(&mut self, _current: &str, _listing: &[RemoteEntry]) -> PathChoice {
        match self.segments.pop_front() {
            Some(next) => PathChoice::Enter(next),
            None => PathChoice::Accept,
        }
    }
}
