use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{Error, Result};

pub const REMOTES_FILE: &str = "remotes.toml";

/// A remote defined outside the account registry, in the helper's own
/// config file. Accounts with the `external` protocol reference these by
/// name and delegate all transport work to the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRemote {
    pub name: String,
    pub remote_type: String,
}

pub fn remotes_path(config_dir: &Path) -> PathBuf {
    config_dir.join(REMOTES_FILE)
}

/// Lists remotes from the helper config, sorted by name. A missing file is
/// an empty list, not an error: the helper config is optional.
pub fn list_external_remotes(config_dir: &Path) -> Result<Vec<ExternalRemote>> {
    let path = remotes_path(config_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("remotes config read failed: {e}"),
    })?;
    let table: toml::Table = toml::from_str(&text).map_err(|e| Error::InvalidConfig {
        message: format!("remotes config invalid: {e}"),
    })?;

    let mut remotes = Vec::new();
    for (name, value) in table {
        let Some(section) = value.as_table() else {
            warn!(
                event = "remotes.skip",
                name, "remotes.skip: top-level entry is not a table"
            );
            continue;
        };
        let remote_type = section
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        remotes.push(ExternalRemote {
            name,
            remote_type,
        });
    }
    remotes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(remotes)
}

pub fn find_external_remote(config_dir: &Path, name: &str) -> Result<Option<ExternalRemote>> {
    Ok(list_external_remotes(config_dir)?
        .into_iter()
        .find(|r| r.name == name))
}
