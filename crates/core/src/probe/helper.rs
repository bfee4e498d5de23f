use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use serde::Deserialize;
use tracing::debug;

use crate::account::{Protocol, RemoteAccount};
use crate::probe::{RemoteClient, RemoteEntry};
use crate::{Error, Result};

/// Protocol session delegated to the helper binary. Each call is one
/// subprocess run: `probe`, `shares`, or `ls`, with the account record
/// passed as a JSON argument and results read as JSON lines on stdout.
pub struct HelperClient {
    helper: PathBuf,
    protocol: Protocol,
    account_json: String,
}

#[derive(Debug, Deserialize)]
struct ShareLine {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EntryLine {
    name: String,
    #[serde(default)]
    is_dir: bool,
}

impl HelperClient {
    pub fn new(helper: &Path, account: &RemoteAccount) -> Result<Self> {
        let account_json = serde_json::to_string(account).map_err(|e| Error::Probe {
            message: format!("account encode failed: {e}"),
        })?;
        Ok(Self {
            helper: helper.to_path_buf(),
            protocol: account.protocol(),
            account_json,
        })
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(
            event = "helper.run",
            helper = %self.helper.display(),
            subcommand = args[0],
            "helper.run"
        );
        let output = tokio::process::Command::new(&self.helper)
            .args(args)
            .arg("--account")
            .arg(&self.account_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Probe {
                message: format!("helper spawn failed: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe {
                message: format!("helper {} failed: {}", args[0], stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn parse_lines<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<Vec<T>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<T>(line).map_err(|e| Error::Probe {
                message: format!("helper output invalid: {e}; line={line}"),
            })
        })
        .collect()
}

impl RemoteClient for HelperClient {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn authenticate<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run(&["probe"]).await?;
            Ok(())
        })
    }

    fn list_shares<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            let stdout = self.run(&["shares"]).await?;
            let lines: Vec<ShareLine> = parse_lines(&stdout)?;
            Ok(lines.into_iter().map(|l| l.name).collect())
        })
    }

    fn list_dir<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteEntry>>> + Send + 'a>> {
        Box::pin(async move {
            let stdout = self.run(&["ls", "--path", path]).await?;
            let lines: Vec<EntryLine> = parse_lines(&stdout)?;
            Ok(lines
                .into_iter()
                .map(|l| RemoteEntry {
                    name: l.name,
                    is_dir: l.is_dir,
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{ProtocolExtra, SmbAuthMode};

    fn account() -> RemoteAccount {
        RemoteAccount {
            name: "nas1".to_string(),
            remote_root: String::new(),
            host: "10.0.0.5".to_string(),
            port: Some(445),
            user: "alice".to_string(),
            pass: "secret".to_string(),
            extra: ProtocolExtra::Smb {
                domain: String::new(),
                share: "media".to_string(),
                auth_mode: SmbAuthMode::Password,
            },
        }
    }

    #[test]
    fn json_lines_parse_and_reject_garbage() {
        let shares: Vec<ShareLine> =
            parse_lines("{\"name\":\"media\"}\n\n{\"name\":\"backups\"}\n").unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[1].name, "backups");

        let err = parse_lines::<ShareLine>("not json").unwrap_err();
        assert!(matches!(err, Error::Probe { message } if message.contains("not json")));
    }

    #[cfg(unix)]
    fn write_fake_helper(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-helper");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_subcommands_round_trip_through_a_real_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_fake_helper(
            dir.path(),
            r#"case "$1" in
probe) exit 0 ;;
shares) echo '{"name":"media"}'; echo '{"name":"backups"}' ;;
ls) echo '{"name":"phone","is_dir":true}'; echo '{"name":"notes.txt","is_dir":false}' ;;
esac"#,
        );

        let client = HelperClient::new(&helper, &account()).unwrap();
        client.authenticate().await.unwrap();

        let shares = client.list_shares().await.unwrap();
        assert_eq!(shares, vec!["media", "backups"]);

        let entries = client.list_dir("/media").await.unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "phone".to_string(),
                    is_dir: true,
                },
                RemoteEntry {
                    name: "notes.txt".to_string(),
                    is_dir: false,
                },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_failure_surfaces_stderr_as_the_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_fake_helper(dir.path(), "echo 'mount refused' >&2; exit 3");

        let client = HelperClient::new(&helper, &account()).unwrap();
        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Probe { message } if message.contains("mount refused")
        ));
    }
}
