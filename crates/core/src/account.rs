use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SMB_DEFAULT_PORT: u16 = 445;
pub const FTP_DEFAULT_PORT: u16 = 21;
pub const WEBDAV_TLS_PORT: u16 = 443;
pub const WEBDAV_PLAIN_PORT: u16 = 80;

pub const SMB_GUEST_USER: &str = "Guest";
pub const SMB_ANONYMOUS_USER: &str = "Anonymous";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmbAuthMode {
    #[default]
    Password,
    Guest,
    Anonymous,
}

impl SmbAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Guest => "guest",
            Self::Anonymous => "anonymous",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password" => Some(Self::Password),
            "guest" => Some(Self::Guest),
            "anonymous" => Some(Self::Anonymous),
            _ => None,
        }
    }
}

/// Protocol-specific payload. One closed variant per supported protocol so
/// every consumption site matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolExtra {
    Smb {
        #[serde(default)]
        domain: String,
        #[serde(default)]
        share: String,
        #[serde(default)]
        auth_mode: SmbAuthMode,
    },
    #[serde(rename = "webdav")]
    WebDav {
        #[serde(default)]
        insecure: bool,
    },
    Ftp {},
    External { config_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Smb,
    WebDav,
    Ftp,
    External,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::WebDav => "webdav",
            Self::Ftp => "ftp",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountField {
    Name,
    Host,
    Port,
    User,
    Pass,
    ConfigName,
}

impl AccountField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Host => "host",
            Self::Port => "port",
            Self::User => "user",
            Self::Pass => "pass",
            Self::ConfigName => "config_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub complete: bool,
    pub missing: Vec<AccountField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub remote_root: String,
}

/// A named remote backup destination. `name` is the identity; `remote_root`
/// stays empty until a browse selects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub name: String,
    #[serde(default)]
    pub remote_root: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(flatten)]
    pub extra: ProtocolExtra,
}

impl RemoteAccount {
    pub fn protocol(&self) -> Protocol {
        match self.extra {
            ProtocolExtra::Smb { .. } => Protocol::Smb,
            ProtocolExtra::WebDav { .. } => Protocol::WebDav,
            ProtocolExtra::Ftp {} => Protocol::Ftp,
            ProtocolExtra::External { .. } => Protocol::External,
        }
    }

    pub fn effective_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        match self.extra {
            ProtocolExtra::Smb { .. } => SMB_DEFAULT_PORT,
            ProtocolExtra::WebDav { insecure } => {
                if insecure {
                    WEBDAV_PLAIN_PORT
                } else {
                    WEBDAV_TLS_PORT
                }
            }
            ProtocolExtra::Ftp {} => FTP_DEFAULT_PORT,
            ProtocolExtra::External { .. } => 0,
        }
    }

    /// Switches the SMB auth mode, forcing `user`/`pass`/`domain` to their
    /// canonical sentinel values for `Guest`/`Anonymous`. Switching back to
    /// `Password` leaves previously entered values untouched. No-op for
    /// non-SMB accounts.
    pub fn apply_auth_mode(&mut self, mode: SmbAuthMode) {
        let ProtocolExtra::Smb {
            domain, auth_mode, ..
        } = &mut self.extra
        else {
            return;
        };
        *auth_mode = mode;
        let sentinel = match mode {
            SmbAuthMode::Password => None,
            SmbAuthMode::Guest => Some(SMB_GUEST_USER),
            SmbAuthMode::Anonymous => Some(SMB_ANONYMOUS_USER),
        };
        if sentinel.is_some() {
            domain.clear();
        }
        if let Some(user) = sentinel {
            self.user = user.to_string();
            self.pass.clear();
        }
    }

    /// Re-establishes the auth-mode invariant after deserializing a snapshot
    /// that may have been edited by hand.
    pub(crate) fn normalize(&mut self) {
        if let ProtocolExtra::Smb { auth_mode, .. } = self.extra {
            self.apply_auth_mode(auth_mode);
        }
    }

    pub fn validate(&self) -> Validation {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push(AccountField::Name);
        }
        match &self.extra {
            ProtocolExtra::Smb { auth_mode, .. } => {
                if self.host.trim().is_empty() {
                    missing.push(AccountField::Host);
                }
                if self.port.is_none() {
                    missing.push(AccountField::Port);
                }
                if *auth_mode == SmbAuthMode::Password {
                    if self.user.is_empty() {
                        missing.push(AccountField::User);
                    }
                    if self.pass.is_empty() {
                        missing.push(AccountField::Pass);
                    }
                }
            }
            ProtocolExtra::WebDav { .. } => {
                if self.host.trim().is_empty() {
                    missing.push(AccountField::Host);
                }
                if self.user.is_empty() {
                    missing.push(AccountField::User);
                }
                if self.pass.is_empty() {
                    missing.push(AccountField::Pass);
                }
            }
            ProtocolExtra::Ftp {} => {
                if self.host.trim().is_empty() {
                    missing.push(AccountField::Host);
                }
                if self.port.is_none() {
                    missing.push(AccountField::Port);
                }
                if self.user.is_empty() {
                    missing.push(AccountField::User);
                }
                if self.pass.is_empty() {
                    missing.push(AccountField::Pass);
                }
            }
            ProtocolExtra::External { config_name } => {
                if config_name.trim().is_empty() {
                    missing.push(AccountField::ConfigName);
                }
            }
        }
        Validation {
            complete: missing.is_empty(),
            missing,
        }
    }

    pub fn ensure_complete(&self) -> Result<()> {
        let validation = self.validate();
        if validation.complete {
            return Ok(());
        }
        let fields: Vec<&str> = validation.missing.iter().map(|f| f.as_str()).collect();
        Err(Error::Validation {
            message: format!("missing fields: {}", fields.join(", ")),
        })
    }

    /// Complete and browsed: only then may backups target this account.
    pub fn ready_for_backup(&self) -> bool {
        self.validate().complete && !self.remote_root.is_empty()
    }

    pub fn describe(&self) -> AccountSummary {
        let endpoint = match &self.extra {
            ProtocolExtra::Smb { share, .. } => {
                if share.is_empty() {
                    format!("{}:{}", self.host, self.effective_port())
                } else {
                    format!("{}:{}/{}", self.host, self.effective_port(), share)
                }
            }
            ProtocolExtra::WebDav { insecure } => {
                if self.host.contains("://") {
                    self.host.clone()
                } else {
                    let scheme = if *insecure { "http" } else { "https" };
                    match self.port {
                        Some(port) => format!("{scheme}://{}:{port}", self.host),
                        None => format!("{scheme}://{}", self.host),
                    }
                }
            }
            ProtocolExtra::Ftp {} => format!("{}:{}", self.host, self.effective_port()),
            ProtocolExtra::External { config_name } => format!("config:{config_name}"),
        };
        AccountSummary {
            name: self.name.clone(),
            protocol: self.protocol(),
            endpoint,
            remote_root: self.remote_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smb_account() -> RemoteAccount {
        RemoteAccount {
            name: "nas1".to_string(),
            remote_root: String::new(),
            host: "10.0.0.5".to_string(),
            port: Some(445),
            user: "alice".to_string(),
            pass: "secret".to_string(),
            extra: ProtocolExtra::Smb {
                domain: "WORKGROUP".to_string(),
                share: String::new(),
                auth_mode: SmbAuthMode::Password,
            },
        }
    }

    #[test]
    fn guest_mode_forces_sentinel_credentials() {
        let mut account = smb_account();
        account.apply_auth_mode(SmbAuthMode::Guest);

        assert_eq!(account.user, "Guest");
        assert_eq!(account.pass, "");
        assert_eq!(
            account.extra,
            ProtocolExtra::Smb {
                domain: String::new(),
                share: String::new(),
                auth_mode: SmbAuthMode::Guest,
            }
        );
    }

    #[test]
    fn anonymous_mode_forces_sentinel_credentials() {
        let mut account = smb_account();
        account.apply_auth_mode(SmbAuthMode::Anonymous);

        assert_eq!(account.user, "Anonymous");
        assert_eq!(account.pass, "");
    }

    #[test]
    fn switching_back_to_password_keeps_fields() {
        let mut account = smb_account();
        account.apply_auth_mode(SmbAuthMode::Guest);
        account.user = "bob".to_string();
        account.pass = "hunter2".to_string();
        account.apply_auth_mode(SmbAuthMode::Password);

        assert_eq!(account.user, "bob");
        assert_eq!(account.pass, "hunter2");
    }

    #[test]
    fn auth_mode_is_a_noop_for_non_smb() {
        let mut account = RemoteAccount {
            name: "dav".to_string(),
            remote_root: String::new(),
            host: "https://dav.example.com".to_string(),
            port: None,
            user: "alice".to_string(),
            pass: "secret".to_string(),
            extra: ProtocolExtra::WebDav { insecure: false },
        };
        account.apply_auth_mode(SmbAuthMode::Guest);

        assert_eq!(account.user, "alice");
        assert_eq!(account.pass, "secret");
    }

    #[test]
    fn guest_smb_with_empty_share_is_complete_but_not_ready() {
        let mut account = smb_account();
        account.apply_auth_mode(SmbAuthMode::Guest);

        let validation = account.validate();
        assert!(validation.complete, "missing: {:?}", validation.missing);
        assert!(!account.ready_for_backup());

        account.remote_root = "/backups".to_string();
        assert!(account.ready_for_backup());
    }

    #[test]
    fn password_smb_requires_credentials() {
        let mut account = smb_account();
        account.user.clear();
        account.pass.clear();

        let validation = account.validate();
        assert!(!validation.complete);
        assert_eq!(
            validation.missing,
            vec![AccountField::User, AccountField::Pass]
        );
        assert!(account.ensure_complete().is_err());
    }

    #[test]
    fn external_requires_config_name() {
        let account = RemoteAccount {
            name: "box".to_string(),
            remote_root: String::new(),
            host: String::new(),
            port: None,
            user: String::new(),
            pass: String::new(),
            extra: ProtocolExtra::External {
                config_name: String::new(),
            },
        };
        assert_eq!(account.validate().missing, vec![AccountField::ConfigName]);
    }

    #[test]
    fn protocol_tag_round_trips_through_toml() {
        let text = r#"
name = "nas1"
host = "10.0.0.5"
port = 445
protocol = "smb"
share = "media"
auth_mode = "guest"
"#;
        let account: RemoteAccount = toml::from_str(text).unwrap();
        assert_eq!(account.protocol(), Protocol::Smb);
        assert_eq!(
            account.extra,
            ProtocolExtra::Smb {
                domain: String::new(),
                share: "media".to_string(),
                auth_mode: SmbAuthMode::Guest,
            }
        );

        let encoded = toml::to_string(&account).unwrap();
        let decoded: RemoteAccount = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn describe_summarizes_endpoints() {
        let mut account = smb_account();
        assert_eq!(account.describe().endpoint, "10.0.0.5:445");

        account.extra = ProtocolExtra::Smb {
            domain: String::new(),
            share: "media".to_string(),
            auth_mode: SmbAuthMode::Password,
        };
        assert_eq!(account.describe().endpoint, "10.0.0.5:445/media");

        let dav = RemoteAccount {
            name: "dav".to_string(),
            remote_root: String::new(),
            host: "dav.example.com".to_string(),
            port: Some(8443),
            user: "u".to_string(),
            pass: "p".to_string(),
            extra: ProtocolExtra::WebDav { insecure: false },
        };
        assert_eq!(dav.describe().endpoint, "https://dav.example.com:8443");

        let external = RemoteAccount {
            name: "box".to_string(),
            remote_root: String::new(),
            host: String::new(),
            port: None,
            user: String::new(),
            pass: String::new(),
            extra: ProtocolExtra::External {
                config_name: "gdrive".to_string(),
            },
        };
        assert_eq!(external.describe().endpoint, "config:gdrive");
    }
}
