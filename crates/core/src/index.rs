use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Package,
    Media,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Package => "package",
            SubjectKind::Media => "media",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "package" => Some(SubjectKind::Package),
            "media" => Some(SubjectKind::Media),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Backup,
    Restore,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Backup => "backup",
            OpType::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(OpType::Backup),
            "restore" => Some(OpType::Restore),
            _ => None,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload granularity of a batch process request. Media batches always
/// use `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionType {
    #[default]
    Default,
    Apk,
    Data,
    Both,
}

impl SelectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionType::Default => "default",
            SelectionType::Apk => "apk",
            SelectionType::Data => "data",
            SelectionType::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(SelectionType::Default),
            "apk" => Some(SelectionType::Apk),
            "data" => Some(SelectionType::Data),
            "both" => Some(SelectionType::Both),
            _ => None,
        }
    }
}

impl fmt::Display for SelectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an artifact lives. The catalog stores the remote account name and
/// uses the empty string for local entries, so account names must be
/// non-empty (the registry enforces that).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Local,
    Remote(String),
}

impl Location {
    pub fn as_token(&self) -> &str {
        match self {
            Location::Local => "",
            Location::Remote(name) => name,
        }
    }

    pub fn from_token(token: &str) -> Self {
        if token.is_empty() {
            Location::Local
        } else {
            Location::Remote(token.to_string())
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Location::Local => "Local",
            Location::Remote(name) => name,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote(_))
    }
}

/// Presentation metadata carried opaquely through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubjectDetail {
    Package {
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
    },
    Media {
        #[serde(default)]
        path: String,
    },
}

impl SubjectDetail {
    pub fn kind(&self) -> SubjectKind {
        match self {
            SubjectDetail::Package { .. } => SubjectKind::Package,
            SubjectDetail::Media { .. } => SubjectKind::Media,
        }
    }

    pub fn is_system_app(&self) -> bool {
        matches!(self, SubjectDetail::Package { system_app: true, .. })
    }
}

/// One backup artifact (or current-slot row) in the index.
///
/// `preserve_id` is the epoch-millis snapshot disambiguator; `0` marks the
/// live slot a new backup would write into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub subject_id: String,
    pub op_type: OpType,
    pub user_id: Option<u32>,
    pub preserve_id: i64,
    pub location: Location,
    pub backup_dir: String,
    pub size_bytes: u64,
    pub size_display: String,
    pub detail: SubjectDetail,
    pub created_at: Option<DateTime<Utc>>,
}

impl BackupEntry {
    pub fn kind(&self) -> SubjectKind {
        self.detail.kind()
    }

    pub fn identity(&self) -> EntryIdentity {
        EntryIdentity {
            subject_id: self.subject_id.clone(),
            op_type: self.op_type,
            user_id: self.user_id,
            preserve_id: self.preserve_id,
            location: self.location.clone(),
            backup_dir: self.backup_dir.clone(),
        }
    }

    /// Human title: the package label when present, otherwise the subject id.
    pub fn title(&self) -> &str {
        match &self.detail {
            SubjectDetail::Package { label, .. } if !label.is_empty() => label,
            _ => &self.subject_id,
        }
    }
}

/// Composite identity of an entry, the unit of selection and deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryIdentity {
    pub subject_id: String,
    pub op_type: OpType,
    pub user_id: Option<u32>,
    pub preserve_id: i64,
    pub location: Location,
    pub backup_dir: String,
}

impl fmt::Display for EntryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}-", self.subject_id, self.op_type)?;
        if let Some(user_id) = self.user_id {
            write!(f, "{user_id}-")?;
        }
        write!(
            f,
            "{}-{}-{}",
            self.preserve_id,
            self.location.as_token(),
            self.backup_dir
        )
    }
}
