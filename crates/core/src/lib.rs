mod account;
mod capability;
mod catalog;
mod engine;
mod error;
mod format;
mod index;
mod probe;
mod registry;
mod remote_config;
mod runtime;
mod scan;
mod session;
mod task_log;

pub const APP_NAME: &str = "PackStash";

pub use account::{
    AccountField, AccountSummary, Protocol, ProtocolExtra, RemoteAccount, SmbAuthMode, Validation,
    FTP_DEFAULT_PORT, SMB_DEFAULT_PORT, WEBDAV_PLAIN_PORT, WEBDAV_TLS_PORT,
};
pub use capability::{CapabilityGate, HelperCapability, StaticCapability};
pub use catalog::{BackupCatalog, CATALOG_FILE};
pub use engine::{
    Applied, Command, EntryRow, Intent, ListEngine, ListView, Mode, SortOrder, FLAG_FACETS,
    SORT_KEYS,
};
pub use error::{Error, Result};
pub use format::format_size;
pub use index::{
    BackupEntry, EntryIdentity, Location, OpType, SelectionType, SubjectDetail, SubjectKind,
};
pub use probe::{
    ClientFactory, HelperClientFactory, PathChoice, PathChooser, PathSelection, Prober,
    RemoteClient, RemoteEntry, ScriptedChooser, PROBE_TIMEOUT,
};
pub use registry::{
    parse_registry, validate_registry, AccountRegistry, InMemoryRegistryStore, RegistrySnapshot,
    RegistryStore, TomlRegistryStore, REGISTRY_FILE, REGISTRY_SCHEMA_VERSION,
};
pub use remote_config::{
    find_external_remote, list_external_remotes, remotes_path, ExternalRemote, REMOTES_FILE,
};
pub use runtime::{spawn_engine, EngineDeps, EngineHandle};
pub use scan::{
    BatchExecutor, Scanner, ScriptedExecutor, ScriptedScanner, TreeExecutor, TreeScanner,
    ENTRY_META_FILE,
};
pub use session::{Session, DEFAULT_HELPER, HELPER_ENV};
pub use task_log::{init_task_logging, start_task_log, TaskLogGuard};
