pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid account: {message}")]
    Validation { message: String },

    #[error("account name already in use: {name}")]
    DuplicateName { name: String },

    #[error("account not found: {name}")]
    NotFound { name: String },

    #[error("account still referenced by {entries} backup entries: {name}")]
    AccountInUse { name: String, entries: u64 },

    #[error("probe failed: {message}")]
    Probe { message: String },

    #[error("elevated capability unavailable: {message}")]
    CapabilityMissing { message: String },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),
}
