use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Gate for operations that need the elevated helper binary (raw protocol
/// access, removing foreign-owned backup trees). Checked before the work
/// starts so accounts can still be created and inspected without it.
pub trait CapabilityGate: Send + Sync {
    fn ensure_available(&self) -> Result<()>;

    fn is_available(&self) -> bool {
        self.ensure_available().is_ok()
    }
}

/// Capability backed by a helper executable on disk.
pub struct HelperCapability {
    helper: PathBuf,
}

impl HelperCapability {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    pub fn helper_path(&self) -> &Path {
        &self.helper
    }
}

impl CapabilityGate for HelperCapability {
    fn ensure_available(&self) -> Result<()> {
        let meta = match std::fs::metadata(&self.helper) {
            Ok(meta) => meta,
            Err(_) => {
                return Err(Error::CapabilityMissing {
                    message: format!("helper binary not found: {}", self.helper.display()),
                });
            }
        };
        if !meta.is_file() {
            return Err(Error::CapabilityMissing {
                message: format!("helper path is not a file: {}", self.helper.display()),
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(Error::CapabilityMissing {
                    message: format!("helper binary is not executable: {}", self.helper.display()),
                });
            }
        }

        debug!(event = "capability.ok", helper = %self.helper.display(), "capability.ok");
        Ok(())
    }
}

/// Fixed-answer gate for tests and for builds that bundle the helper.
pub struct StaticCapability {
    available: bool,
    reason: String,
}

impl StaticCapability {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: String::new(),
        }
    }

    pub fn missing(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
        }
    }
}

impl CapabilityGate for StaticCapability {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::CapabilityMissing {
                message: self.reason.clone(),
            })
        }
    }
}
