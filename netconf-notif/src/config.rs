use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::core::{NtfError, Result};

/// Environment variable overriding the streams directory.
pub const STREAMS_PATH_ENV: &str = "LIBNETCONF_STREAMS";

/// Build-time default for the streams directory. Overridable at compile
/// time through the `NETCONF_STREAMS_DIR` environment variable.
pub const DEFAULT_STREAMS_PATH: &str = match option_env!("NETCONF_STREAMS_DIR") {
    Some(path) => path,
    None => "/var/run/netconf-events",
};

/// Configuration of the notification subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Directory holding the `<stream>.events` and `<stream>.rules` files
    pub directory: PathBuf,
}

impl StreamsConfig {
    /// Configuration pointing at an explicit streams directory
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Resolve the streams directory from the `LIBNETCONF_STREAMS`
    /// environment variable, falling back to the build-time default.
    pub fn from_env() -> Self {
        let directory = env::var_os(STREAMS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STREAMS_PATH));
        Self { directory }
    }

    /// Make sure the streams directory exists and is usable. A missing
    /// directory is created world-accessible so that cooperating processes
    /// can share the stream files.
    pub(crate) fn ensure_directory(&self) -> Result<()> {
        if !self.directory.exists() {
            fs::create_dir_all(&self.directory).map_err(|e| {
                NtfError::Configuration(format!(
                    "unable to create streams directory {}: {e}",
                    self.directory.display()
                ))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&self.directory, fs::Permissions::from_mode(0o777));
            }
            info!(directory = %self.directory.display(), "created streams directory");
        } else if !self.directory.is_dir() {
            return Err(NtfError::Configuration(format!(
                "streams path {} exists but is not a directory",
                self.directory.display()
            )));
        }
        Ok(())
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_STREAMS_PATH),
        }
    }
}
