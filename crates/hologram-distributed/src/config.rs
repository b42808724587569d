//! Backend loader configuration

use std::ffi::OsString;
use std::path::PathBuf;

/// Explicit path to the message-passing library
pub const LIBRARY_ENV: &str = "HOLOGRAM_MPI_LIBRARY";
/// Substring the library's version string must contain
pub const IDENTITY_ENV: &str = "HOLOGRAM_MPI_IDENTITY";
/// Skip probing entirely when set to `1`, `true` or `yes`
pub const DISABLE_ENV: &str = "HOLOGRAM_DISTRIBUTED_DISABLE";

/// Identity of the only ABI the native binding speaks
pub const DEFAULT_IDENTITY: &str = "Open MPI";

/// How the runtime locates and validates the native library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Library to open; the platform name of `mpi` when unset
    pub library: Option<PathBuf>,
    pub expected_identity: String,
    /// Never probe; the backend is reported unavailable
    pub disabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            library: None,
            expected_identity: DEFAULT_IDENTITY.to_string(),
            disabled: false,
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by the `HOLOGRAM_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = std::env::var_os(LIBRARY_ENV).filter(|p| !p.is_empty()) {
            config.library = Some(PathBuf::from(path));
        }
        if let Ok(identity) = std::env::var(IDENTITY_ENV) {
            if !identity.trim().is_empty() {
                config.expected_identity = identity.trim().to_string();
            }
        }
        if let Ok(flag) = std::env::var(DISABLE_ENV) {
            config.disabled = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }

    pub fn with_library(mut self, library: impl Into<PathBuf>) -> Self {
        self.library = Some(library.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.expected_identity = identity.into();
        self
    }

    /// Name handed to the dynamic loader
    pub fn library_name(&self) -> OsString {
        match &self.library {
            Some(path) => path.clone().into_os_string(),
            None => libloading::library_filename("mpi"),
        }
    }
}
