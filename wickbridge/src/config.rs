//! Bridge configuration.
//!
//! [`BridgeConfig`] says where the native engine library lives, which
//! manifests to start it from, and how calls on one handle may overlap. It
//! can be built in code or loaded from an INI file:
//!
//! ```ini
//! [engine]
//! library = /opt/wick/libwick_downloader.so
//! app_manifest = /var/lib/wick/app.manifest
//! chunk_manifest = /var/lib/wick/chunk.manifest
//!
//! [bridge]
//! call_policy = serialized
//! ```
//!
//! Both manifest keys must be set together or not at all.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::{c_string, native::LIBRARY_NAME};
use crate::gate::CallPolicy;

const ENGINE_SECTION: &str = "engine";
const BRIDGE_SECTION: &str = "bridge";

/// Manifest files the engine is initialized from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPaths {
    /// Application manifest.
    pub app: PathBuf,
    /// Chunk manifest.
    pub chunk: PathBuf,
}

impl ManifestPaths {
    pub fn new(app: impl Into<PathBuf>, chunk: impl Into<PathBuf>) -> Self {
        Self {
            app: app.into(),
            chunk: chunk.into(),
        }
    }

    /// Both paths as C strings, app manifest first.
    pub(crate) fn to_c_strings(&self) -> BridgeResult<(CString, CString)> {
        Ok((
            path_c_string(&self.app, "app manifest path")?,
            path_c_string(&self.chunk, "chunk manifest path")?,
        ))
    }
}

fn path_c_string(path: &Path, what: &'static str) -> BridgeResult<CString> {
    let utf8 = path.to_str().ok_or_else(|| BridgeError::NonUtf8Path {
        path: path.to_path_buf(),
    })?;
    c_string(utf8, what)
}

/// Configuration for starting an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Path or file name of the native engine library.
    pub library_path: PathBuf,
    /// Manifests to initialize from; the engine's built-in ones if `None`.
    pub manifests: Option<ManifestPaths>,
    /// Overlap policy for calls on one handle.
    pub call_policy: CallPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from(libloading::library_filename(LIBRARY_NAME)),
            manifests: None,
            call_policy: CallPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine library path.
    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = path.into();
        self
    }

    /// Initialize from manifest files.
    pub fn with_manifests(mut self, manifests: ManifestPaths) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Set the call policy.
    pub fn with_call_policy(mut self, policy: CallPolicy) -> Self {
        self.call_policy = policy;
        self
    }

    /// Default location of the configuration file
    /// (`<config dir>/wickbridge/config.ini`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wickbridge").join("config.ini"))
    }

    /// Load from the default location, falling back to defaults if there is
    /// no file there.
    pub fn load() -> BridgeResult<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_ini_file(&path),
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from an INI file.
    pub fn from_ini_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|err| {
            BridgeError::Config(format!("failed to read {}: {}", path.display(), err))
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_ini(&ini)
    }

    /// Parse INI text.
    pub fn from_ini_str(text: &str) -> BridgeResult<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|err| BridgeError::Config(format!("invalid configuration: {}", err)))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> BridgeResult<Self> {
        let mut config = Self::default();

        if let Some(engine) = ini.section(Some(ENGINE_SECTION)) {
            for (key, _) in engine.iter() {
                if !matches!(key, "library" | "app_manifest" | "chunk_manifest") {
                    warn!(section = ENGINE_SECTION, key, "Ignoring unknown configuration key");
                }
            }
            if let Some(library) = non_empty(engine.get("library")) {
                config.library_path = PathBuf::from(library);
            }
            config.manifests = match (
                non_empty(engine.get("app_manifest")),
                non_empty(engine.get("chunk_manifest")),
            ) {
                (Some(app), Some(chunk)) => Some(ManifestPaths::new(app, chunk)),
                (None, None) => None,
                (Some(_), None) => {
                    return Err(BridgeError::Config(
                        "app_manifest is set but chunk_manifest is not".to_string(),
                    ))
                }
                (None, Some(_)) => {
                    return Err(BridgeError::Config(
                        "chunk_manifest is set but app_manifest is not".to_string(),
                    ))
                }
            };
        }

        if let Some(bridge) = ini.section(Some(BRIDGE_SECTION)) {
            if let Some(policy) = non_empty(bridge.get("call_policy")) {
                config.call_policy = policy.parse()?;
            }
        }

        Ok(config)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
