//! Configuration for the hot reload service.
use std::{path::PathBuf, time::Duration};

use crate::{
    error::{HotReloadError, HotReloadErrorKind},
    link::fallback::FallbackKind,
};

/// Default TCP port of the reload listener.
pub const DEFAULT_PORT: u16 = 5567;
/// Listen backlog of the reload listener.
pub const LISTEN_BACKLOG: i32 = 3;
/// How long the listener waits on a connection that stops sending.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Default location of the bootstrap object, relative to the working directory.
pub const DEFAULT_BOOTSTRAP_PATH: &str = "./output.bootstrap.o";
/// Default entry symbol of the bootstrap object, without the platform's global prefix.
pub const DEFAULT_ENTRY_SYMBOL: &str = "Konan_start";

const PORT_VAR: &str = "HOTRELOAD_PORT";
const BOOTSTRAP_VAR: &str = "HOTRELOAD_BOOTSTRAP";
const ENTRY_VAR: &str = "HOTRELOAD_ENTRY";

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub port: u16,
    pub backlog: i32,
    pub bootstrap_path: PathBuf,
    pub entry_symbol: String,
    /// Names (without global prefix) that the weak fallback generator may define.
    pub weak_fallbacks: Vec<(String, FallbackKind)>,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: LISTEN_BACKLOG,
            bootstrap_path: PathBuf::from(DEFAULT_BOOTSTRAP_PATH),
            entry_symbol: DEFAULT_ENTRY_SYMBOL.to_string(),
            weak_fallbacks: crate::link::fallback::default_allow_list(),
        }
    }
}

impl ReloadConfig {
    /// Build a config from defaults, overridden by `HOTRELOAD_PORT`, `HOTRELOAD_BOOTSTRAP` and
    /// `HOTRELOAD_ENTRY` when set.
    pub fn from_env() -> Result<Self, HotReloadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HotReloadError> {
        let mut config = Self::default();
        if let Some(port) = lookup(PORT_VAR) {
            config.port = port.trim().parse().map_err(|_| HotReloadErrorKind::InvalidConfig {
                key: PORT_VAR,
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup(BOOTSTRAP_VAR) {
            if path.is_empty() {
                return Err(HotReloadErrorKind::InvalidConfig {
                    key: BOOTSTRAP_VAR,
                    value: path,
                }
                .into());
            }
            config.bootstrap_path = PathBuf::from(path);
        }
        if let Some(entry) = lookup(ENTRY_VAR) {
            config.entry_symbol = entry;
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bootstrap_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bootstrap_path = path.into();
        self
    }

    pub fn with_entry_symbol(mut self, name: impl Into<String>) -> Self {
        self.entry_symbol = name.into();
        self
    }
}
