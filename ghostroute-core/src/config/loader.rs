//! Configuration file loading

use super::schema::Config;
use crate::error::{GhostrouteError, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Find the user config by checking environment and standard locations
    pub fn find_user_config() -> Option<PathBuf> {
        // 1. $GHOSTROUTE_CONFIG
        if let Ok(path) = env::var("GHOSTROUTE_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        // 2. $XDG_CONFIG_HOME/ghostroute/config.toml
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            let p = PathBuf::from(xdg).join("ghostroute/config.toml");
            if p.exists() {
                return Some(p);
            }
        }

        // 3. ~/.config/ghostroute/config.toml
        if let Ok(home) = env::var("HOME") {
            let p = PathBuf::from(home).join(".config/ghostroute/config.toml");
            if p.exists() {
                return Some(p);
            }
        }

        None
    }

    /// Load config from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| GhostrouteError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;

        Self::load_from_str(&contents)
    }

    /// Parse config from TOML text
    pub fn load_from_str(contents: &str) -> Result<Config> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load the documented default configuration embedded in the binary
    pub fn load_builtin() -> Result<Config> {
        const BUILTIN_TOML: &str = include_str!("../default-config.toml");
        Self::load_from_str(BUILTIN_TOML)
    }

    /// Load config from an explicit path, the user config, or the built-in defaults
    /// Priority: Explicit path > User config > Built-in config
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config> {
        if let Some(p) = path {
            tracing::debug!("Loading config from {:?}", p);
            return Self::load_from_file(&p);
        }

        match Self::find_user_config() {
            Some(p) => {
                tracing::debug!("Loading user config from {:?}", p);
                Self::load_from_file(&p)
            }
            None => {
                tracing::debug!("No user config found, using built-in defaults");
                Self::load_builtin()
            }
        }
    }
}
