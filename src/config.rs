//! On-disk configuration: a TOML file loaded with `serde` + `toml`, so a
//! mount can be described declaratively instead of only via CLI flags.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Deserialized shape of a `tierfuse.toml` config file. Every field has a
/// CLI-flag counterpart (see `bin/tierfused.rs`) that overrides it.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    pub mount_path: PathBuf,
    pub local_dir: PathBuf,
    #[serde(default)]
    pub external_dir: Option<PathBuf>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "could not read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "could not parse config file: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl MountConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Read)?;
        toml::from_str(&text).map_err(ConfigError::Parse)
    }

    /// Apply CLI overrides on top of a loaded (or default) config. Each
    /// `Some` overrides the field unconditionally; boolean flags only ever
    /// turn a setting on, never off, since the CLI has no "--no-debug".
    pub fn apply_overrides(
        &mut self,
        mount_path: Option<PathBuf>,
        local_dir: Option<PathBuf>,
        external_dir: Option<PathBuf>,
        readonly: bool,
        debug: bool,
        log_path: Option<PathBuf>,
    ) {
        if let Some(p) = mount_path {
            self.mount_path = p;
        }
        if let Some(p) = local_dir {
            self.local_dir = p;
        }
        if external_dir.is_some() {
            self.external_dir = external_dir;
        }
        if readonly {
            self.readonly = true;
        }
        if debug {
            self.debug = true;
        }
        if log_path.is_some() {
            self.log_path = log_path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_minimal_toml_with_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut f,
            br#"
            mount_path = "/mnt/union"
            local_dir = "/var/local"
            "#,
        )
        .unwrap();
        let cfg = MountConfig::load(f.path()).unwrap();
        assert_eq!(cfg.mount_path, PathBuf::from("/mnt/union"));
        assert!(cfg.external_dir.is_none());
        assert!(!cfg.readonly);
        assert!(!cfg.debug);
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let mut cfg = MountConfig {
            mount_path: PathBuf::from("/mnt/a"),
            local_dir: PathBuf::from("/local/a"),
            external_dir: None,
            readonly: false,
            debug: false,
            log_path: None,
        };
        cfg.apply_overrides(
            None,
            None,
            Some(PathBuf::from("/external/b")),
            true,
            false,
            None,
        );
        assert_eq!(cfg.mount_path, PathBuf::from("/mnt/a"));
        assert_eq!(cfg.external_dir, Some(PathBuf::from("/external/b")));
        assert!(cfg.readonly);
    }

    #[test]
    fn missing_file_produces_read_error() {
        let result = MountConfig::load(Path::new("/nonexistent-abcxyz/tierfuse.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }
}
