//! Configuration for the bridge and the `vtbridge` host.
//!
//! Loaded from `~/.vtbridge/config.toml`. Every field is optional; a missing
//! or unreadable file gives the defaults.
//!
//! ```toml
//! # Program to run, split like a shell would
//! command = "vim -u NONE"
//!
//! term = "linux"
//! locale = "en_GB.UTF-8"
//!
//! # Copy the parent environment before applying [env]
//! inherit_env = false
//!
//! # Bound the frame queue; the pump waits for the consumer when full
//! outbound_capacity = 64
//!
//! log_level = "debug"
//!
//! [env]
//! EDITOR = "vim"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::pump::DEFAULT_READ_BUFFER;
use crate::core::session::SpawnCommand;
use crate::error::SpawnError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Command line of the child program
    pub command: String,
    /// Extra arguments appended after those in `command`
    pub args: Vec<String>,
    /// Value of `TERM` for the child
    pub term: String,
    /// Value of `LC_ALL` for the child
    pub locale: String,
    /// Additional environment variables
    pub env: BTreeMap<String, String>,
    pub inherit_env: bool,
    /// Maximum bytes per PTY read
    pub read_buffer_size: usize,
    /// Unbounded when absent
    pub outbound_capacity: Option<usize>,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "vim".to_string(),
            args: Vec::new(),
            term: "linux".to_string(),
            locale: "en_GB.UTF-8".to_string(),
            env: BTreeMap::new(),
            inherit_env: false,
            read_buffer_size: DEFAULT_READ_BUFFER,
            outbound_capacity: None,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load from the default location
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Self::default(),
        }
    }

    /// Load from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// `~/.vtbridge`, created if missing
    pub fn config_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".vtbridge");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn log_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("vtbridge.log"))
    }

    /// Build the child command. `COLUMNS` and `LINES` are added by the pump
    /// once the size is known.
    pub fn spawn_command(&self) -> Result<SpawnCommand, SpawnError> {
        let mut command = SpawnCommand::parse(&self.command)?
            .args(self.args.iter().cloned())
            .inherit_env(self.inherit_env)
            .with_env("TERM", self.term.as_str())
            .with_env("LC_ALL", self.locale.as_str());
        for (key, value) in &self.env {
            command = command.with_env(key.as_str(), value.as_str());
        }
        Ok(command)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::TermSize;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        let command = config.spawn_command().unwrap().with_size(TermSize::new(24, 80));
        assert_eq!(command.program, "vim");
        assert!(command.args.is_empty());
        assert!(!command.inherit_env);
        assert_eq!(
            command.environment(),
            vec![
                ("TERM".to_string(), "linux".to_string()),
                ("LC_ALL".to_string(), "en_GB.UTF-8".to_string()),
                ("COLUMNS".to_string(), "80".to_string()),
                ("LINES".to_string(), "24".to_string()),
            ]
        );
    }

    #[test]
    fn test_partial_toml() {
        let config: BridgeConfig = toml::from_str(
            r#"
            command = "nano -w"
            args = ["notes.txt"]
            outbound_capacity = 8

            [env]
            TERM = "xterm"
            FOO = "bar"
            "#,
        )
        .unwrap();
        assert_eq!(config.locale, "en_GB.UTF-8");
        assert_eq!(config.outbound_capacity, Some(8));

        let command = config.spawn_command().unwrap();
        assert_eq!(command.program, "nano");
        assert_eq!(command.args, vec!["-w", "notes.txt"]);
        let env = command.environment();
        assert!(env.contains(&("TERM".to_string(), "xterm".to_string())));
        assert!(env.contains(&("FOO".to_string(), "bar".to_string())));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("vtbridge-config-{}.toml", std::process::id()));
        fs::write(&path, "command = [not toml").unwrap();
        assert_eq!(BridgeConfig::load_from(&path), BridgeConfig::default());
        let _ = fs::remove_file(&path);

        assert_eq!(BridgeConfig::load_from(Path::new("/nonexistent/vtbridge.toml")), BridgeConfig::default());
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let config = BridgeConfig {
            command: "   ".to_string(),
            ..BridgeConfig::default()
        };
        assert!(matches!(config.spawn_command(), Err(SpawnError::InvalidCommand(_))));
    }
}
