//! Configuration management for the bridge.
//!
//! The configuration is a small TOML file holding logging defaults, channel
//! sizes and the timeouts used by the BlueZ adapter.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Main configuration structure for the bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Default `env_logger` filter, overridden by `RUST_LOG`.
   #[serde(default = "default_log_filter")]
   pub log_filter: String,

   /// Capacity of the inbound command queue.
   #[serde(default = "default_command_buffer")]
   pub command_buffer: usize,

   /// Capacity of the adapter callback queue.
   #[serde(default = "default_event_buffer")]
   pub event_buffer: usize,

   #[serde(default = "default_connect_timeout_ms")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_services_timeout_ms")]
   pub services_timeout_ms: u64,

   /// Restore identifier used when `create-client` does not name one.
   #[serde(default)]
   pub default_restore_identifier: Option<String>,
}

fn default_log_filter() -> String {
   "info".to_string()
}

const fn default_command_buffer() -> usize {
   64
}

const fn default_event_buffer() -> usize {
   1000
}

const fn default_connect_timeout_ms() -> u64 {
   30_000
}

const fn default_services_timeout_ms() -> u64 {
   15_000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         log_filter: default_log_filter(),
         command_buffer: default_command_buffer(),
         event_buffer: default_event_buffer(),
         connect_timeout_ms: default_connect_timeout_ms(),
         services_timeout_ms: default_services_timeout_ms(),
         default_restore_identifier: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if the
   /// file does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLEBRIDGE_HOME") {
         PathBuf::from(home)
      } else {
         dirs::config_dir().ok_or(BridgeError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("blebridge").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn services_timeout(&self) -> Duration {
      Duration::from_millis(self.services_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());

      // Second load reads back what the first one wrote
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_partial_file_fills_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "log_filter = \"debug\"\ndefault_restore_identifier = \"restore-1\"\n",
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.log_filter, "debug");
      assert_eq!(config.default_restore_identifier.as_deref(), Some("restore-1"));
      assert_eq!(config.command_buffer, default_command_buffer());
      assert_eq!(config.connect_timeout(), Duration::from_secs(30));
   }

   #[test]
   fn test_malformed_file_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "command_buffer = \"lots\"").unwrap();

      assert!(matches!(
         Config::load_from(&path),
         Err(BridgeError::TomlParse(_))
      ));
   }
}
