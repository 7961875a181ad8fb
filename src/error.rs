//! Error types for the BLE bridge.
//!
//! `BridgeError` covers failures of the bridge process itself (configuration,
//! I/O, a stopped dispatch task). Failures reported back to the host for a
//! single command travel as [`crate::model::BleError`] instead.

use thiserror::Error;

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Bridge has been shut down")]
   BridgeShutdown,

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
