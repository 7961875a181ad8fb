//! BlueZ backend for the bridge.
//!
//! Provides [`BluezFactory`], which hands the bridge one BlueZ-backed
//! [`crate::adapter::BleAdapter`] per client session.

mod bluez;
mod gatt;
mod transactions;

pub use bluez::{BluezAdapter, BluezFactory};
