//! Bridge between a host application and a native BLE central adapter.
//!
//! A host sends named commands through a [`Bridge`] and subscribes to its
//! event streams. The bridge owns one adapter session at a time, routes each
//! command to a built-in handler or a capability delegate, and delivers
//! adapter callbacks to the matching stream.

pub mod adapter;
pub mod bluetooth;
pub mod bridge;
pub mod command;
pub mod config;
pub mod delegate;
pub mod error;
pub mod event;
pub mod host;
pub mod model;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
