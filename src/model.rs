//! Data types exchanged between the host, the bridge and the adapter.
//!
//! Everything here serializes to the JSON shapes the host sees in replies
//! and stream events. Byte payloads are rendered as lowercase hex.

use std::collections::HashMap;

use serde::{Serialize, Serializer};
use smol_str::SmolStr;
use uuid::Uuid;

/// Base UUID used to widen 16 and 32 bit Bluetooth SIG identifiers.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Parses a service, characteristic or descriptor UUID.
///
/// Accepts the short SIG forms (`"180D"`, `"0000180d"`) as well as the full
/// hyphenated form.
pub fn parse_uuid(text: &str) -> Result<Uuid, BleError> {
   let text = text.trim();
   let short = match text.len() {
      4 | 8 => u32::from_str_radix(text, 16).ok(),
      _ => None,
   };
   if let Some(short) = short {
      return Ok(Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96)));
   }
   Uuid::parse_str(text).map_err(|e| {
      BleError::new(BleErrorCode::InvalidIdentifiers)
         .reason(format!("Invalid UUID {text:?}"))
         .internal(e.to_string())
   })
}

/// Error codes reported to the host.
#[repr(u16)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::FromRepr, strum::Display,
)]
#[serde(into = "u16")]
pub enum BleErrorCode {
   UnknownError = 0,
   BluetoothManagerDestroyed = 1,
   OperationCancelled = 2,
   OperationTimedOut = 3,
   OperationStartFailed = 4,
   InvalidIdentifiers = 5,
   InvalidArguments = 6,

   BluetoothUnsupported = 100,
   BluetoothUnauthorized = 101,
   BluetoothPoweredOff = 102,
   BluetoothInUnknownState = 103,
   BluetoothResetting = 104,
   BluetoothStateChangeFailed = 105,

   DeviceConnectionFailed = 200,
   DeviceDisconnected = 201,
   DeviceRssiReadFailed = 202,
   DeviceAlreadyConnected = 203,
   DeviceNotFound = 204,
   DeviceNotConnected = 205,
   DeviceMtuChangeFailed = 206,

   ServicesDiscoveryFailed = 300,
   ServiceNotFound = 302,
   ServicesNotDiscovered = 303,

   CharacteristicsDiscoveryFailed = 400,
   CharacteristicWriteFailed = 401,
   CharacteristicReadFailed = 402,
   CharacteristicNotifyChangeFailed = 403,
   CharacteristicNotFound = 404,

   DescriptorsDiscoveryFailed = 500,
   DescriptorWriteFailed = 501,
   DescriptorReadFailed = 502,
   DescriptorNotFound = 503,

   ScanStartFailed = 600,
}

impl From<BleErrorCode> for u16 {
   fn from(code: BleErrorCode) -> Self {
      code as Self
   }
}

/// Error reported to the host, either as a command reply or on a stream.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[error("{code}: {}", .reason.as_deref().unwrap_or("no reason given"))]
#[serde(rename_all = "camelCase")]
pub struct BleError {
   #[serde(rename = "errorCode")]
   pub code: BleErrorCode,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub reason: Option<String>,
   #[serde(rename = "deviceID", skip_serializing_if = "Option::is_none")]
   pub device_id: Option<SmolStr>,
   #[serde(rename = "serviceUUID", skip_serializing_if = "Option::is_none")]
   pub service_uuid: Option<Uuid>,
   #[serde(rename = "characteristicUUID", skip_serializing_if = "Option::is_none")]
   pub characteristic_uuid: Option<Uuid>,
   #[serde(rename = "descriptorUUID", skip_serializing_if = "Option::is_none")]
   pub descriptor_uuid: Option<Uuid>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub internal_message: Option<String>,
}

impl BleError {
   pub const fn new(code: BleErrorCode) -> Self {
      Self {
         code,
         reason: None,
         device_id: None,
         service_uuid: None,
         characteristic_uuid: None,
         descriptor_uuid: None,
         internal_message: None,
      }
   }

   #[must_use]
   pub fn reason(mut self, reason: impl Into<String>) -> Self {
      self.reason = Some(reason.into());
      self
   }

   #[must_use]
   pub fn device(mut self, device_id: impl Into<SmolStr>) -> Self {
      self.device_id = Some(device_id.into());
      self
   }

   #[must_use]
   pub const fn service(mut self, uuid: Uuid) -> Self {
      self.service_uuid = Some(uuid);
      self
   }

   #[must_use]
   pub const fn characteristic(mut self, uuid: Uuid) -> Self {
      self.characteristic_uuid = Some(uuid);
      self
   }

   #[must_use]
   pub const fn descriptor(mut self, uuid: Uuid) -> Self {
      self.descriptor_uuid = Some(uuid);
      self
   }

   #[must_use]
   pub fn internal(mut self, message: impl Into<String>) -> Self {
      self.internal_message = Some(message.into());
      self
   }
}

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum PowerState {
   Unknown,
   Resetting,
   Unsupported,
   Unauthorized,
   PoweredOff,
   PoweredOn,
}

impl From<bool> for PowerState {
   fn from(powered: bool) -> Self {
      if powered { Self::PoweredOn } else { Self::PoweredOff }
   }
}

/// Verbosity of native-side logging, as selected by the host.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   strum::Display,
   strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum LogLevel {
   #[default]
   None,
   Verbose,
   Debug,
   Info,
   Warning,
   Error,
}

impl LogLevel {
   pub const fn to_level_filter(self) -> log::LevelFilter {
      match self {
         Self::None => log::LevelFilter::Off,
         Self::Verbose => log::LevelFilter::Trace,
         Self::Debug => log::LevelFilter::Debug,
         Self::Info => log::LevelFilter::Info,
         Self::Warning => log::LevelFilter::Warn,
         Self::Error => log::LevelFilter::Error,
      }
   }
}

impl From<log::LevelFilter> for LogLevel {
   fn from(filter: log::LevelFilter) -> Self {
      match filter {
         log::LevelFilter::Off => Self::None,
         log::LevelFilter::Error => Self::Error,
         log::LevelFilter::Warn => Self::Warning,
         log::LevelFilter::Info => Self::Info,
         log::LevelFilter::Debug => Self::Debug,
         log::LevelFilter::Trace => Self::Verbose,
      }
   }
}

/// Connection state of a single peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   Connecting,
   Connected,
   Disconnecting,
   Disconnected,
}

impl From<bool> for ConnectionState {
   fn from(connected: bool) -> Self {
      if connected { Self::Connected } else { Self::Disconnected }
   }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateChange {
   pub device_identifier: SmolStr,
   pub state: ConnectionState,
}

/// A peripheral known to the adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peripheral {
   pub identifier: SmolStr,
   pub name: Option<String>,
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
   pub device_identifier: SmolStr,
   pub name: Option<String>,
   pub rssi: Option<i16>,
   pub tx_power_level: Option<i16>,
   #[serde(serialize_with = "serialize_hex_opt")]
   pub manufacturer_data: Option<Vec<u8>>,
   #[serde(serialize_with = "serialize_hex_map")]
   pub service_data: HashMap<Uuid, Vec<u8>>,
   pub service_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
   pub uuid: Uuid,
   pub device_identifier: SmolStr,
   pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Characteristic {
   pub uuid: Uuid,
   pub service_uuid: Uuid,
   pub device_identifier: SmolStr,
   pub is_readable: bool,
   pub is_writable_with_response: bool,
   pub is_writable_without_response: bool,
   pub is_notifiable: bool,
   pub is_indicatable: bool,
   #[serde(serialize_with = "serialize_hex_opt")]
   pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
   pub uuid: Uuid,
   pub characteristic_uuid: Uuid,
   pub service_uuid: Uuid,
   pub device_identifier: SmolStr,
   #[serde(serialize_with = "serialize_hex_opt")]
   pub value: Option<Vec<u8>>,
}

/// A value pushed by a monitored characteristic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredValue {
   pub transaction_id: Option<SmolStr>,
   pub characteristic: Characteristic,
}

fn serialize_hex_opt<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
   match bytes {
      Some(bytes) => s.serialize_some(&hex::encode(bytes)),
      None => s.serialize_none(),
   }
}

fn serialize_hex_map<S: Serializer>(map: &HashMap<Uuid, Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
   s.collect_map(map.iter().map(|(uuid, bytes)| (uuid, hex::encode(bytes))))
}
