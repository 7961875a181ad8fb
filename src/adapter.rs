//! The adapter collaborator consumed by the bridge.
//!
//! A [`BleAdapter`] performs the actual radio work. Every method returns
//! immediately: single results come back through a [`Responder`], repeated
//! ones through an [`EventSink`]. Both may be completed from whatever thread
//! the adapter runs its I/O on.

use std::collections::BTreeSet;

use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   command::Responder,
   event::EventSink,
   model::{Characteristic, Descriptor, LogLevel, Peripheral, PowerState, Service},
};

/// Android scan callback type asking for every advertisement, not just the
/// first match per device.
pub const CALLBACK_TYPE_ALL_MATCHES: i32 = 1;

/// Smallest ATT MTU allowed by the Bluetooth core specification. A link
/// starts out at this value until an exchange raises it.
pub const MIN_ATT_MTU: u16 = 23;

/// Optional transaction identifier attached to a cancellable operation.
pub type TransactionId = Option<SmolStr>;

/// Parameters of a device scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanRequest {
   pub service_uuids: BTreeSet<Uuid>,
   pub scan_mode: i32,
   pub callback_type: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
   /// Overrides the adapter's default connection timeout.
   pub timeout_ms: Option<u64>,
}

/// Fully qualified location of a characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicPath {
   pub device_identifier: SmolStr,
   pub service_uuid: Uuid,
   pub characteristic_uuid: Uuid,
}

/// Fully qualified location of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorPath {
   pub characteristic: CharacteristicPath,
   pub descriptor_uuid: Uuid,
}

/// BLE central capability behind one session.
///
/// The bridge owns exactly one instance per session and never shares it;
/// capability handlers only borrow it for the duration of a call.
pub trait BleAdapter: Send {
   // === Session ===

   /// Brings the client up. Power changes feed `power_states`; a restore
   /// payload, if any, is emitted once on `restored`.
   fn create_client(
      &self,
      restore_identifier: Option<&str>,
      power_states: EventSink,
      restored: EventSink,
   );

   /// Releases the client, cancelling everything still in flight.
   fn destroy_client(&self);

   // === Scanning ===

   /// Starts scanning, replacing any scan already running.
   fn start_device_scan(&self, request: ScanRequest, results: EventSink);

   fn stop_device_scan(&self);

   /// Best-effort cancellation; unknown ids are ignored.
   fn cancel_transaction(&self, transaction_id: &str);

   // === Connection ===

   fn connect_to_device(
      &self,
      device_id: &str,
      options: ConnectOptions,
      states: EventSink,
      reply: Responder<()>,
   );

   fn is_device_connected(&self, device_id: &str, reply: Responder<bool>);

   /// Follows connection changes of one device, emitting its current state
   /// first when `emit_current` is set.
   fn observe_connection_state(&self, device_id: &str, emit_current: bool, states: EventSink);

   fn cancel_connection(&self, device_id: &str, reply: Responder<()>);

   // === Logging ===

   fn set_log_level(&self, level: LogLevel);

   fn log_level(&self, reply: Responder<LogLevel>);

   // === Discovery ===

   fn discover_all_services_and_characteristics(
      &self,
      device_id: &str,
      transaction_id: TransactionId,
      reply: Responder<()>,
   );

   fn services_for_device(&self, device_id: &str, reply: Responder<Vec<Service>>);

   fn characteristics_for_service(
      &self,
      device_id: &str,
      service_uuid: Uuid,
      reply: Responder<Vec<Characteristic>>,
   );

   fn descriptors_for_characteristic(
      &self,
      path: CharacteristicPath,
      reply: Responder<Vec<Descriptor>>,
   );

   // === Adapter power ===

   fn enable(&self, transaction_id: TransactionId, reply: Responder<()>);

   fn disable(&self, transaction_id: TransactionId, reply: Responder<()>);

   fn current_state(&self, reply: Responder<PowerState>);

   // === RSSI / MTU ===

   fn read_rssi(&self, device_id: &str, transaction_id: TransactionId, reply: Responder<i16>);

   fn request_mtu(
      &self,
      device_id: &str,
      mtu: u16,
      transaction_id: TransactionId,
      reply: Responder<u16>,
   );

   // === Characteristics ===

   fn read_characteristic(
      &self,
      path: CharacteristicPath,
      transaction_id: TransactionId,
      reply: Responder<Characteristic>,
   );

   fn write_characteristic(
      &self,
      path: CharacteristicPath,
      value: Vec<u8>,
      with_response: bool,
      transaction_id: TransactionId,
      reply: Responder<Characteristic>,
   );

   /// Enables notifications and forwards each value to `values` until the
   /// transaction is cancelled or the device goes away. `reply` resolves once
   /// notifications are enabled.
   fn monitor_characteristic(
      &self,
      path: CharacteristicPath,
      transaction_id: TransactionId,
      values: EventSink,
      reply: Responder<()>,
   );

   // === Devices ===

   fn known_devices(&self, device_ids: Vec<SmolStr>, reply: Responder<Vec<Peripheral>>);

   fn connected_devices(&self, service_uuids: Vec<Uuid>, reply: Responder<Vec<Peripheral>>);

   // === Descriptors ===

   fn read_descriptor(
      &self,
      path: DescriptorPath,
      transaction_id: TransactionId,
      reply: Responder<Descriptor>,
   );

   fn write_descriptor(
      &self,
      path: DescriptorPath,
      value: Vec<u8>,
      transaction_id: TransactionId,
      reply: Responder<Descriptor>,
   );
}

/// Produces a fresh adapter for every session.
pub trait AdapterFactory: Send {
   fn new_adapter(&self) -> Box<dyn BleAdapter>;
}
