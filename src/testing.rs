//! Recording adapter for exercising the bridge without a radio.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use parking_lot::Mutex;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   adapter::{
      AdapterFactory, BleAdapter, CharacteristicPath, ConnectOptions, DescriptorPath,
      ScanRequest, TransactionId,
   },
   command::Responder,
   event::{BridgeEvent, EventSink, StreamKind},
   model::{
      Characteristic, ConnectionState, ConnectionStateChange, Descriptor, LogLevel,
      MonitoredValue, Peripheral, PowerState, Service,
   },
};

/// An adapter call as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
   CreateClient(Option<String>),
   DestroyClient,
   StartScan(ScanRequest),
   StopScan,
   Cancel(String),
   /// Capability operation name and the device it targeted.
   Op(&'static str, String),
}

#[derive(Default)]
struct Shared {
   calls: Vec<(usize, AdapterCall)>,
   sinks: HashMap<StreamKind, EventSink>,
}

/// Hands out [`FakeAdapter`]s numbered from 1 and records what they see.
#[derive(Clone, Default)]
pub struct FakeFactory {
   shared: Arc<Mutex<Shared>>,
   created: Arc<AtomicUsize>,
}

impl FakeFactory {
   /// Every call so far, tagged with the adapter number.
   pub fn calls(&self) -> Vec<(usize, AdapterCall)> {
      self.shared.lock().calls.clone()
   }

   /// The most recent sink handed to any adapter for `kind`.
   pub fn sink(&self, kind: StreamKind) -> EventSink {
      self
         .shared
         .lock()
         .sinks
         .get(&kind)
         .cloned()
         .unwrap_or_else(|| panic!("no {kind} sink was handed out"))
   }

   pub fn adapters_created(&self) -> usize {
      self.created.load(Ordering::SeqCst)
   }
}

impl AdapterFactory for FakeFactory {
   fn new_adapter(&self) -> Box<dyn BleAdapter> {
      let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
      Box::new(FakeAdapter {
         id,
         shared: self.shared.clone(),
         log_level: Mutex::new(LogLevel::None),
      })
   }
}

pub struct FakeAdapter {
   id: usize,
   shared: Arc<Mutex<Shared>>,
   log_level: Mutex<LogLevel>,
}

impl FakeAdapter {
   fn record(&self, call: AdapterCall) {
      self.shared.lock().calls.push((self.id, call));
   }

   fn op(&self, name: &'static str, device_id: &str) {
      self.record(AdapterCall::Op(name, device_id.to_string()));
   }

   fn keep(&self, sink: &EventSink) {
      self.shared.lock().sinks.insert(sink.kind(), sink.clone());
   }
}

fn characteristic(path: &CharacteristicPath, value: Option<Vec<u8>>) -> Characteristic {
   Characteristic {
      uuid: path.characteristic_uuid,
      service_uuid: path.service_uuid,
      device_identifier: path.device_identifier.clone(),
      is_readable: true,
      is_notifiable: true,
      value,
      ..Default::default()
   }
}

fn descriptor(path: &DescriptorPath, value: Vec<u8>) -> Descriptor {
   Descriptor {
      uuid: path.descriptor_uuid,
      characteristic_uuid: path.characteristic.characteristic_uuid,
      service_uuid: path.characteristic.service_uuid,
      device_identifier: path.characteristic.device_identifier.clone(),
      value: Some(value),
   }
}

impl BleAdapter for FakeAdapter {
   fn create_client(
      &self,
      restore_identifier: Option<&str>,
      power_states: EventSink,
      restored: EventSink,
   ) {
      self.record(AdapterCall::CreateClient(restore_identifier.map(str::to_string)));
      self.keep(&power_states);
      self.keep(&restored);
   }

   fn destroy_client(&self) {
      self.record(AdapterCall::DestroyClient);
   }

   fn start_device_scan(&self, request: ScanRequest, results: EventSink) {
      self.record(AdapterCall::StartScan(request));
      self.keep(&results);
   }

   fn stop_device_scan(&self) {
      self.record(AdapterCall::StopScan);
   }

   fn cancel_transaction(&self, transaction_id: &str) {
      self.record(AdapterCall::Cancel(transaction_id.to_string()));
   }

   fn connect_to_device(
      &self,
      device_id: &str,
      _options: ConnectOptions,
      states: EventSink,
      reply: Responder<()>,
   ) {
      self.op("connect_to_device", device_id);
      states.emit(BridgeEvent::ConnectionState(ConnectionStateChange {
         device_identifier: device_id.into(),
         state: ConnectionState::Connected,
      }));
      self.keep(&states);
      reply.success(());
   }

   fn is_device_connected(&self, device_id: &str, reply: Responder<bool>) {
      self.op("is_device_connected", device_id);
      reply.success(true);
   }

   fn observe_connection_state(&self, device_id: &str, emit_current: bool, states: EventSink) {
      self.op("observe_connection_state", device_id);
      if emit_current {
         states.emit(BridgeEvent::ConnectionState(ConnectionStateChange {
            device_identifier: device_id.into(),
            state: ConnectionState::Connected,
         }));
      }
      self.keep(&states);
   }

   fn cancel_connection(&self, device_id: &str, reply: Responder<()>) {
      self.op("cancel_connection", device_id);
      reply.success(());
   }

   fn set_log_level(&self, level: LogLevel) {
      *self.log_level.lock() = level;
   }

   fn log_level(&self, reply: Responder<LogLevel>) {
      reply.success(*self.log_level.lock());
   }

   fn discover_all_services_and_characteristics(
      &self,
      device_id: &str,
      _transaction_id: TransactionId,
      reply: Responder<()>,
   ) {
      self.op("discover_all_services_and_characteristics", device_id);
      reply.success(());
   }

   fn services_for_device(&self, device_id: &str, reply: Responder<Vec<Service>>) {
      self.op("services_for_device", device_id);
      reply.success(vec![Service {
         uuid: Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb),
         device_identifier: device_id.into(),
         is_primary: true,
      }]);
   }

   fn characteristics_for_service(
      &self,
      device_id: &str,
      service_uuid: Uuid,
      reply: Responder<Vec<Characteristic>>,
   ) {
      self.op("characteristics_for_service", device_id);
      reply.success(vec![Characteristic {
         uuid: Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb),
         service_uuid,
         device_identifier: device_id.into(),
         ..Default::default()
      }]);
   }

   fn descriptors_for_characteristic(
      &self,
      path: CharacteristicPath,
      reply: Responder<Vec<Descriptor>>,
   ) {
      self.op("descriptors_for_characteristic", &path.device_identifier);
      reply.success(Vec::new());
   }

   fn enable(&self, _transaction_id: TransactionId, reply: Responder<()>) {
      self.op("enable", "");
      reply.success(());
   }

   fn disable(&self, _transaction_id: TransactionId, reply: Responder<()>) {
      self.op("disable", "");
      reply.success(());
   }

   fn current_state(&self, reply: Responder<PowerState>) {
      reply.success(PowerState::PoweredOn);
   }

   fn read_rssi(&self, device_id: &str, _transaction_id: TransactionId, reply: Responder<i16>) {
      self.op("read_rssi", device_id);
      reply.success(-42);
   }

   fn request_mtu(
      &self,
      device_id: &str,
      mtu: u16,
      _transaction_id: TransactionId,
      reply: Responder<u16>,
   ) {
      self.op("request_mtu", device_id);
      reply.success(mtu.min(247));
   }

   fn read_characteristic(
      &self,
      path: CharacteristicPath,
      _transaction_id: TransactionId,
      reply: Responder<Characteristic>,
   ) {
      self.op("read_characteristic", &path.device_identifier);
      reply.success(characteristic(&path, Some(vec![0x2a])));
   }

   fn write_characteristic(
      &self,
      path: CharacteristicPath,
      value: Vec<u8>,
      _with_response: bool,
      _transaction_id: TransactionId,
      reply: Responder<Characteristic>,
   ) {
      self.op("write_characteristic", &path.device_identifier);
      reply.success(characteristic(&path, Some(value)));
   }

   fn monitor_characteristic(
      &self,
      path: CharacteristicPath,
      transaction_id: TransactionId,
      values: EventSink,
      reply: Responder<()>,
   ) {
      self.op("monitor_characteristic", &path.device_identifier);
      values.emit(BridgeEvent::CharacteristicValue(MonitoredValue {
         transaction_id,
         characteristic: characteristic(&path, Some(vec![0x06, 0x48])),
      }));
      self.keep(&values);
      reply.success(());
   }

   fn known_devices(&self, device_ids: Vec<SmolStr>, reply: Responder<Vec<Peripheral>>) {
      self.op("known_devices", "");
      reply.success(
         device_ids
            .into_iter()
            .map(|identifier| Peripheral {
               identifier,
               name: None,
            })
            .collect(),
      );
   }

   fn connected_devices(&self, _service_uuids: Vec<Uuid>, reply: Responder<Vec<Peripheral>>) {
      self.op("connected_devices", "");
      reply.success(Vec::new());
   }

   fn read_descriptor(
      &self,
      path: DescriptorPath,
      _transaction_id: TransactionId,
      reply: Responder<Descriptor>,
   ) {
      self.op("read_descriptor", &path.characteristic.device_identifier);
      reply.success(descriptor(&path, vec![0x01, 0x00]));
   }

   fn write_descriptor(
      &self,
      path: DescriptorPath,
      value: Vec<u8>,
      _transaction_id: TransactionId,
      reply: Responder<Descriptor>,
   ) {
      self.op("write_descriptor", &path.characteristic.device_identifier);
      reply.success(descriptor(&path, value));
   }
}
