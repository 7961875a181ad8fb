//! BlueZ backed implementation of the adapter collaborator.
//!
//! Every [`BluezAdapter`] is a thin handle onto a [`BluezActor`] task. The
//! actor owns the BlueZ session and the long-lived feeds (scan, power and
//! connection watchers); single-shot operations run as their own tasks and
//! report through their responder, cancellable through [`Transactions`].

use std::{collections::HashMap, future::Future, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, Session,
   gatt::{WriteOp, remote::CharacteristicWriteRequest},
};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use super::{
   gatt,
   transactions::{Tag, Transactions},
};
use crate::{
   adapter::{
      AdapterFactory, BleAdapter, CALLBACK_TYPE_ALL_MATCHES, CharacteristicPath,
      ConnectOptions, DescriptorPath, ScanRequest, TransactionId,
   },
   command::Responder,
   config::Config,
   event::{BridgeEvent, EventSink},
   model::{
      BleError, BleErrorCode, Characteristic, ConnectionState, ConnectionStateChange,
      Descriptor, LogLevel, MonitoredValue, Peripheral, PowerState, Service,
   },
};

/// Poll interval while waiting for BlueZ to resolve services
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Timeouts {
   connect: Duration,
   services: Duration,
}

/// Creates one BlueZ actor per bridge session.
#[derive(Debug, Clone, Copy)]
pub struct BluezFactory {
   timeouts: Timeouts,
}

impl BluezFactory {
   pub fn new(config: &Config) -> Self {
      Self {
         timeouts: Timeouts {
            connect: config.connect_timeout(),
            services: config.services_timeout(),
         },
      }
   }
}

impl AdapterFactory for BluezFactory {
   fn new_adapter(&self) -> Box<dyn BleAdapter> {
      let (command_tx, command_rx) = mpsc::unbounded_channel();
      tokio::spawn(BluezActor::new(self.timeouts, command_rx).run());
      Box::new(BluezAdapter { inbox: command_tx })
   }
}

// === Commands ===

#[derive(Debug)]
enum AdapterCommand {
   // Session
   Create(Option<SmolStr>, EventSink, EventSink),
   Destroy,

   // Scanning
   StartScan(ScanRequest, EventSink),
   StopScan,
   Cancel(SmolStr),

   // Connection
   Connect(SmolStr, ConnectOptions, EventSink, Responder<()>),
   IsConnected(SmolStr, Responder<bool>),
   Observe(SmolStr, bool, EventSink),
   CancelConnection(SmolStr, Responder<()>),

   // Logging
   SetLogLevel(LogLevel),
   GetLogLevel(Responder<LogLevel>),

   // Discovery
   Discover(SmolStr, TransactionId, Responder<()>),
   Services(SmolStr, Responder<Vec<Service>>),
   Characteristics(SmolStr, Uuid, Responder<Vec<Characteristic>>),
   Descriptors(CharacteristicPath, Responder<Vec<Descriptor>>),

   // Power
   SetPowered(bool, TransactionId, Responder<()>),
   PowerState(Responder<PowerState>),

   // Link
   ReadRssi(SmolStr, TransactionId, Responder<i16>),
   RequestMtu(SmolStr, u16, TransactionId, Responder<u16>),

   // GATT
   ReadCharacteristic(CharacteristicPath, TransactionId, Responder<Characteristic>),
   WriteCharacteristic(
      CharacteristicPath,
      Vec<u8>,
      bool,
      TransactionId,
      Responder<Characteristic>,
   ),
   Monitor(CharacteristicPath, TransactionId, EventSink, Responder<()>),
   ReadDescriptor(DescriptorPath, TransactionId, Responder<Descriptor>),
   WriteDescriptor(DescriptorPath, Vec<u8>, TransactionId, Responder<Descriptor>),

   // Devices
   KnownDevices(Vec<SmolStr>, Responder<Vec<Peripheral>>),
   ConnectedDevices(Vec<Uuid>, Responder<Vec<Peripheral>>),
}

// === Handle ===

/// Handle to a BlueZ actor. Dropping it stops the actor.
pub struct BluezAdapter {
   inbox: mpsc::UnboundedSender<AdapterCommand>,
}

impl BluezAdapter {
   fn send(&self, cmd: AdapterCommand) {
      if let Err(e) = self.inbox.send(cmd) {
         warn!("BlueZ actor is gone, dropping {:?}", e.0);
      }
   }
}

impl BleAdapter for BluezAdapter {
   fn create_client(
      &self,
      restore_identifier: Option<&str>,
      power_states: EventSink,
      restored: EventSink,
   ) {
      self.send(AdapterCommand::Create(
         restore_identifier.map(SmolStr::new),
         power_states,
         restored,
      ));
   }

   fn destroy_client(&self) {
      self.send(AdapterCommand::Destroy);
   }

   fn start_device_scan(&self, request: ScanRequest, results: EventSink) {
      self.send(AdapterCommand::StartScan(request, results));
   }

   fn stop_device_scan(&self) {
      self.send(AdapterCommand::StopScan);
   }

   fn cancel_transaction(&self, transaction_id: &str) {
      self.send(AdapterCommand::Cancel(transaction_id.into()));
   }

   fn connect_to_device(
      &self,
      device_id: &str,
      options: ConnectOptions,
      states: EventSink,
      reply: Responder<()>,
   ) {
      self.send(AdapterCommand::Connect(device_id.into(), options, states, reply));
   }

   fn is_device_connected(&self, device_id: &str, reply: Responder<bool>) {
      self.send(AdapterCommand::IsConnected(device_id.into(), reply));
   }

   fn observe_connection_state(&self, device_id: &str, emit_current: bool, states: EventSink) {
      self.send(AdapterCommand::Observe(device_id.into(), emit_current, states));
   }

   fn cancel_connection(&self, device_id: &str, reply: Responder<()>) {
      self.send(AdapterCommand::CancelConnection(device_id.into(), reply));
   }

   fn set_log_level(&self, level: LogLevel) {
      self.send(AdapterCommand::SetLogLevel(level));
   }

   fn log_level(&self, reply: Responder<LogLevel>) {
      self.send(AdapterCommand::GetLogLevel(reply));
   }

   fn discover_all_services_and_characteristics(
      &self,
      device_id: &str,
      transaction_id: TransactionId,
      reply: Responder<()>,
   ) {
      self.send(AdapterCommand::Discover(device_id.into(), transaction_id, reply));
   }

   fn services_for_device(&self, device_id: &str, reply: Responder<Vec<Service>>) {
      self.send(AdapterCommand::Services(device_id.into(), reply));
   }

   fn characteristics_for_service(
      &self,
      device_id: &str,
      service_uuid: Uuid,
      reply: Responder<Vec<Characteristic>>,
   ) {
      self.send(AdapterCommand::Characteristics(device_id.into(), service_uuid, reply));
   }

   fn descriptors_for_characteristic(
      &self,
      path: CharacteristicPath,
      reply: Responder<Vec<Descriptor>>,
   ) {
      self.send(AdapterCommand::Descriptors(path, reply));
   }

   fn enable(&self, transaction_id: TransactionId, reply: Responder<()>) {
      self.send(AdapterCommand::SetPowered(true, transaction_id, reply));
   }

   fn disable(&self, transaction_id: TransactionId, reply: Responder<()>) {
      self.send(AdapterCommand::SetPowered(false, transaction_id, reply));
   }

   fn current_state(&self, reply: Responder<PowerState>) {
      self.send(AdapterCommand::PowerState(reply));
   }

   fn read_rssi(&self, device_id: &str, transaction_id: TransactionId, reply: Responder<i16>) {
      self.send(AdapterCommand::ReadRssi(device_id.into(), transaction_id, reply));
   }

   fn request_mtu(
      &self,
      device_id: &str,
      mtu: u16,
      transaction_id: TransactionId,
      reply: Responder<u16>,
   ) {
      self.send(AdapterCommand::RequestMtu(device_id.into(), mtu, transaction_id, reply));
   }

   fn read_characteristic(
      &self,
      path: CharacteristicPath,
      transaction_id: TransactionId,
      reply: Responder<Characteristic>,
   ) {
      self.send(AdapterCommand::ReadCharacteristic(path, transaction_id, reply));
   }

   fn write_characteristic(
      &self,
      path: CharacteristicPath,
      value: Vec<u8>,
      with_response: bool,
      transaction_id: TransactionId,
      reply: Responder<Characteristic>,
   ) {
      self.send(AdapterCommand::WriteCharacteristic(
         path,
         value,
         with_response,
         transaction_id,
         reply,
      ));
   }

   fn monitor_characteristic(
      &self,
      path: CharacteristicPath,
      transaction_id: TransactionId,
      values: EventSink,
      reply: Responder<()>,
   ) {
      self.send(AdapterCommand::Monitor(path, transaction_id, values, reply));
   }

   fn known_devices(&self, device_ids: Vec<SmolStr>, reply: Responder<Vec<Peripheral>>) {
      self.send(AdapterCommand::KnownDevices(device_ids, reply));
   }

   fn connected_devices(&self, service_uuids: Vec<Uuid>, reply: Responder<Vec<Peripheral>>) {
      self.send(AdapterCommand::ConnectedDevices(service_uuids, reply));
   }

   fn read_descriptor(
      &self,
      path: DescriptorPath,
      transaction_id: TransactionId,
      reply: Responder<Descriptor>,
   ) {
      self.send(AdapterCommand::ReadDescriptor(path, transaction_id, reply));
   }

   fn write_descriptor(
      &self,
      path: DescriptorPath,
      value: Vec<u8>,
      transaction_id: TransactionId,
      reply: Responder<Descriptor>,
   ) {
      self.send(AdapterCommand::WriteDescriptor(path, value, transaction_id, reply));
   }
}

// === Actor ===

fn cancelled_error() -> BleError {
   BleError::new(BleErrorCode::OperationCancelled).reason("Operation was cancelled")
}

fn no_adapter() -> BleError {
   BleError::new(BleErrorCode::BluetoothUnsupported).reason("No Bluetooth adapter available")
}

struct BluezActor {
   timeouts: Timeouts,
   command_rx: mpsc::UnboundedReceiver<AdapterCommand>,

   // State
   session: Option<Session>,
   adapter: Option<Adapter>,
   transactions: Transactions,
   scan: Option<JoinHandle<()>>,
   power_monitor: Option<JoinHandle<()>>,
   watchers: HashMap<Address, JoinHandle<()>>,
}

impl BluezActor {
   fn new(timeouts: Timeouts, command_rx: mpsc::UnboundedReceiver<AdapterCommand>) -> Self {
      Self {
         timeouts,
         command_rx,
         session: None,
         adapter: None,
         transactions: Transactions::default(),
         scan: None,
         power_monitor: None,
         watchers: HashMap::new(),
      }
   }

   async fn run(mut self) {
      debug!("BlueZ actor starting up");
      while let Some(cmd) = self.command_rx.recv().await {
         self.handle_command(cmd).await;
      }
      self.shutdown();
      debug!("BlueZ actor shutting down");
   }

   async fn handle_command(&mut self, cmd: AdapterCommand) {
      match cmd {
         AdapterCommand::Create(restore_identifier, power_states, restored) => {
            self.create(restore_identifier, power_states, restored).await;
         },
         AdapterCommand::Destroy => self.shutdown(),
         AdapterCommand::StartScan(request, results) => self.start_scan(request, results),
         AdapterCommand::StopScan => self.stop_scan(),
         AdapterCommand::Cancel(id) => {
            let count = self.transactions.cancel(&Tag::Transaction(id.clone()));
            debug!("Cancelled {count} operation(s) for transaction {id}");
         },
         AdapterCommand::Connect(device_id, options, states, reply) => {
            self.connect(device_id, options, states, reply);
         },
         AdapterCommand::IsConnected(device_id, reply) => {
            self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
               let device = gatt::device(&adapter, &device_id)?;
               device
                  .is_connected()
                  .await
                  .map_err(|e| gatt::ble_error(BleErrorCode::DeviceNotFound, &e).device(device_id))
            });
         },
         AdapterCommand::Observe(device_id, emit_current, states) => {
            self.observe(&device_id, emit_current, states);
         },
         AdapterCommand::CancelConnection(device_id, reply) => {
            self.cancel_connection(device_id, reply);
         },
         AdapterCommand::SetLogLevel(level) => {
            info!("Log level set to {level}");
            log::set_max_level(level.to_level_filter());
         },
         AdapterCommand::GetLogLevel(reply) => reply.success(LogLevel::from(log::max_level())),
         AdapterCommand::Discover(device_id, transaction_id, reply) => {
            let timeout = self.timeouts.services;
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               discover(&adapter, &device_id, timeout).await
            });
         },
         AdapterCommand::Services(device_id, reply) => {
            self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
               services(&adapter, &device_id).await
            });
         },
         AdapterCommand::Characteristics(device_id, service_uuid, reply) => {
            self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
               characteristics(&adapter, &device_id, service_uuid).await
            });
         },
         AdapterCommand::Descriptors(path, reply) => {
            self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
               descriptors(&adapter, &path).await
            });
         },
         AdapterCommand::SetPowered(powered, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               adapter
                  .set_powered(powered)
                  .await
                  .map_err(|e| gatt::ble_error(BleErrorCode::BluetoothStateChangeFailed, &e))
            });
         },
         AdapterCommand::PowerState(reply) => {
            let Some(adapter) = self.adapter.clone() else {
               reply.success(PowerState::Unsupported);
               return;
            };
            tokio::spawn(async move {
               let state = match adapter.is_powered().await {
                  Ok(powered) => PowerState::from(powered),
                  Err(e) => {
                     debug!("Failed to read power state: {e}");
                     PowerState::Unknown
                  },
               };
               reply.success(state);
            });
         },
         AdapterCommand::ReadRssi(device_id, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               read_rssi(&adapter, &device_id).await
            });
         },
         AdapterCommand::RequestMtu(device_id, mtu, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               let device = gatt::connected_device(&adapter, &device_id).await?;
               let current = gatt::current_mtu(&device).await.map_err(|e| {
                  gatt::ble_error(BleErrorCode::DeviceMtuChangeFailed, &e).device(device_id)
               })?;
               debug!("Requested MTU {mtu}, BlueZ negotiated {current}");
               Ok(current)
            });
         },
         AdapterCommand::ReadCharacteristic(path, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               read_characteristic(&adapter, &path).await
            });
         },
         AdapterCommand::WriteCharacteristic(path, value, with_response, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               write_characteristic(&adapter, &path, value, with_response).await
            });
         },
         AdapterCommand::Monitor(path, transaction_id, values, reply) => {
            self.monitor(path, transaction_id, values, reply);
         },
         AdapterCommand::ReadDescriptor(path, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               let descriptor = gatt::find_descriptor(&adapter, &path).await?;
               let value = descriptor.read().await.map_err(|e| {
                  gatt::descriptor_error(BleErrorCode::DescriptorReadFailed, &path, &e)
               })?;
               Ok(gatt::descriptor_model(&path, Some(value)))
            });
         },
         AdapterCommand::WriteDescriptor(path, value, transaction_id, reply) => {
            self.with_adapter(transaction_id.into(), reply, move |adapter| async move {
               let descriptor = gatt::find_descriptor(&adapter, &path).await?;
               descriptor.write(&value).await.map_err(|e| {
                  gatt::descriptor_error(BleErrorCode::DescriptorWriteFailed, &path, &e)
               })?;
               Ok(gatt::descriptor_model(&path, Some(value)))
            });
         },
         AdapterCommand::KnownDevices(device_ids, reply) => {
            self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
               known_devices(&adapter, &device_ids).await
            });
         },
         AdapterCommand::ConnectedDevices(service_uuids, reply) => {
            self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
               connected_devices(&adapter, &service_uuids).await
            });
         },
      }
   }

   /// Runs `op` against the adapter on its own task. The responder receives
   /// `OperationCancelled` if `tag` is cancelled first.
   fn with_adapter<T, F, Fut>(&self, tag: Tag, reply: Responder<T>, op: F)
   where
      T: Serialize + Send + 'static,
      F: FnOnce(Adapter) -> Fut,
      Fut: Future<Output = Result<T, BleError>> + Send + 'static,
   {
      let Some(adapter) = self.adapter.clone() else {
         reply.error(no_adapter());
         return;
      };
      let ticket = self.transactions.begin(tag);
      let transactions = self.transactions.clone();
      let op = op(adapter);
      tokio::spawn(async move {
         let result = select! {
            result = op => result,
            _ = ticket.cancelled => Err(cancelled_error()),
         };
         transactions.end(ticket.id);
         reply.respond(result);
      });
   }

   // === Session ===

   async fn create(
      &mut self,
      restore_identifier: Option<SmolStr>,
      power_states: EventSink,
      restored: EventSink,
   ) {
      self.shutdown();

      let adapter = match self.open_adapter().await {
         Ok(adapter) => adapter,
         Err(e) => {
            error!("Failed to open Bluetooth adapter: {e}");
            power_states.emit(BridgeEvent::AdapterState(PowerState::Unsupported));
            return;
         },
      };
      info!("Using Bluetooth adapter {}", adapter.name());

      self.power_monitor = Some(tokio::spawn(watch_power(adapter.clone(), power_states)));
      if let Some(identifier) = restore_identifier {
         debug!("Restoring state for {identifier}");
         let adapter = adapter.clone();
         tokio::spawn(async move {
            match connected_devices(&adapter, &[]).await {
               Ok(peripherals) => restored.emit(BridgeEvent::RestoreState(peripherals)),
               Err(e) => restored.emit_error(e),
            }
         });
      }
      self.adapter = Some(adapter);
   }

   async fn open_adapter(&mut self) -> bluer::Result<Adapter> {
      let session = match self.session.take() {
         Some(session) => session,
         None => Session::new().await?,
      };
      let adapter = session.default_adapter().await;
      self.session = Some(session);
      adapter
   }

   /// Stops every feed and operation belonging to the current client.
   fn shutdown(&mut self) {
      let cancelled = self.transactions.cancel_all();
      if cancelled > 0 {
         debug!("Cancelled {cancelled} pending operation(s)");
      }
      self.stop_scan();
      if let Some(handle) = self.power_monitor.take() {
         handle.abort();
      }
      for (_, handle) in self.watchers.drain() {
         handle.abort();
      }
      self.adapter = None;
   }

   // === Scanning ===

   fn start_scan(&mut self, request: ScanRequest, results: EventSink) {
      self.stop_scan();
      let Some(adapter) = self.adapter.clone() else {
         results.emit_error(no_adapter());
         return;
      };
      debug!("Scan mode {} has no BlueZ equivalent", request.scan_mode);
      self.scan = Some(tokio::spawn(scan(adapter, request, results)));
   }

   fn stop_scan(&mut self) {
      if let Some(handle) = self.scan.take() {
         debug!("Stopping scan");
         handle.abort();
      }
   }

   // === Connection ===

   fn connect(
      &mut self,
      device_id: SmolStr,
      options: ConnectOptions,
      states: EventSink,
      reply: Responder<()>,
   ) {
      let address = match gatt::parse_address(&device_id) {
         Ok(address) => address,
         Err(e) => return reply.error(e),
      };
      states.emit(BridgeEvent::ConnectionState(ConnectionStateChange {
         device_identifier: device_id.clone(),
         state: ConnectionState::Connecting,
      }));
      self.observe(&device_id, false, states);

      let timeout = options
         .timeout_ms
         .map_or(self.timeouts.connect, Duration::from_millis);
      self.with_adapter(Tag::Connection(address), reply, move |adapter| async move {
         let device = gatt::device(&adapter, &device_id)?;
         let connect_failed = |e: &bluer::Error| {
            gatt::ble_error(BleErrorCode::DeviceConnectionFailed, e).device(device_id.clone())
         };
         if device.is_connected().await.map_err(|e| connect_failed(&e))? {
            return Err(BleError::new(BleErrorCode::DeviceAlreadyConnected)
               .device(device_id.clone()));
         }
         match time::timeout(timeout, device.connect()).await {
            Ok(result) => result.map_err(|e| connect_failed(&e)),
            Err(_) => Err(BleError::new(BleErrorCode::OperationTimedOut)
               .reason(format!("Connection timed out after {timeout:?}"))
               .device(device_id.clone())),
         }
      });
   }

   fn observe(&mut self, device_id: &str, emit_current: bool, states: EventSink) {
      let watched = self
         .adapter
         .as_ref()
         .ok_or_else(no_adapter)
         .and_then(|adapter| gatt::device(adapter, device_id));
      let device = match watched {
         Ok(device) => device,
         Err(e) => {
            states.emit_error(e);
            return;
         },
      };
      let address = device.address();
      let handle = tokio::spawn(watch_connection(device, device_id.into(), emit_current, states));
      if let Some(previous) = self.watchers.insert(address, handle) {
         previous.abort();
      }
   }

   fn cancel_connection(&mut self, device_id: SmolStr, reply: Responder<()>) {
      let address = match gatt::parse_address(&device_id) {
         Ok(address) => address,
         Err(e) => return reply.error(e),
      };
      let pending = self.transactions.cancel(&Tag::Connection(address));
      self.with_adapter(Tag::Untracked, reply, move |adapter| async move {
         let device = gatt::device(&adapter, &device_id)?;
         let connected = device.is_connected().await.unwrap_or(false);
         if !connected {
            if pending > 0 {
               return Ok(());
            }
            return Err(BleError::new(BleErrorCode::DeviceNotConnected).device(device_id));
         }
         device
            .disconnect()
            .await
            .map_err(|e| gatt::ble_error(BleErrorCode::DeviceDisconnected, &e).device(device_id))
      });
   }

   // === Notifications ===

   fn monitor(
      &self,
      path: CharacteristicPath,
      transaction_id: TransactionId,
      values: EventSink,
      reply: Responder<()>,
   ) {
      let Some(adapter) = self.adapter.clone() else {
         reply.error(no_adapter());
         return;
      };
      let ticket = self.transactions.begin(transaction_id.clone().into());
      let transactions = self.transactions.clone();
      tokio::spawn(async move {
         let mut cancelled = ticket.cancelled;
         let opened = select! {
            opened = open_notifications(&adapter, &path) => opened,
            _ = &mut cancelled => Err(cancelled_error()),
         };
         let (model, mut notifications) = match opened {
            Ok(opened) => opened,
            Err(e) => {
               transactions.end(ticket.id);
               reply.error(e);
               return;
            },
         };
         reply.success(());

         loop {
            select! {
               value = notifications.next() => {
                  let Some(value) = value else {
                     values.emit_error(
                        BleError::new(BleErrorCode::DeviceDisconnected)
                           .reason("Notifications ended")
                           .device(path.device_identifier.clone())
                           .service(path.service_uuid)
                           .characteristic(path.characteristic_uuid),
                     );
                     break;
                  };
                  values.emit(BridgeEvent::CharacteristicValue(MonitoredValue {
                     transaction_id: transaction_id.clone(),
                     characteristic: Characteristic {
                        value: Some(value),
                        ..model.clone()
                     },
                  }));
               }
               _ = &mut cancelled => {
                  debug!("Stopped monitoring {}", path.characteristic_uuid);
                  break;
               }
            }
         }
         transactions.end(ticket.id);
      });
   }
}

// === Tasks ===

async fn watch_power(adapter: Adapter, power_states: EventSink) {
   let mut events = match adapter.events().await {
      Ok(events) => events.boxed(),
      Err(e) => {
         power_states.emit_error(gatt::ble_error(BleErrorCode::BluetoothInUnknownState, &e));
         return;
      },
   };
   match adapter.is_powered().await {
      Ok(powered) => power_states.emit(BridgeEvent::AdapterState(powered.into())),
      Err(e) => warn!("Failed to read initial power state: {e}"),
   }
   while let Some(event) = events.next().await {
      if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
         debug!("Adapter powered: {powered}");
         power_states.emit(BridgeEvent::AdapterState(powered.into()));
      }
   }
   warn!("Adapter event stream ended");
}

async fn watch_connection(
   device: bluer::Device,
   device_id: SmolStr,
   emit_current: bool,
   states: EventSink,
) {
   let change = |connected: bool| {
      BridgeEvent::ConnectionState(ConnectionStateChange {
         device_identifier: device_id.clone(),
         state: ConnectionState::from(connected),
      })
   };
   let mut events = match device.events().await {
      Ok(events) => events.boxed(),
      Err(e) => {
         states.emit_error(gatt::ble_error(BleErrorCode::DeviceNotFound, &e).device(device_id.clone()));
         return;
      },
   };
   if emit_current {
      match device.is_connected().await {
         Ok(connected) => states.emit(change(connected)),
         Err(e) => warn!("Failed to read connection state of {device_id}: {e}"),
      }
   }
   while let Some(event) = events.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
         debug!("{device_id} connected: {connected}");
         states.emit(change(connected));
      }
   }
}

async fn scan(adapter: Adapter, request: ScanRequest, results: EventSink) {
   let filter = DiscoveryFilter {
      uuids: request.service_uuids.iter().copied().collect(),
      transport: DiscoveryTransport::Le,
      duplicate_data: request.callback_type == CALLBACK_TYPE_ALL_MATCHES,
      ..Default::default()
   };
   if let Err(e) = adapter.set_discovery_filter(filter).await {
      results.emit_error(gatt::ble_error(BleErrorCode::ScanStartFailed, &e));
      return;
   }

   let events: bluer::Result<BoxStream<'static, AdapterEvent>> =
      if request.callback_type == CALLBACK_TYPE_ALL_MATCHES {
         adapter.discover_devices_with_changes().await.map(StreamExt::boxed)
      } else {
         adapter.discover_devices().await.map(StreamExt::boxed)
      };
   let mut events = match events {
      Ok(events) => events,
      Err(e) => {
         results.emit_error(gatt::ble_error(BleErrorCode::ScanStartFailed, &e));
         return;
      },
   };
   info!("Scanning for {} service filter(s)", request.service_uuids.len());

   while let Some(event) = events.next().await {
      let AdapterEvent::DeviceAdded(address) = event else {
         continue;
      };
      let Ok(device) = adapter.device(address) else {
         continue;
      };
      match gatt::scan_result(&device).await {
         Ok(result) => results.emit(BridgeEvent::ScanResult(result)),
         Err(e) => debug!("Skipping {address}: {e}"),
      }
   }
}

// === Operations ===

async fn discover(adapter: &Adapter, device_id: &str, timeout: Duration) -> Result<(), BleError> {
   let device = gatt::connected_device(adapter, device_id).await?;
   let mut poll = time::interval(SERVICES_POLL_INTERVAL);
   poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

   let resolved = time::timeout(timeout, async {
      loop {
         poll.tick().await;
         if device.is_services_resolved().await? {
            return Ok::<(), bluer::Error>(());
         }
      }
   })
   .await;
   match resolved {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => Err(gatt::ble_error(BleErrorCode::ServicesDiscoveryFailed, &e).device(device_id)),
      Err(_) => Err(BleError::new(BleErrorCode::OperationTimedOut)
         .reason(format!("Service discovery timed out after {timeout:?}"))
         .device(device_id)),
   }
}

async fn services(adapter: &Adapter, device_id: &str) -> Result<Vec<Service>, BleError> {
   let device = gatt::connected_device(adapter, device_id).await?;
   gatt::ensure_resolved(&device, device_id).await?;
   let failed = |e: bluer::Error| gatt::ble_error(BleErrorCode::ServicesDiscoveryFailed, &e).device(device_id);

   let mut services = Vec::new();
   for service in device.services().await.map_err(failed)? {
      services.push(gatt::service_model(&service, device_id).await.map_err(failed)?);
   }
   Ok(services)
}

async fn characteristics(
   adapter: &Adapter,
   device_id: &str,
   service_uuid: Uuid,
) -> Result<Vec<Characteristic>, BleError> {
   let device = gatt::connected_device(adapter, device_id).await?;
   gatt::ensure_resolved(&device, device_id).await?;
   let service = gatt::find_service(&device, device_id, service_uuid).await?;
   let failed = |e: bluer::Error| {
      gatt::ble_error(BleErrorCode::CharacteristicsDiscoveryFailed, &e)
         .device(device_id)
         .service(service_uuid)
   };

   let mut characteristics = Vec::new();
   for characteristic in service.characteristics().await.map_err(failed)? {
      let path = CharacteristicPath {
         device_identifier: device_id.into(),
         service_uuid,
         characteristic_uuid: characteristic.uuid().await.map_err(failed)?,
      };
      characteristics.push(
         gatt::characteristic_model(&characteristic, &path, None)
            .await
            .map_err(failed)?,
      );
   }
   Ok(characteristics)
}

async fn descriptors(
   adapter: &Adapter,
   path: &CharacteristicPath,
) -> Result<Vec<Descriptor>, BleError> {
   let characteristic = gatt::find_characteristic(adapter, path).await?;
   let failed =
      |e: bluer::Error| gatt::characteristic_error(BleErrorCode::DescriptorsDiscoveryFailed, path, &e);

   let mut descriptors = Vec::new();
   for descriptor in characteristic.descriptors().await.map_err(failed)? {
      let path = DescriptorPath {
         characteristic: path.clone(),
         descriptor_uuid: descriptor.uuid().await.map_err(failed)?,
      };
      descriptors.push(gatt::descriptor_model(&path, None));
   }
   Ok(descriptors)
}

async fn read_rssi(adapter: &Adapter, device_id: &str) -> Result<i16, BleError> {
   let device = gatt::connected_device(adapter, device_id).await?;
   let rssi = device
      .rssi()
      .await
      .map_err(|e| gatt::ble_error(BleErrorCode::DeviceRssiReadFailed, &e).device(device_id))?;
   rssi.ok_or_else(|| {
      BleError::new(BleErrorCode::DeviceRssiReadFailed)
         .reason("BlueZ has no RSSI for this device")
         .device(device_id)
   })
}

async fn read_characteristic(
   adapter: &Adapter,
   path: &CharacteristicPath,
) -> Result<Characteristic, BleError> {
   let characteristic = gatt::find_characteristic(adapter, path).await?;
   let failed =
      |e: bluer::Error| gatt::characteristic_error(BleErrorCode::CharacteristicReadFailed, path, &e);
   let value = characteristic.read().await.map_err(failed)?;
   gatt::characteristic_model(&characteristic, path, Some(value))
      .await
      .map_err(failed)
}

async fn write_characteristic(
   adapter: &Adapter,
   path: &CharacteristicPath,
   value: Vec<u8>,
   with_response: bool,
) -> Result<Characteristic, BleError> {
   let characteristic = gatt::find_characteristic(adapter, path).await?;
   let failed =
      |e: bluer::Error| gatt::characteristic_error(BleErrorCode::CharacteristicWriteFailed, path, &e);
   if with_response {
      characteristic.write(&value).await.map_err(failed)?;
   } else {
      let request = CharacteristicWriteRequest {
         op_type: WriteOp::Command,
         ..Default::default()
      };
      characteristic
         .write_ext(&value, &request)
         .await
         .map_err(failed)?;
   }
   gatt::characteristic_model(&characteristic, path, Some(value))
      .await
      .map_err(failed)
}

async fn open_notifications(
   adapter: &Adapter,
   path: &CharacteristicPath,
) -> Result<(Characteristic, BoxStream<'static, Vec<u8>>), BleError> {
   let characteristic = gatt::find_characteristic(adapter, path).await?;
   let failed = |e: bluer::Error| {
      gatt::characteristic_error(BleErrorCode::CharacteristicNotifyChangeFailed, path, &e)
   };
   let model = gatt::characteristic_model(&characteristic, path, None)
      .await
      .map_err(failed)?;
   let notifications = characteristic.notify().await.map_err(failed)?;
   Ok((model, notifications.boxed()))
}

async fn known_devices(
   adapter: &Adapter,
   device_ids: &[SmolStr],
) -> Result<Vec<Peripheral>, BleError> {
   let addresses = adapter
      .device_addresses()
      .await
      .map_err(|e| gatt::ble_error(BleErrorCode::UnknownError, &e))?;

   let mut peripherals = Vec::new();
   for device_id in device_ids {
      let address = gatt::parse_address(device_id)?;
      if !addresses.contains(&address) {
         continue;
      }
      if let Ok(device) = adapter.device(address) {
         peripherals.push(gatt::peripheral(&device).await);
      }
   }
   Ok(peripherals)
}

async fn connected_devices(
   adapter: &Adapter,
   service_uuids: &[Uuid],
) -> Result<Vec<Peripheral>, BleError> {
   let addresses = adapter
      .device_addresses()
      .await
      .map_err(|e| gatt::ble_error(BleErrorCode::UnknownError, &e))?;

   let mut peripherals = Vec::new();
   for address in addresses {
      let Ok(device) = adapter.device(address) else {
         continue;
      };
      if device.is_connected().await != Ok(true) {
         continue;
      }
      if !service_uuids.is_empty() {
         let advertised = device.uuids().await.ok().flatten().unwrap_or_default();
         if !service_uuids.iter().any(|uuid| advertised.contains(uuid)) {
            continue;
         }
      }
      peripherals.push(gatt::peripheral(&device).await);
   }
   Ok(peripherals)
}
