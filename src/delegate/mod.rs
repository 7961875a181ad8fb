//! Capability delegates.
//!
//! Each delegate owns one functional area of the command surface and turns
//! its commands into typed calls on the session's [`BleAdapter`]. Delegates
//! are built per session and receive the adapter only by reference for the
//! duration of a call, so they cannot outlive it.

use std::collections::HashMap;

use log::warn;
use smol_str::SmolStr;

use crate::{
   adapter::{BleAdapter, CharacteristicPath, DescriptorPath, TransactionId},
   command::{MethodCall, ReplySlot, arg},
   event::EventSink,
   model::{BleError, BleErrorCode, parse_uuid},
};

mod adapter_state;
mod characteristics;
mod connection;
mod descriptors;
mod devices;
mod discovery;
mod log_level;
mod mtu;
mod rssi;

pub use adapter_state::AdapterStateDelegate;
pub use characteristics::CharacteristicsDelegate;
pub use connection::DeviceConnectionDelegate;
pub use descriptors::DescriptorsDelegate;
pub use devices::DevicesDelegate;
pub use discovery::DiscoveryDelegate;
pub use log_level::LogLevelDelegate;
pub use mtu::MtuDelegate;
pub use rssi::RssiDelegate;

/// Handler for one functional area of the command surface.
pub trait CallDelegate: Send {
   /// Short name used in diagnostics.
   fn name(&self) -> &'static str;

   /// Commands this delegate claims.
   fn methods(&self) -> &'static [&'static str];

   /// Handles a claimed command. Returning an error before the reply slot
   /// was handed off reports it to the caller.
   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError>;
}

/// Delegates of one session, indexed by the commands they claim.
#[derive(Default)]
pub struct DelegateRegistry {
   delegates: Vec<Box<dyn CallDelegate>>,
   routes: HashMap<SmolStr, usize>,
}

impl DelegateRegistry {
   /// Builds the standard registry for a session.
   pub fn for_session(connection_states: EventSink, notifications: EventSink) -> Self {
      let mut registry = Self::default();
      registry.register(Box::new(DeviceConnectionDelegate::new(connection_states)));
      registry.register(Box::new(LogLevelDelegate));
      registry.register(Box::new(DiscoveryDelegate));
      registry.register(Box::new(AdapterStateDelegate));
      registry.register(Box::new(RssiDelegate));
      registry.register(Box::new(MtuDelegate));
      registry.register(Box::new(CharacteristicsDelegate::new(notifications)));
      registry.register(Box::new(DevicesDelegate));
      registry.register(Box::new(DescriptorsDelegate));
      registry
   }

   /// Appends a delegate. Commands already claimed by an earlier delegate
   /// stay with it.
   pub fn register(&mut self, delegate: Box<dyn CallDelegate>) {
      let index = self.delegates.len();
      for &method in delegate.methods() {
         if let Some(&owner) = self.routes.get(method) {
            warn!(
               "{method} claimed by both {} and {}, keeping {}",
               self.delegates[owner].name(),
               delegate.name(),
               self.delegates[owner].name()
            );
            continue;
         }
         self.routes.insert(method.into(), index);
      }
      self.delegates.push(delegate);
   }

   pub fn find(&self, method: &str) -> Option<&dyn CallDelegate> {
      self
         .routes
         .get(method)
         .map(|&index| self.delegates[index].as_ref())
   }

   pub fn len(&self) -> usize {
      self.delegates.len()
   }

   pub fn is_empty(&self) -> bool {
      self.delegates.is_empty()
   }

   pub fn clear(&mut self) {
      self.delegates.clear();
      self.routes.clear();
   }
}

/// Error for a command routed to a delegate that does not handle it.
fn unclaimed(delegate: &dyn CallDelegate, call: &MethodCall) -> BleError {
   BleError::new(BleErrorCode::UnknownError).reason(format!(
      "{} was routed to the {} delegate",
      call.method,
      delegate.name()
   ))
}

// === Argument helpers ===

fn device_id(call: &MethodCall) -> Result<SmolStr, BleError> {
   call.required(arg::DEVICE_IDENTIFIER)
}

fn transaction_id(call: &MethodCall) -> Result<TransactionId, BleError> {
   call.argument(arg::TRANSACTION_ID)
}

fn uuid_arg(call: &MethodCall, key: &str) -> Result<uuid::Uuid, BleError> {
   parse_uuid(&call.required::<String>(key)?)
}

fn characteristic_path(call: &MethodCall) -> Result<CharacteristicPath, BleError> {
   Ok(CharacteristicPath {
      device_identifier: device_id(call)?,
      service_uuid: uuid_arg(call, arg::SERVICE_UUID)?,
      characteristic_uuid: uuid_arg(call, arg::CHARACTERISTIC_UUID)?,
   })
}

fn descriptor_path(call: &MethodCall) -> Result<DescriptorPath, BleError> {
   Ok(DescriptorPath {
      characteristic: characteristic_path(call)?,
      descriptor_uuid: uuid_arg(call, arg::DESCRIPTOR_UUID)?,
   })
}

/// Decodes the hex `value` argument of a write.
fn value_arg(call: &MethodCall) -> Result<Vec<u8>, BleError> {
   let value: String = call.required(arg::VALUE)?;
   hex::decode(value.trim()).map_err(|e| {
      BleError::new(BleErrorCode::InvalidArguments)
         .reason(format!("'{}' is not a hex string", arg::VALUE))
         .internal(e.to_string())
   })
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tokio::sync::mpsc;

   use super::*;
   use crate::{command::method, event::StreamKind};

   fn registry() -> DelegateRegistry {
      let (tx, _rx) = mpsc::channel(1);
      DelegateRegistry::for_session(
         EventSink::new(StreamKind::ConnectionState, 1, 0, tx.clone()),
         EventSink::new(StreamKind::CharacteristicNotifications, 1, 0, tx),
      )
   }

   #[test]
   fn test_routes_by_area() {
      let registry = registry();
      assert_eq!(registry.len(), 9);

      let owner = |m: &str| registry.find(m).map(|d| d.name());
      assert_eq!(owner(method::CONNECT_TO_DEVICE), Some("connection"));
      assert_eq!(owner(method::SET_LOG_LEVEL), Some("log-level"));
      assert_eq!(owner(method::GET_SERVICES), Some("discovery"));
      assert_eq!(owner(method::GET_STATE), Some("adapter-state"));
      assert_eq!(owner(method::READ_RSSI), Some("rssi"));
      assert_eq!(owner(method::REQUEST_MTU), Some("mtu"));
      assert_eq!(owner(method::MONITOR_CHARACTERISTIC), Some("characteristics"));
      assert_eq!(owner(method::KNOWN_DEVICES), Some("devices"));
      assert_eq!(owner(method::WRITE_DESCRIPTOR), Some("descriptors"));
   }

   #[test]
   fn test_builtins_are_not_claimed() {
      let registry = registry();
      for builtin in [
         method::CREATE_CLIENT,
         method::DESTROY_CLIENT,
         method::START_DEVICE_SCAN,
         method::STOP_DEVICE_SCAN,
         method::CANCEL_TRANSACTION,
         method::IS_CLIENT_CREATED,
      ] {
         assert!(registry.find(builtin).is_none(), "{builtin} was claimed");
      }
   }

   struct Greedy;

   impl CallDelegate for Greedy {
      fn name(&self) -> &'static str {
         "greedy"
      }

      fn methods(&self) -> &'static [&'static str] {
         &[method::READ_RSSI, "greedy-only"]
      }

      fn on_method_call(
         &self,
         _adapter: &dyn BleAdapter,
         _call: &MethodCall,
         _reply: &mut ReplySlot,
      ) -> Result<(), BleError> {
         Ok(())
      }
   }

   #[test]
   fn test_first_registration_wins() {
      let mut registry = registry();
      registry.register(Box::new(Greedy));

      assert_eq!(registry.find(method::READ_RSSI).unwrap().name(), "rssi");
      assert_eq!(registry.find("greedy-only").unwrap().name(), "greedy");

      registry.clear();
      assert!(registry.is_empty());
      assert!(registry.find(method::READ_RSSI).is_none());
   }

   #[test]
   fn test_path_arguments() {
      let call = MethodCall::new(method::READ_DESCRIPTOR)
         .arg(arg::DEVICE_IDENTIFIER, "AA:BB:CC:DD:EE:FF")
         .arg(arg::SERVICE_UUID, "180D")
         .arg(arg::CHARACTERISTIC_UUID, "2A37")
         .arg(arg::DESCRIPTOR_UUID, "2902");

      let path = descriptor_path(&call).unwrap();
      assert_eq!(path.characteristic.device_identifier, "AA:BB:CC:DD:EE:FF");
      assert_eq!(path.characteristic.service_uuid, parse_uuid("180d").unwrap());
      assert_eq!(path.descriptor_uuid, parse_uuid("2902").unwrap());

      let missing = MethodCall::new(method::READ_DESCRIPTOR)
         .arg(arg::DEVICE_IDENTIFIER, "AA:BB:CC:DD:EE:FF")
         .arg(arg::SERVICE_UUID, "180D");
      assert_eq!(
         characteristic_path(&missing).unwrap_err().code,
         BleErrorCode::InvalidArguments
      );
   }

   #[test]
   fn test_value_argument() {
      let call = MethodCall::new(method::WRITE_CHARACTERISTIC).arg(arg::VALUE, "01ff");
      assert_eq!(value_arg(&call).unwrap(), vec![0x01, 0xff]);

      let call = MethodCall::new(method::WRITE_CHARACTERISTIC).arg(arg::VALUE, json!("xyz"));
      assert_eq!(
         value_arg(&call).unwrap_err().code,
         BleErrorCode::InvalidArguments
      );
   }
}
