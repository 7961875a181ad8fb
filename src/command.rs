//! Inbound commands and their replies.
//!
//! A [`MethodCall`] is a command name plus a JSON object of named
//! arguments. Every call resolves to exactly one [`Reply`].

use std::marker::PhantomData;

use log::warn;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use smol_str::SmolStr;
use tokio::sync::oneshot;

use crate::model::{BleError, BleErrorCode};

/// Command names understood by the bridge.
pub mod method {
   // Built-in session, scan and cancel commands
   pub const CREATE_CLIENT: &str = "create-client";
   pub const DESTROY_CLIENT: &str = "destroy-client";
   pub const START_DEVICE_SCAN: &str = "start-device-scan";
   pub const STOP_DEVICE_SCAN: &str = "stop-device-scan";
   pub const CANCEL_TRANSACTION: &str = "cancel-transaction";
   pub const IS_CLIENT_CREATED: &str = "is-client-created";

   pub const CONNECT_TO_DEVICE: &str = "connect-to-device";
   pub const IS_DEVICE_CONNECTED: &str = "is-device-connected";
   pub const OBSERVE_CONNECTION_STATE: &str = "observe-connection-state";
   pub const CANCEL_CONNECTION: &str = "cancel-connection";

   pub const SET_LOG_LEVEL: &str = "set-log-level";
   pub const LOG_LEVEL: &str = "log-level";

   pub const DISCOVER_ALL_SERVICES_AND_CHARACTERISTICS: &str =
      "discover-all-services-and-characteristics";
   pub const GET_SERVICES: &str = "get-services";
   pub const GET_CHARACTERISTICS: &str = "get-characteristics";
   pub const GET_DESCRIPTORS: &str = "get-descriptors";

   pub const ENABLE_RADIO: &str = "enable-radio";
   pub const DISABLE_RADIO: &str = "disable-radio";
   pub const GET_STATE: &str = "get-state";

   pub const READ_RSSI: &str = "read-rssi";

   pub const REQUEST_MTU: &str = "request-mtu";

   pub const READ_CHARACTERISTIC: &str = "read-characteristic";
   pub const WRITE_CHARACTERISTIC: &str = "write-characteristic";
   pub const MONITOR_CHARACTERISTIC: &str = "monitor-characteristic";

   pub const KNOWN_DEVICES: &str = "known-devices";
   pub const CONNECTED_DEVICES: &str = "connected-devices";

   pub const READ_DESCRIPTOR: &str = "read-descriptor";
   pub const WRITE_DESCRIPTOR: &str = "write-descriptor";
}

/// Argument keys used by the commands in [`method`].
pub mod arg {
   pub const RESTORE_IDENTIFIER: &str = "restoreIdentifier";
   pub const UUIDS: &str = "uuids";
   pub const SCAN_MODE: &str = "scanMode";
   pub const CALLBACK_TYPE: &str = "callbackType";
   pub const TRANSACTION_ID: &str = "transactionId";
   pub const DEVICE_IDENTIFIER: &str = "deviceIdentifier";
   pub const DEVICE_IDENTIFIERS: &str = "deviceIdentifiers";
   pub const TIMEOUT_MILLIS: &str = "timeoutMillis";
   pub const EMIT_CURRENT_VALUE: &str = "emitCurrentValue";
   pub const LOG_LEVEL: &str = "logLevel";
   pub const SERVICE_UUID: &str = "serviceUuid";
   pub const CHARACTERISTIC_UUID: &str = "characteristicUuid";
   pub const DESCRIPTOR_UUID: &str = "descriptorUuid";
   pub const MTU: &str = "mtu";
   pub const VALUE: &str = "value";
   pub const WITH_RESPONSE: &str = "withResponse";
}

/// A single inbound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
   pub method: SmolStr,
   #[serde(default)]
   pub arguments: Map<String, Value>,
}

impl MethodCall {
   pub fn new(method: impl Into<SmolStr>) -> Self {
      Self {
         method: method.into(),
         arguments: Map::new(),
      }
   }

   /// Adds an argument, replacing any previous value under `key`.
   #[must_use]
   pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
      self.arguments.insert(key.to_string(), value.into());
      self
   }

   /// Reads an optional argument. A missing key and an explicit `null` both
   /// yield `None`.
   pub fn argument<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BleError> {
      match self.arguments.get(key) {
         None | Some(Value::Null) => Ok(None),
         Some(value) => T::deserialize(value).map(Some).map_err(|e| {
            BleError::new(BleErrorCode::InvalidArguments)
               .reason(format!("Invalid '{key}' argument for {}", self.method))
               .internal(e.to_string())
         }),
      }
   }

   /// Reads an argument that must be present.
   pub fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T, BleError> {
      self.argument(key)?.ok_or_else(|| {
         BleError::new(BleErrorCode::InvalidArguments)
            .reason(format!("Missing '{key}' argument for {}", self.method))
      })
   }
}

/// Outcome of a dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum Reply {
   Success(Value),
   Error(BleError),
   NotImplemented,
}

impl Reply {
   pub const fn is_success(&self) -> bool {
      matches!(self, Self::Success(_))
   }
}

/// Holds the reply channel of a call until a handler claims it.
///
/// Handlers either turn the slot into a typed [`Responder`] handed to the
/// adapter, or answer directly. Whatever is left unanswered when the
/// handler returns is resolved by [`ReplySlot::finish`].
#[derive(Debug)]
pub struct ReplySlot {
   tx: Option<oneshot::Sender<Reply>>,
}

impl ReplySlot {
   pub const fn new(tx: oneshot::Sender<Reply>) -> Self {
      Self { tx: Some(tx) }
   }

   pub const fn is_pending(&self) -> bool {
      self.tx.is_some()
   }

   /// Takes the reply channel as a typed responder.
   pub fn responder<T: Serialize>(&mut self) -> Responder<T> {
      Responder {
         tx: self.tx.take(),
         _marker: PhantomData,
      }
   }

   pub fn send(&mut self, reply: Reply) {
      if let Some(tx) = self.tx.take() {
         let _ = tx.send(reply);
      } else {
         warn!("Reply already handed off, dropping {reply:?}");
      }
   }

   pub fn success(&mut self, value: impl Into<Value>) {
      self.send(Reply::Success(value.into()));
   }

   pub fn error(&mut self, error: BleError) {
      self.send(Reply::Error(error));
   }

   /// Resolves a handler's outcome: errors are reported if the slot is
   /// still pending, and a pending slot after success answers `null`.
   pub fn finish(mut self, outcome: Result<(), BleError>) {
      match outcome {
         Err(error) => self.error(error),
         Ok(()) if self.is_pending() => self.success(Value::Null),
         Ok(()) => {},
      }
   }
}

/// Typed, single-use reply handle given to the adapter.
///
/// The adapter may complete it from any thread.
#[derive(Debug)]
pub struct Responder<T> {
   tx: Option<oneshot::Sender<Reply>>,
   _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> Responder<T> {
   pub fn respond(mut self, result: Result<T, BleError>) {
      let Some(tx) = self.tx.take() else {
         return;
      };
      let reply = match result.map(serde_json::to_value) {
         Ok(Ok(value)) => Reply::Success(value),
         Ok(Err(e)) => Reply::Error(
            BleError::new(BleErrorCode::UnknownError)
               .reason("Failed to encode reply")
               .internal(e.to_string()),
         ),
         Err(error) => Reply::Error(error),
      };
      // Caller may have stopped waiting
      let _ = tx.send(reply);
   }

   pub fn success(self, value: T) {
      self.respond(Ok(value));
   }

   pub fn error(self, error: BleError) {
      self.respond(Err(error));
   }
}

/// Awaits a reply, mapping a dropped responder to an error reply.
pub(crate) async fn await_reply(rx: oneshot::Receiver<Reply>) -> Reply {
   rx.await.unwrap_or_else(|_| {
      Reply::Error(
         BleError::new(BleErrorCode::UnknownError).reason("Adapter dropped the reply"),
      )
   })
}

#[cfg(test)]
mod tests {
   use serde_json::json;

   use super::*;

   #[test]
   fn test_arguments() {
      let call = MethodCall::new(method::START_DEVICE_SCAN)
         .arg(arg::UUIDS, json!(["180D"]))
         .arg(arg::SCAN_MODE, 2)
         .arg(arg::RESTORE_IDENTIFIER, Value::Null);

      assert_eq!(
         call.required::<Vec<String>>(arg::UUIDS).unwrap(),
         vec!["180D".to_string()]
      );
      assert_eq!(call.argument::<i32>(arg::SCAN_MODE).unwrap(), Some(2));
      assert_eq!(call.argument::<String>(arg::RESTORE_IDENTIFIER).unwrap(), None);
      assert_eq!(call.argument::<i32>(arg::CALLBACK_TYPE).unwrap(), None);
   }

   #[test]
   fn test_argument_errors() {
      let call = MethodCall::new(method::READ_RSSI).arg(arg::DEVICE_IDENTIFIER, 7);

      let err = call.required::<String>(arg::DEVICE_IDENTIFIER).unwrap_err();
      assert_eq!(err.code, BleErrorCode::InvalidArguments);

      let err = call.required::<String>(arg::TRANSACTION_ID).unwrap_err();
      assert_eq!(err.code, BleErrorCode::InvalidArguments);
      assert!(err.reason.unwrap().contains("transactionId"));
   }

   #[test]
   fn test_call_from_json() {
      let call: MethodCall = serde_json::from_value(json!({
         "method": "cancel-transaction",
         "arguments": { "transactionId": "tx-1" },
      }))
      .unwrap();
      assert_eq!(call.method, method::CANCEL_TRANSACTION);
      assert_eq!(call.required::<String>(arg::TRANSACTION_ID).unwrap(), "tx-1");

      let bare: MethodCall = serde_json::from_value(json!({ "method": "log-level" })).unwrap();
      assert!(bare.arguments.is_empty());
   }

   #[test]
   fn test_reply_json_shape() {
      assert_eq!(
         serde_json::to_value(Reply::Success(json!(true))).unwrap(),
         json!({ "status": "success", "value": true })
      );
      assert_eq!(
         serde_json::to_value(Reply::NotImplemented).unwrap(),
         json!({ "status": "notImplemented" })
      );
   }

   #[tokio::test]
   async fn test_slot_finish() {
      let (tx, rx) = oneshot::channel();
      ReplySlot::new(tx).finish(Ok(()));
      assert_eq!(rx.await.unwrap(), Reply::Success(Value::Null));

      let (tx, rx) = oneshot::channel();
      let err = BleError::new(BleErrorCode::InvalidArguments);
      ReplySlot::new(tx).finish(Err(err.clone()));
      assert_eq!(rx.await.unwrap(), Reply::Error(err));
   }

   #[tokio::test]
   async fn test_responder_outcomes() {
      let (tx, rx) = oneshot::channel();
      let mut slot = ReplySlot::new(tx);
      let responder = slot.responder::<i16>();
      assert!(!slot.is_pending());
      slot.finish(Ok(()));
      responder.success(-61);
      assert_eq!(rx.await.unwrap(), Reply::Success(json!(-61)));

      let (tx, rx) = oneshot::channel();
      drop(ReplySlot::new(tx).responder::<()>());
      assert!(matches!(
         await_reply(rx).await,
         Reply::Error(BleError {
            code: BleErrorCode::UnknownError,
            ..
         })
      ));
   }
}
