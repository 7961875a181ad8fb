//! Connection lifecycle commands.

use crate::{
   adapter::{BleAdapter, ConnectOptions},
   command::{MethodCall, ReplySlot, arg, method},
   event::EventSink,
   model::BleError,
};

use super::{CallDelegate, device_id, unclaimed};

/// Connects and disconnects peripherals; state changes go to the
/// connection-state stream.
pub struct DeviceConnectionDelegate {
   states: EventSink,
}

impl DeviceConnectionDelegate {
   pub const fn new(states: EventSink) -> Self {
      Self { states }
   }
}

impl CallDelegate for DeviceConnectionDelegate {
   fn name(&self) -> &'static str {
      "connection"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[
         method::CONNECT_TO_DEVICE,
         method::IS_DEVICE_CONNECTED,
         method::OBSERVE_CONNECTION_STATE,
         method::CANCEL_CONNECTION,
      ]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      let device_id = device_id(call)?;
      match call.method.as_str() {
         method::CONNECT_TO_DEVICE => {
            let options = ConnectOptions {
               timeout_ms: call.argument(arg::TIMEOUT_MILLIS)?,
            };
            adapter.connect_to_device(&device_id, options, self.states.clone(), reply.responder());
         },
         method::IS_DEVICE_CONNECTED => {
            adapter.is_device_connected(&device_id, reply.responder());
         },
         method::OBSERVE_CONNECTION_STATE => {
            let emit_current = call.argument(arg::EMIT_CURRENT_VALUE)?.unwrap_or(false);
            adapter.observe_connection_state(&device_id, emit_current, self.states.clone());
         },
         method::CANCEL_CONNECTION => {
            adapter.cancel_connection(&device_id, reply.responder());
         },
         _ => return Err(unclaimed(self, call)),
      }
      Ok(())
   }
}
