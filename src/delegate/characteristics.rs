//! Characteristic reads, writes and notifications.

use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, arg, method},
   event::EventSink,
   model::BleError,
};

use super::{CallDelegate, characteristic_path, transaction_id, unclaimed, value_arg};

/// Reads, writes and monitors characteristics. Monitored values go to the
/// characteristic-notifications stream.
pub struct CharacteristicsDelegate {
   notifications: EventSink,
}

impl CharacteristicsDelegate {
   pub const fn new(notifications: EventSink) -> Self {
      Self { notifications }
   }
}

impl CallDelegate for CharacteristicsDelegate {
   fn name(&self) -> &'static str {
      "characteristics"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[
         method::READ_CHARACTERISTIC,
         method::WRITE_CHARACTERISTIC,
         method::MONITOR_CHARACTERISTIC,
      ]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      let path = characteristic_path(call)?;
      let transaction_id = transaction_id(call)?;
      match call.method.as_str() {
         method::READ_CHARACTERISTIC => {
            adapter.read_characteristic(path, transaction_id, reply.responder());
         },
         method::WRITE_CHARACTERISTIC => {
            let value = value_arg(call)?;
            let with_response = call.argument(arg::WITH_RESPONSE)?.unwrap_or(true);
            adapter.write_characteristic(
               path,
               value,
               with_response,
               transaction_id,
               reply.responder(),
            );
         },
         method::MONITOR_CHARACTERISTIC => {
            adapter.monitor_characteristic(
               path,
               transaction_id,
               self.notifications.clone(),
               reply.responder(),
            );
         },
         _ => return Err(unclaimed(self, call)),
      }
      Ok(())
   }
}
