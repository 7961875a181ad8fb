use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, method},
   model::BleError,
};

use super::{CallDelegate, device_id, transaction_id};

pub struct RssiDelegate;

impl CallDelegate for RssiDelegate {
   fn name(&self) -> &'static str {
      "rssi"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[method::READ_RSSI]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      adapter.read_rssi(&device_id(call)?, transaction_id(call)?, reply.responder());
      Ok(())
   }
}
