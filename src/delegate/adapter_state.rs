use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, method},
   model::BleError,
};

use super::{CallDelegate, transaction_id, unclaimed};

/// Radio power control and power-state queries.
pub struct AdapterStateDelegate;

impl CallDelegate for AdapterStateDelegate {
   fn name(&self) -> &'static str {
      "adapter-state"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[method::ENABLE_RADIO, method::DISABLE_RADIO, method::GET_STATE]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      match call.method.as_str() {
         method::ENABLE_RADIO => adapter.enable(transaction_id(call)?, reply.responder()),
         method::DISABLE_RADIO => adapter.disable(transaction_id(call)?, reply.responder()),
         method::GET_STATE => adapter.current_state(reply.responder()),
         _ => return Err(unclaimed(self, call)),
      }
      Ok(())
   }
}
