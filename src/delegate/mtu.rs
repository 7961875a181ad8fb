use crate::{
   adapter::{BleAdapter, MIN_ATT_MTU},
   command::{MethodCall, ReplySlot, arg, method},
   model::{BleError, BleErrorCode},
};

use super::{CallDelegate, device_id, transaction_id};

pub struct MtuDelegate;

impl CallDelegate for MtuDelegate {
   fn name(&self) -> &'static str {
      "mtu"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[method::REQUEST_MTU]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      let mtu: u16 = call.required(arg::MTU)?;
      if mtu < MIN_ATT_MTU {
         return Err(BleError::new(BleErrorCode::InvalidArguments)
            .reason(format!("MTU {mtu} is below the minimum of {MIN_ATT_MTU}")));
      }
      adapter.request_mtu(&device_id(call)?, mtu, transaction_id(call)?, reply.responder());
      Ok(())
   }
}
