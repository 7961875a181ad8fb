use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, method},
   model::BleError,
};

use super::{CallDelegate, descriptor_path, transaction_id, value_arg};

pub struct DescriptorsDelegate;

impl CallDelegate for DescriptorsDelegate {
   fn name(&self) -> &'static str {
      "descriptors"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[method::READ_DESCRIPTOR, method::WRITE_DESCRIPTOR]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      let path = descriptor_path(call)?;
      let transaction_id = transaction_id(call)?;
      if call.method == method::WRITE_DESCRIPTOR {
         adapter.write_descriptor(path, value_arg(call)?, transaction_id, reply.responder());
      } else {
         adapter.read_descriptor(path, transaction_id, reply.responder());
      }
      Ok(())
   }
}
