use smol_str::SmolStr;

use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, arg, method},
   model::{BleError, parse_uuid},
};

use super::{CallDelegate, unclaimed};

/// Lookup of peripherals the adapter already knows about.
pub struct DevicesDelegate;

impl CallDelegate for DevicesDelegate {
   fn name(&self) -> &'static str {
      "devices"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[method::KNOWN_DEVICES, method::CONNECTED_DEVICES]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      match call.method.as_str() {
         method::KNOWN_DEVICES => {
            let ids: Vec<SmolStr> = call.argument(arg::DEVICE_IDENTIFIERS)?.unwrap_or_default();
            adapter.known_devices(ids, reply.responder());
         },
         method::CONNECTED_DEVICES => {
            let uuids = call
               .argument::<Vec<String>>(arg::UUIDS)?
               .unwrap_or_default()
               .iter()
               .map(String::as_str)
               .map(parse_uuid)
               .collect::<Result<Vec<_>, _>>()?;
            adapter.connected_devices(uuids, reply.responder());
         },
         _ => return Err(unclaimed(self, call)),
      }
      Ok(())
   }
}
