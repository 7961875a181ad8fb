//! Service, characteristic and descriptor discovery.

use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, arg, method},
   model::BleError,
};

use super::{
   CallDelegate, characteristic_path, device_id, transaction_id, unclaimed, uuid_arg,
};

pub struct DiscoveryDelegate;

impl CallDelegate for DiscoveryDelegate {
   fn name(&self) -> &'static str {
      "discovery"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[
         method::DISCOVER_ALL_SERVICES_AND_CHARACTERISTICS,
         method::GET_SERVICES,
         method::GET_CHARACTERISTICS,
         method::GET_DESCRIPTORS,
      ]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      match call.method.as_str() {
         method::DISCOVER_ALL_SERVICES_AND_CHARACTERISTICS => {
            adapter.discover_all_services_and_characteristics(
               &device_id(call)?,
               transaction_id(call)?,
               reply.responder(),
            );
         },
         method::GET_SERVICES => {
            adapter.services_for_device(&device_id(call)?, reply.responder());
         },
         method::GET_CHARACTERISTICS => {
            let service_uuid = uuid_arg(call, arg::SERVICE_UUID)?;
            adapter.characteristics_for_service(&device_id(call)?, service_uuid, reply.responder());
         },
         method::GET_DESCRIPTORS => {
            adapter.descriptors_for_characteristic(characteristic_path(call)?, reply.responder());
         },
         _ => return Err(unclaimed(self, call)),
      }
      Ok(())
   }
}
