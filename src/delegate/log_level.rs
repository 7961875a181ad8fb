use crate::{
   adapter::BleAdapter,
   command::{MethodCall, ReplySlot, arg, method},
   model::{BleError, BleErrorCode, LogLevel},
};

use super::CallDelegate;

pub struct LogLevelDelegate;

impl CallDelegate for LogLevelDelegate {
   fn name(&self) -> &'static str {
      "log-level"
   }

   fn methods(&self) -> &'static [&'static str] {
      &[method::SET_LOG_LEVEL, method::LOG_LEVEL]
   }

   fn on_method_call(
      &self,
      adapter: &dyn BleAdapter,
      call: &MethodCall,
      reply: &mut ReplySlot,
   ) -> Result<(), BleError> {
      if call.method == method::LOG_LEVEL {
         adapter.log_level(reply.responder());
         return Ok(());
      }

      let name: String = call.required(arg::LOG_LEVEL)?;
      let level: LogLevel = name.parse().map_err(|_| {
         BleError::new(BleErrorCode::InvalidArguments).reason(format!("Unknown log level {name:?}"))
      })?;
      adapter.set_log_level(level);
      Ok(())
   }
}
