//! The bridge between a host application and the BLE adapter.
//!
//! [`Bridge`] is a cheap handle to a single dispatch task. That task routes
//! every command, owns the adapter session and its delegates, and is the only
//! place stream events are delivered from. Adapter callbacks reach it through
//! a loopback channel, so subscribers never see deliveries concurrent with
//! each other or with command handling.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use crate::{
   adapter::{AdapterFactory, BleAdapter, CALLBACK_TYPE_ALL_MATCHES, ScanRequest},
   command::{MethodCall, Reply, ReplySlot, arg, await_reply, method},
   config::Config,
   delegate::DelegateRegistry,
   error::{BridgeError, Result},
   event::{EventSink, EventStreams, StreamKind, StreamSignal, StreamState, Subscription},
   model::{BleError, BleErrorCode, parse_uuid},
};

// === Commands ===

#[derive(Debug)]
enum BridgeCommand {
   Call(MethodCall, oneshot::Sender<Reply>),
   Attach(StreamKind, oneshot::Sender<Subscription>),
   Detach(StreamKind),
   StreamState(StreamKind, oneshot::Sender<StreamState>),
}

// === Handle ===

/// Handle to the bridge dispatch task.
///
/// Dropping every clone shuts the task down and releases the adapter.
#[derive(Debug, Clone)]
pub struct Bridge {
   inbox: mpsc::Sender<BridgeCommand>,
}

impl Bridge {
   /// Spawns the dispatch task on the current tokio runtime.
   pub fn spawn(factory: impl AdapterFactory + 'static, config: &Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
      let (loopback_tx, loopback_rx) = mpsc::channel(config.event_buffer.max(1));
      let actor = BridgeActor {
         factory: Box::new(factory),
         default_restore_identifier: config.default_restore_identifier.as_deref().map(SmolStr::new),
         command_rx,
         loopback_rx,
         loopback_tx,
         streams: EventStreams::default(),
         session: None,
         generation: 0,
      };
      tokio::spawn(actor.run());
      Self { inbox: command_tx }
   }

   /// Routes one command and waits for its reply.
   pub async fn dispatch(&self, call: MethodCall) -> Result<Reply> {
      Ok(self.submit(call).await?.wait().await)
   }

   /// Queues one command without waiting for its reply. Commands are
   /// handled in submission order.
   pub async fn submit(&self, call: MethodCall) -> Result<PendingReply> {
      let (tx, rx) = oneshot::channel();
      self.send(BridgeCommand::Call(call, tx)).await?;
      Ok(PendingReply(rx))
   }

   /// Subscribes to a stream, replacing any current subscriber.
   pub async fn attach(&self, kind: StreamKind) -> Result<Subscription> {
      let (tx, rx) = oneshot::channel();
      self.send(BridgeCommand::Attach(kind, tx)).await?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   pub async fn detach(&self, kind: StreamKind) -> Result<()> {
      self.send(BridgeCommand::Detach(kind)).await
   }

   pub async fn stream_state(&self, kind: StreamKind) -> Result<StreamState> {
      let (tx, rx) = oneshot::channel();
      self.send(BridgeCommand::StreamState(kind, tx)).await?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   async fn send(&self, command: BridgeCommand) -> Result<()> {
      self
         .inbox
         .send(command)
         .await
         .map_err(|_| BridgeError::BridgeShutdown)
   }
}

/// Reply to a submitted command.
#[derive(Debug)]
pub struct PendingReply(oneshot::Receiver<Reply>);

impl PendingReply {
   pub async fn wait(self) -> Reply {
      await_reply(self.0).await
   }
}

// === Dispatch task ===

/// The live adapter and the delegates bound to it.
struct Session {
   generation: u64,
   adapter: Box<dyn BleAdapter>,
   delegates: DelegateRegistry,
}

struct BridgeActor {
   factory: Box<dyn AdapterFactory>,
   default_restore_identifier: Option<SmolStr>,
   command_rx: mpsc::Receiver<BridgeCommand>,
   loopback_rx: mpsc::Receiver<StreamSignal>,
   loopback_tx: mpsc::Sender<StreamSignal>,

   // State
   streams: EventStreams,
   session: Option<Session>,
   /// Generation of the most recently created session.
   generation: u64,
}

impl BridgeActor {
   async fn run(mut self) {
      info!("Bridge dispatcher starting up");

      loop {
         select! {
             // Drain adapter callbacks before the next command
             biased;
             Some(signal) = self.loopback_rx.recv() => {
                 self.handle_signal(signal);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bridge dispatcher shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
         }
      }

      self.destroy_client();
   }

   fn handle_command(&mut self, cmd: BridgeCommand) {
      match cmd {
         BridgeCommand::Call(call, reply) => {
            self.on_method_call(&call, ReplySlot::new(reply));
         },
         BridgeCommand::Attach(kind, reply) => {
            let _ = reply.send(self.streams.get_mut(kind).attach());
         },
         BridgeCommand::Detach(kind) => {
            self.streams.get_mut(kind).detach();
         },
         BridgeCommand::StreamState(kind, reply) => {
            let _ = reply.send(self.streams.get(kind).state());
         },
      }
   }

   fn handle_signal(&mut self, signal: StreamSignal) {
      let current = self.session.as_ref().map(|s| s.generation);
      if current != Some(signal.generation) {
         debug!(
            "Dropping {} item from stale session {}",
            signal.kind, signal.generation
         );
         return;
      }
      self.streams.deliver(signal);
   }

   fn on_method_call(&mut self, call: &MethodCall, mut reply: ReplySlot) {
      debug!("Observed method: {}", call.method);

      if let Some(session) = &self.session
         && let Some(delegate) = session.delegates.find(&call.method)
      {
         let outcome = delegate.on_method_call(session.adapter.as_ref(), call, &mut reply);
         reply.finish(outcome);
         return;
      }

      let outcome = match call.method.as_str() {
         method::CREATE_CLIENT => self.create_client(call),
         method::DESTROY_CLIENT => {
            self.destroy_client();
            Ok(())
         },
         method::START_DEVICE_SCAN => self.start_device_scan(call),
         method::STOP_DEVICE_SCAN => {
            self.stop_device_scan();
            Ok(())
         },
         method::CANCEL_TRANSACTION => self.cancel_transaction(call),
         method::IS_CLIENT_CREATED => {
            reply.success(self.session.is_some());
            Ok(())
         },
         _ => {
            debug!("No handler for {}", call.method);
            reply.send(Reply::NotImplemented);
            Ok(())
         },
      };
      reply.finish(outcome);
   }

   /// Builds a sink for `kind` bound to the current session generation.
   fn sink(&self, kind: StreamKind) -> EventSink {
      EventSink::new(
         kind,
         self.generation,
         self.streams.get(kind).epoch(),
         self.loopback_tx.clone(),
      )
   }

   fn create_client(&mut self, call: &MethodCall) -> std::result::Result<(), BleError> {
      let restore_identifier = call
         .argument::<SmolStr>(arg::RESTORE_IDENTIFIER)?
         .or_else(|| self.default_restore_identifier.clone());

      if self.session.is_some() {
         warn!(
            "Overwriting existing native client. Use {} to check whether a client already exists.",
            method::IS_CLIENT_CREATED
         );
         self.destroy_client();
      }

      self.generation += 1;
      let adapter = self.factory.new_adapter();
      let delegates = DelegateRegistry::for_session(
         self.sink(StreamKind::ConnectionState),
         self.sink(StreamKind::CharacteristicNotifications),
      );
      adapter.create_client(
         restore_identifier.as_deref(),
         self.sink(StreamKind::AdapterPowerState),
         self.sink(StreamKind::StateRestoration),
      );

      info!(
         "Created client session {} with {} delegates",
         self.generation,
         delegates.len()
      );
      self.session = Some(Session {
         generation: self.generation,
         adapter,
         delegates,
      });
      Ok(())
   }

   fn destroy_client(&mut self) {
      let Some(mut session) = self.session.take() else {
         debug!("No client to destroy");
         return;
      };

      session.adapter.destroy_client();
      session.delegates.clear();
      self.streams.get_mut(StreamKind::ScanResults).complete();
      self.streams.get_mut(StreamKind::ConnectionState).complete();

      info!("Destroyed client session {}", session.generation);
   }

   fn start_device_scan(&self, call: &MethodCall) -> std::result::Result<(), BleError> {
      let Some(session) = &self.session else {
         return Err(BleError::new(BleErrorCode::BluetoothManagerDestroyed)
            .reason("Cannot scan before a client is created"));
      };

      let service_uuids = call
         .argument::<Vec<String>>(arg::UUIDS)?
         .unwrap_or_default()
         .iter()
         .map(String::as_str)
         .map(parse_uuid)
         .collect::<std::result::Result<BTreeSet<_>, _>>()?;
      let request = ScanRequest {
         service_uuids,
         scan_mode: call.argument(arg::SCAN_MODE)?.unwrap_or_default(),
         callback_type: call
            .argument(arg::CALLBACK_TYPE)?
            .unwrap_or(CALLBACK_TYPE_ALL_MATCHES),
      };

      debug!("Starting scan: {request:?}");
      session
         .adapter
         .start_device_scan(request, self.sink(StreamKind::ScanResults));
      Ok(())
   }

   fn stop_device_scan(&mut self) {
      if let Some(session) = &self.session {
         session.adapter.stop_device_scan();
      }
      self.streams.get_mut(StreamKind::ScanResults).complete();
   }

   fn cancel_transaction(&self, call: &MethodCall) -> std::result::Result<(), BleError> {
      let Some(session) = &self.session else {
         return Ok(());
      };
      let transaction_id: SmolStr = call.required(arg::TRANSACTION_ID)?;
      session.adapter.cancel_transaction(&transaction_id);
      Ok(())
   }
}
