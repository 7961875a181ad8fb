//! Event streams fed by the adapter.
//!
//! The bridge owns one [`EventStream`] per [`StreamKind`]. Each stream has at
//! most one subscriber; attaching replaces the previous one. Adapter
//! callbacks never touch a stream directly: they go through an [`EventSink`],
//! which queues a [`StreamSignal`] for the dispatch task to deliver.

use std::{
   pin::Pin,
   task::{Context, Poll},
};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{
   BleError, ConnectionStateChange, MonitoredValue, Peripheral, PowerState, ScanResult,
};

/// The independent event categories exposed to the host.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   strum::Display,
   strum::EnumIter,
   strum::EnumCount,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StreamKind {
   AdapterPowerState,
   StateRestoration,
   ScanResults,
   ConnectionState,
   CharacteristicNotifications,
}

/// Events delivered on the streams.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum BridgeEvent {
   AdapterState(PowerState),
   RestoreState(Vec<Peripheral>),
   ScanResult(ScanResult),
   ConnectionState(ConnectionStateChange),
   CharacteristicValue(MonitoredValue),
}

impl BridgeEvent {
   /// The stream this event belongs on.
   pub const fn kind(&self) -> StreamKind {
      match self {
         Self::AdapterState(_) => StreamKind::AdapterPowerState,
         Self::RestoreState(_) => StreamKind::StateRestoration,
         Self::ScanResult(_) => StreamKind::ScanResults,
         Self::ConnectionState(_) => StreamKind::ConnectionState,
         Self::CharacteristicValue(_) => StreamKind::CharacteristicNotifications,
      }
   }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamItem {
   Event(BridgeEvent),
   Error(BleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamState {
   Inactive,
   Active,
}

/// Receiving end of a stream subscription.
///
/// Yields `None` once the stream is completed, detached, or replaced by a
/// newer subscriber.
#[derive(Debug)]
pub struct Subscription {
   kind: StreamKind,
   rx: mpsc::UnboundedReceiver<StreamItem>,
}

impl Subscription {
   pub const fn kind(&self) -> StreamKind {
      self.kind
   }

   pub async fn recv(&mut self) -> Option<StreamItem> {
      self.rx.recv().await
   }

   /// Returns the next item if one is already queued.
   pub fn try_recv(&mut self) -> Option<StreamItem> {
      self.rx.try_recv().ok()
   }
}

impl futures::Stream for Subscription {
   type Item = StreamItem;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.rx.poll_recv(cx)
   }
}

/// A single-subscriber stream of one event category.
#[derive(Debug)]
pub struct EventStream {
   kind: StreamKind,
   subscriber: Option<mpsc::UnboundedSender<StreamItem>>,
   /// Bumped on every completion so feeds started before it go stale.
   epoch: u64,
}

impl EventStream {
   pub const fn new(kind: StreamKind) -> Self {
      Self {
         kind,
         subscriber: None,
         epoch: 0,
      }
   }

   pub const fn kind(&self) -> StreamKind {
      self.kind
   }

   pub const fn epoch(&self) -> u64 {
      self.epoch
   }

   pub fn state(&self) -> StreamState {
      match &self.subscriber {
         Some(tx) if !tx.is_closed() => StreamState::Active,
         _ => StreamState::Inactive,
      }
   }

   /// Attaches a new subscriber, ending the previous one if any.
   pub fn attach(&mut self) -> Subscription {
      let (tx, rx) = mpsc::unbounded_channel();
      if self.subscriber.replace(tx).is_some() {
         debug!("Replacing subscriber on {} stream", self.kind);
      }
      Subscription {
         kind: self.kind,
         rx,
      }
   }

   pub fn detach(&mut self) {
      self.subscriber = None;
   }

   pub fn emit(&mut self, event: BridgeEvent) {
      self.deliver(StreamItem::Event(event));
   }

   pub fn emit_error(&mut self, error: BleError) {
      self.deliver(StreamItem::Error(error));
   }

   /// Ends the current subscription, if any, and starts a new epoch so
   /// feeds created before this point go stale even when nobody listened.
   pub fn complete(&mut self) {
      self.epoch += 1;
      if self.subscriber.take().is_some() {
         debug!("Completed {} stream", self.kind);
      }
   }

   fn deliver(&mut self, item: StreamItem) {
      let Some(tx) = &self.subscriber else {
         return;
      };
      if tx.send(item).is_err() {
         debug!("Subscriber of {} stream went away", self.kind);
         self.subscriber = None;
      }
   }
}

/// The full set of streams, one per [`StreamKind`].
#[derive(Debug)]
pub struct EventStreams {
   streams: [EventStream; <StreamKind as strum::EnumCount>::COUNT],
}

impl Default for EventStreams {
   fn default() -> Self {
      Self {
         streams: [
            EventStream::new(StreamKind::AdapterPowerState),
            EventStream::new(StreamKind::StateRestoration),
            EventStream::new(StreamKind::ScanResults),
            EventStream::new(StreamKind::ConnectionState),
            EventStream::new(StreamKind::CharacteristicNotifications),
         ],
      }
   }
}

impl EventStreams {
   pub const fn get(&self, kind: StreamKind) -> &EventStream {
      &self.streams[kind as usize]
   }

   pub const fn get_mut(&mut self, kind: StreamKind) -> &mut EventStream {
      &mut self.streams[kind as usize]
   }

   /// Delivers a queued signal unless it belongs to a completed epoch.
   pub fn deliver(&mut self, signal: StreamSignal) {
      let stream = self.get_mut(signal.kind);
      if signal.epoch != stream.epoch() {
         debug!(
            "Dropping late {} item from epoch {} (now {})",
            signal.kind,
            signal.epoch,
            stream.epoch()
         );
         return;
      }
      match signal.item {
         StreamItem::Event(event) => stream.emit(event),
         StreamItem::Error(error) => stream.emit_error(error),
      }
   }
}

/// A stream item queued by an adapter callback, tagged with where it came
/// from.
#[derive(Debug)]
pub struct StreamSignal {
   pub generation: u64,
   pub epoch: u64,
   pub kind: StreamKind,
   pub item: StreamItem,
}

/// Callback handle given to the adapter for one stream.
///
/// Cheap to clone and safe to use from any thread. Items are queued for the
/// dispatch task; nothing is delivered synchronously.
#[derive(Debug, Clone)]
pub struct EventSink {
   kind: StreamKind,
   generation: u64,
   epoch: u64,
   tx: mpsc::Sender<StreamSignal>,
}

impl EventSink {
   pub(crate) const fn new(
      kind: StreamKind,
      generation: u64,
      epoch: u64,
      tx: mpsc::Sender<StreamSignal>,
   ) -> Self {
      Self {
         kind,
         generation,
         epoch,
         tx,
      }
   }

   pub const fn kind(&self) -> StreamKind {
      self.kind
   }

   pub fn emit(&self, event: BridgeEvent) {
      if event.kind() != self.kind {
         warn!("Refusing {} event on {} sink", event.kind(), self.kind);
         return;
      }
      self.send(StreamItem::Event(event));
   }

   pub fn emit_error(&self, error: BleError) {
      self.send(StreamItem::Error(error));
   }

   fn send(&self, item: StreamItem) {
      let signal = StreamSignal {
         generation: self.generation,
         epoch: self.epoch,
         kind: self.kind,
         item,
      };
      if let Err(e) = self.tx.try_send(signal) {
         warn!("Channel overflow sending {} event: {e}", self.kind);
      }
   }
}

#[cfg(test)]
mod tests {
   use strum::IntoEnumIterator;

   use super::*;
   use crate::model::{BleErrorCode, ConnectionState};

   fn scan_result(id: &str) -> BridgeEvent {
      BridgeEvent::ScanResult(ScanResult {
         device_identifier: id.into(),
         ..Default::default()
      })
   }

   #[test]
   fn test_emit_without_subscriber_is_dropped() {
      let mut stream = EventStream::new(StreamKind::ScanResults);
      stream.emit(scan_result("early"));
      assert_eq!(stream.state(), StreamState::Inactive);

      let mut sub = stream.attach();
      assert_eq!(stream.state(), StreamState::Active);
      stream.emit(scan_result("late"));
      assert_eq!(sub.try_recv(), Some(StreamItem::Event(scan_result("late"))));
      assert_eq!(sub.try_recv(), None);
   }

   #[test]
   fn test_delivery_order_and_errors() {
      let mut stream = EventStream::new(StreamKind::ScanResults);
      let mut sub = stream.attach();
      let error = BleError::new(BleErrorCode::ScanStartFailed);

      stream.emit(scan_result("a"));
      stream.emit_error(error.clone());
      stream.emit(scan_result("b"));

      assert_eq!(sub.try_recv(), Some(StreamItem::Event(scan_result("a"))));
      assert_eq!(sub.try_recv(), Some(StreamItem::Error(error)));
      assert_eq!(sub.try_recv(), Some(StreamItem::Event(scan_result("b"))));
   }

   #[tokio::test]
   async fn test_complete_then_reattach() {
      let mut stream = EventStream::new(StreamKind::ConnectionState);
      let mut first = stream.attach();

      stream.complete();
      assert_eq!(stream.state(), StreamState::Inactive);
      assert_eq!(stream.epoch(), 1);
      assert_eq!(first.recv().await, None);

      // Completing an inactive stream still retires the epoch
      stream.complete();
      assert_eq!(stream.state(), StreamState::Inactive);
      assert_eq!(stream.epoch(), 2);

      let mut second = stream.attach();
      let change = BridgeEvent::ConnectionState(ConnectionStateChange {
         device_identifier: "AA:BB:CC:DD:EE:FF".into(),
         state: ConnectionState::Connected,
      });
      stream.emit(change.clone());
      assert_eq!(second.recv().await, Some(StreamItem::Event(change)));
   }

   #[tokio::test]
   async fn test_attach_replaces_subscriber() {
      let mut stream = EventStream::new(StreamKind::ScanResults);
      let mut first = stream.attach();
      let mut second = stream.attach();

      stream.emit(scan_result("x"));
      assert_eq!(first.recv().await, None);
      assert_eq!(second.recv().await, Some(StreamItem::Event(scan_result("x"))));
   }

   #[test]
   fn test_dropped_subscriber_goes_inactive() {
      let mut stream = EventStream::new(StreamKind::ScanResults);
      drop(stream.attach());
      assert_eq!(stream.state(), StreamState::Inactive);
      stream.emit(scan_result("x"));
      assert_eq!(stream.state(), StreamState::Inactive);
   }

   #[tokio::test]
   async fn test_sink_signals_are_epoch_checked() {
      let (tx, mut rx) = mpsc::channel(8);
      let mut streams = EventStreams::default();
      let mut sub = streams.get_mut(StreamKind::ScanResults).attach();

      let sink = EventSink::new(StreamKind::ScanResults, 1, 0, tx);
      sink.emit(scan_result("before"));
      // Wrong category never leaves the sink
      sink.emit(BridgeEvent::AdapterState(PowerState::PoweredOn));

      streams.deliver(rx.recv().await.unwrap());
      assert_eq!(sub.try_recv(), Some(StreamItem::Event(scan_result("before"))));
      assert!(rx.try_recv().is_err());

      streams.get_mut(StreamKind::ScanResults).complete();
      let mut sub = streams.get_mut(StreamKind::ScanResults).attach();
      sink.emit(scan_result("stale"));
      streams.deliver(rx.recv().await.unwrap());
      assert_eq!(sub.try_recv(), None);
   }

   #[test]
   fn test_stream_names() {
      let names: Vec<String> = StreamKind::iter().map(|k| k.to_string()).collect();
      assert_eq!(
         names,
         [
            "adapter-power-state",
            "state-restoration",
            "scan-results",
            "connection-state",
            "characteristic-notifications",
         ]
      );
      let streams = EventStreams::default();
      for kind in StreamKind::iter() {
         assert_eq!(streams.get(kind).kind(), kind);
      }
   }
}
