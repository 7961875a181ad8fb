//! Line-oriented JSON host for the bridge.
//!
//! Each input line is a request `{"id": .., "method": .., "arguments": {..}}`.
//! Output lines are either a reply `{"id": .., "reply": {..}}`, a stream item
//! `{"stream": .., "item": {..}}`, a completion `{"stream": .., "completed":
//! true}` or a rejected line `{"id": null, "error": ".."}`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::IntoEnumIterator;
use tokio::{
   io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
   sync::mpsc,
   task::{JoinHandle, JoinSet},
};

use crate::{
   bridge::Bridge,
   command::{MethodCall, Reply},
   error::{BridgeError, Result},
   event::{StreamItem, StreamKind},
};

/// One parsed input line.
#[derive(Debug, Deserialize)]
pub struct Request {
   #[serde(default)]
   pub id: Value,
   #[serde(flatten)]
   pub call: MethodCall,
}

impl Request {
   pub fn parse(line: &str) -> Result<Self> {
      let request: Self = serde_json::from_str(line)?;
      if request.call.method.trim().is_empty() {
         return Err(BridgeError::InvalidArgument("method must not be empty".into()));
      }
      Ok(request)
   }
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Output {
   Reply { id: Value, reply: Reply },
   Item { stream: StreamKind, item: StreamItem },
   Completed { stream: StreamKind, completed: bool },
   Rejected { id: Value, error: String },
}

/// Serves requests from `input` until it ends, writing every reply and
/// stream item to `output`. Returns the writer once all replies are out.
pub async fn serve<R, W>(bridge: Bridge, input: R, output: W) -> Result<W>
where
   R: AsyncBufRead + Unpin,
   W: AsyncWrite + Unpin + Send + 'static,
{
   let (out_tx, out_rx) = mpsc::unbounded_channel();
   let writer = tokio::spawn(write_lines(output, out_rx));
   let forwarders: Vec<JoinHandle<()>> = StreamKind::iter()
      .map(|kind| tokio::spawn(forward(bridge.clone(), kind, out_tx.clone())))
      .collect();

   let served = read_requests(&bridge, input, &out_tx).await;

   for forwarder in forwarders {
      forwarder.abort();
   }
   drop(out_tx);
   let output = writer.await.map_err(|_| BridgeError::BridgeShutdown)??;
   served.map(|()| output)
}

async fn read_requests<R>(
   bridge: &Bridge,
   input: R,
   out: &mpsc::UnboundedSender<Output>,
) -> Result<()>
where
   R: AsyncBufRead + Unpin,
{
   let mut lines = input.lines();
   let mut pending = JoinSet::new();

   while let Some(line) = lines.next_line().await? {
      let line = line.trim();
      if line.is_empty() {
         continue;
      }
      let Request { id, call } = match Request::parse(line) {
         Ok(request) => request,
         Err(e) => {
            warn!("Rejected input line: {e}");
            let _ = out.send(Output::Rejected {
               id: Value::Null,
               error: e.to_string(),
            });
            continue;
         },
      };

      debug!("Request {id}: {}", call.method);
      let reply = bridge.submit(call).await?;
      let out = out.clone();
      pending.spawn(async move {
         let reply = reply.wait().await;
         let _ = out.send(Output::Reply { id, reply });
      });
   }

   while pending.join_next().await.is_some() {}
   Ok(())
}

/// Keeps one stream subscribed, re-attaching after every completion.
async fn forward(bridge: Bridge, kind: StreamKind, out: mpsc::UnboundedSender<Output>) {
   while let Ok(mut subscription) = bridge.attach(kind).await {
      while let Some(item) = subscription.recv().await {
         if out.send(Output::Item { stream: kind, item }).is_err() {
            return;
         }
      }
      if out
         .send(Output::Completed {
            stream: kind,
            completed: true,
         })
         .is_err()
      {
         return;
      }
   }
}

async fn write_lines<W>(mut output: W, mut lines: mpsc::UnboundedReceiver<Output>) -> Result<W>
where
   W: AsyncWrite + Unpin,
{
   while let Some(line) = lines.recv().await {
      let mut text = serde_json::to_string(&line)?;
      text.push('\n');
      output.write_all(text.as_bytes()).await?;
      output.flush().await?;
   }
   Ok(output)
}
