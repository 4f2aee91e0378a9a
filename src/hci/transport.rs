//! Command channel abstraction.
//!
//! The transport frames commands, correlates controller events with the
//! command that caused them and delivers unsolicited events to registered
//! handlers. Every command gets its own [`CommandTransaction`], a stream of
//! the events belonging to it that closes after the terminating event.

use std::{
   pin::Pin,
   sync::Arc,
   task::{Context, Poll},
};

use futures::{
   Stream, StreamExt,
   stream::{self, BoxStream},
};
use log::trace;
use tokio::sync::mpsc;

use super::protocol::{Command, Event, EventCode, OpCode};
use crate::error::{GapError, Result};

/// Identifies a registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandlerId(pub u64);

/// Events belonging to a single command.
#[derive(Debug)]
pub struct CommandTransaction {
   opcode: OpCode,
   complete_event: EventCode,
   terminated: bool,
   events: mpsc::UnboundedReceiver<Event>,
}

impl CommandTransaction {
   pub fn new(
      opcode: OpCode,
      complete_event: EventCode,
      events: mpsc::UnboundedReceiver<Event>,
   ) -> Self {
      Self {
         opcode,
         complete_event,
         terminated: false,
         events,
      }
   }

   pub const fn opcode(&self) -> OpCode {
      self.opcode
   }

   /// Whether the completion event or an error status has been received.
   pub const fn is_terminated(&self) -> bool {
      self.terminated
   }

   /// Next event of the transaction, `None` once the transport closed it.
   pub async fn next(&mut self) -> Option<Event> {
      let event = self.events.recv().await?;
      if event.code() == self.complete_event || !event.status().is_success() {
         self.terminated = true;
      }
      Some(event)
   }

   /// Waits for the event with `code`, failing on the first error status.
   pub async fn complete(mut self, code: EventCode) -> Result<Event> {
      while let Some(event) = self.next().await {
         event.status().to_result()?;
         if event.code() == code {
            return Ok(event);
         }
         trace!("{}: intermediate {} event", self.opcode, event.code());
      }
      Err(GapError::TransportClosed)
   }
}

/// Unsolicited events for one registered handler.
#[derive(Debug)]
pub struct EventStream {
   rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
   pub fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
      Self { rx }
   }

   pub async fn recv(&mut self) -> Option<Event> {
      self.rx.recv().await
   }
}

impl Stream for EventStream {
   type Item = Event;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
      self.rx.poll_recv(cx)
   }
}

/// Host-to-controller command channel consumed by the GAP managers.
pub trait Transport: Send + Sync {
   /// Sends a command; its transaction ends with [`Command::completion_event`].
   fn send_command(&self, command: Command) -> Result<CommandTransaction>;

   /// Sends a command that must not run while any command in `exclusions` is
   /// outstanding. The transaction ends with `complete_event`.
   fn send_exclusive_command(
      &self,
      command: Command,
      complete_event: EventCode,
      exclusions: &[OpCode],
   ) -> Result<CommandTransaction>;

   fn add_event_handler(&self, code: EventCode) -> Result<(EventHandlerId, EventStream)>;

   fn remove_event_handler(&self, id: EventHandlerId);
}

/// Type alias for a shared transport.
pub type SharedTransport = Arc<dyn Transport>;

/// Maps the events of `txn` into actor messages.
///
/// The stream ends after the terminating event. If the transport drops the
/// transaction before that, `closed` is yielded as the final item.
pub(crate) fn relay_transaction<M, F>(
   txn: CommandTransaction,
   wrap: F,
   closed: M,
) -> BoxStream<'static, M>
where
   M: Send + 'static,
   F: Fn(Event) -> M + Send + 'static,
{
   stream::unfold(Some((txn, wrap, closed)), |state| async move {
      let Some((mut txn, wrap, closed)) = state else {
         return None;
      };
      match txn.next().await {
         Some(event) => {
            let message = wrap(event);
            let rest = (!txn.is_terminated()).then_some((txn, wrap, closed));
            Some((message, rest))
         },
         None => {
            trace!("{}: transaction closed before completing", txn.opcode());
            Some((closed, None))
         },
      }
   })
   .boxed()
}

/// Maps unsolicited events from a handler into actor messages.
pub(crate) fn relay_events<M, F>(stream: EventStream, wrap: F) -> BoxStream<'static, M>
where
   M: Send + 'static,
   F: Fn(Event) -> M + Send + 'static,
{
   stream.map(wrap).boxed()
}
