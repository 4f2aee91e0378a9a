//! Fake collaborators for unit tests.
//!
//! Tests drive the managers with a paused tokio clock: [`run_until_idle`]
//! returns once every spawned task is blocked, which makes command and event
//! ordering deterministic.

use std::{
   collections::{HashMap, VecDeque},
   sync::Arc,
   time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
   sync::{mpsc, oneshot},
   time,
};
use uuid::Uuid;

use crate::{
   address::{AddressType, BdAddr, DeviceAddress},
   bearer::{Gatt, L2cap},
   error::{GapError, Result},
   hci::{
      Command, CommandTransaction, ConnectionHandle, Event, EventCode, EventHandlerId, EventStream,
      LeConnectionParameters, LePreferredConnectionParameters, OpCode, Transport,
   },
   le::{LeLink, LinkRole, LowEnergyConnector},
   peer::PeerId,
   sm::{BondableMode, PairingDelegate, SecurityLevel, SecurityManager, SharedPairingDelegate},
};

pub fn init_logging() {
   let _ = env_logger::builder().is_test(true).try_init();
}

/// Lets every runnable task make progress.
pub async fn run_until_idle() {
   time::sleep(Duration::from_millis(1)).await;
}

pub fn le_address(last: u8) -> DeviceAddress {
   DeviceAddress::new(AddressType::LePublic, BdAddr::new([0xC0, 0, 0, 0, 0, last]))
}

pub fn bredr_address(last: u8) -> BdAddr {
   BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
}

// === Transport ===

type Responder = Box<dyn Fn(&Command) -> Vec<Event> + Send>;

struct OpenTransaction {
   opcode: OpCode,
   complete_event: EventCode,
   tx: mpsc::UnboundedSender<Event>,
}

impl OpenTransaction {
   /// Delivers `event`, returning whether it ended the transaction.
   fn deliver(&self, event: Event) -> bool {
      let terminal = event.code() == self.complete_event || !event.status().is_success();
      let _ = self.tx.send(event);
      terminal
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
   pub command: Command,
   pub exclusions: Option<Vec<OpCode>>,
}

#[derive(Default)]
struct TransportState {
   sent: Vec<SentCommand>,
   open: VecDeque<OpenTransaction>,
   handlers: Vec<(EventHandlerId, EventCode, mpsc::UnboundedSender<Event>)>,
   next_handler: u64,
   responders: HashMap<OpCode, Responder>,
}

/// Records commands and lets tests play the controller.
#[derive(Default)]
pub struct FakeTransport {
   state: Mutex<TransportState>,
}

impl FakeTransport {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn sent(&self) -> Vec<SentCommand> {
      self.state.lock().sent.clone()
   }

   pub fn commands(&self, opcode: OpCode) -> Vec<Command> {
      self
         .state
         .lock()
         .sent
         .iter()
         .filter(|sent| sent.command.opcode() == opcode)
         .map(|sent| sent.command.clone())
         .collect()
   }

   pub fn count(&self, opcode: OpCode) -> usize {
      self.commands(opcode).len()
   }

   pub fn last_exclusions(&self, opcode: OpCode) -> Option<Vec<OpCode>> {
      self
         .state
         .lock()
         .sent
         .iter()
         .rev()
         .find(|sent| sent.command.opcode() == opcode)
         .and_then(|sent| sent.exclusions.clone())
   }

   pub fn open_transactions(&self, opcode: OpCode) -> usize {
      self
         .state
         .lock()
         .open
         .iter()
         .filter(|txn| txn.opcode == opcode)
         .count()
   }

   /// Answers the oldest open transaction for `opcode`.
   pub fn respond(&self, opcode: OpCode, events: impl IntoIterator<Item = Event>) -> bool {
      let mut state = self.state.lock();
      let Some(index) = state.open.iter().position(|txn| txn.opcode == opcode) else {
         return false;
      };
      for event in events {
         if state.open[index].deliver(event) {
            state.open.remove(index);
            break;
         }
      }
      true
   }

   /// Drops the oldest open transaction for `opcode` without completing it.
   pub fn close(&self, opcode: OpCode) -> bool {
      let mut state = self.state.lock();
      let Some(index) = state.open.iter().position(|txn| txn.opcode == opcode) else {
         return false;
      };
      state.open.remove(index);
      true
   }

   /// Answers every future command with `opcode` immediately.
   pub fn auto_respond<F>(&self, opcode: OpCode, responder: F)
   where
      F: Fn(&Command) -> Vec<Event> + Send + 'static,
   {
      self
         .state
         .lock()
         .responders
         .insert(opcode, Box::new(responder));
   }

   /// Delivers an unsolicited event to every handler registered for it.
   pub fn emit(&self, event: Event) {
      let state = self.state.lock();
      for (_, code, tx) in &state.handlers {
         if *code == event.code() {
            let _ = tx.send(event.clone());
         }
      }
   }

   pub fn handler_count(&self, code: EventCode) -> usize {
      self
         .state
         .lock()
         .handlers
         .iter()
         .filter(|(_, c, _)| *c == code)
         .count()
   }

   fn open(
      &self,
      command: Command,
      complete_event: EventCode,
      exclusions: Option<Vec<OpCode>>,
   ) -> CommandTransaction {
      let opcode = command.opcode();
      let (tx, rx) = mpsc::unbounded_channel();
      let txn = OpenTransaction {
         opcode,
         complete_event,
         tx,
      };

      let mut state = self.state.lock();
      let replies = state
         .responders
         .get(&opcode)
         .map(|responder| responder(&command));
      state.sent.push(SentCommand {
         command,
         exclusions,
      });

      let mut finished = false;
      for event in replies.into_iter().flatten() {
         if txn.deliver(event) {
            finished = true;
            break;
         }
      }
      if !finished {
         state.open.push_back(txn);
      }
      CommandTransaction::new(opcode, complete_event, rx)
   }
}

impl Transport for FakeTransport {
   fn send_command(&self, command: Command) -> Result<CommandTransaction> {
      let complete_event = command.completion_event();
      Ok(self.open(command, complete_event, None))
   }

   fn send_exclusive_command(
      &self,
      command: Command,
      complete_event: EventCode,
      exclusions: &[OpCode],
   ) -> Result<CommandTransaction> {
      Ok(self.open(command, complete_event, Some(exclusions.to_vec())))
   }

   fn add_event_handler(&self, code: EventCode) -> Result<(EventHandlerId, EventStream)> {
      let mut state = self.state.lock();
      state.next_handler += 1;
      let id = EventHandlerId(state.next_handler);
      let (tx, rx) = mpsc::unbounded_channel();
      state.handlers.push((id, code, tx));
      Ok((id, EventStream::new(rx)))
   }

   fn remove_event_handler(&self, id: EventHandlerId) {
      self
         .state
         .lock()
         .handlers
         .retain(|(handler, _, _)| *handler != id);
   }
}

// === Connector ===

#[derive(Default)]
struct ConnectorState {
   requests: Vec<DeviceAddress>,
   pending: VecDeque<(DeviceAddress, oneshot::Sender<Result<LeLink>>)>,
}

/// Connector whose attempts stay open until a test resolves them.
#[derive(Default)]
pub struct FakeConnector {
   state: Mutex<ConnectorState>,
}

impl FakeConnector {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn requests(&self) -> Vec<DeviceAddress> {
      self.state.lock().requests.clone()
   }

   /// Completes the oldest attempt with a central link on `handle`.
   pub fn succeed(&self, handle: u16) -> bool {
      let Some((address, tx)) = self.state.lock().pending.pop_front() else {
         return false;
      };
      tx.send(Ok(link(handle, LinkRole::Central, address))).is_ok()
   }

   pub fn fail(&self, error: GapError) -> bool {
      let Some((_, tx)) = self.state.lock().pending.pop_front() else {
         return false;
      };
      tx.send(Err(error)).is_ok()
   }
}

impl LowEnergyConnector for FakeConnector {
   fn connect(&self, address: DeviceAddress) -> BoxFuture<'static, Result<LeLink>> {
      let (tx, rx) = oneshot::channel();
      let mut state = self.state.lock();
      state.requests.push(address);
      state.pending.push_back((address, tx));
      Box::pin(async move {
         rx.await
            .unwrap_or_else(|_| Err(GapError::ConnectionFailed("connector dropped".into())))
      })
   }
}

pub fn link(handle: u16, role: LinkRole, peer_address: DeviceAddress) -> LeLink {
   LeLink {
      handle: ConnectionHandle(handle),
      role,
      peer_address,
      params: LeConnectionParameters {
         interval: 0x0018,
         latency: 0,
         supervision_timeout: 0x00C8,
      },
   }
}

// === Data plane ===

#[derive(Default)]
pub struct FakeL2cap {
   pub links: Mutex<Vec<(ConnectionHandle, LinkRole)>>,
   pub removed: Mutex<Vec<ConnectionHandle>>,
   pub param_requests: Mutex<Vec<(ConnectionHandle, LePreferredConnectionParameters)>>,
   pub accept_param_updates: Mutex<bool>,
}

impl FakeL2cap {
   pub fn new() -> Arc<Self> {
      let l2cap = Self::default();
      *l2cap.accept_param_updates.lock() = true;
      Arc::new(l2cap)
   }
}

impl L2cap for FakeL2cap {
   fn add_le_link(&self, handle: ConnectionHandle, role: LinkRole) {
      self.links.lock().push((handle, role));
   }

   fn remove_link(&self, handle: ConnectionHandle) {
      self.removed.lock().push(handle);
   }

   fn request_connection_parameter_update(
      &self,
      handle: ConnectionHandle,
      params: LePreferredConnectionParameters,
   ) -> BoxFuture<'static, bool> {
      self.param_requests.lock().push((handle, params));
      let accepted = *self.accept_param_updates.lock();
      Box::pin(async move { accepted })
   }
}

#[derive(Default)]
pub struct FakeGatt {
   pub connections: Mutex<Vec<PeerId>>,
   pub removed: Mutex<Vec<PeerId>>,
   pub discoveries: Mutex<Vec<(PeerId, Option<Uuid>)>>,
}

impl FakeGatt {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }
}

impl Gatt for FakeGatt {
   fn add_connection(&self, peer_id: PeerId, _handle: ConnectionHandle) {
      self.connections.lock().push(peer_id);
   }

   fn remove_connection(&self, peer_id: PeerId) {
      self.removed.lock().push(peer_id);
   }

   fn discover_services(&self, peer_id: PeerId, service_uuid: Option<Uuid>) {
      self.discoveries.lock().push((peer_id, service_uuid));
   }
}

// === Security ===

type PairingReply = oneshot::Sender<Result<SecurityLevel>>;

/// Security manager whose pairing procedures wait for the test.
#[derive(Default)]
pub struct FakeSecurityManager {
   pending: Mutex<VecDeque<(PeerId, SecurityLevel, PairingReply)>>,
   requests: Mutex<Vec<(PeerId, SecurityLevel, BondableMode)>>,
}

impl FakeSecurityManager {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn requests(&self) -> Vec<(PeerId, SecurityLevel, BondableMode)> {
      self.requests.lock().clone()
   }

   /// Finishes the oldest pairing at the level it asked for.
   pub fn complete(&self) -> bool {
      let Some((_, level, tx)) = self.pending.lock().pop_front() else {
         return false;
      };
      tx.send(Ok(level)).is_ok()
   }
}

impl SecurityManager for FakeSecurityManager {
   fn upgrade_security(
      &self,
      peer_id: PeerId,
      _handle: ConnectionHandle,
      level: SecurityLevel,
      bondable_mode: BondableMode,
      _delegate: SharedPairingDelegate,
   ) -> BoxFuture<'static, Result<SecurityLevel>> {
      let (tx, rx) = oneshot::channel();
      self.requests.lock().push((peer_id, level, bondable_mode));
      self.pending.lock().push_back((peer_id, level, tx));
      Box::pin(async move { rx.await.unwrap_or(Err(GapError::PairingCanceled)) })
   }
}

#[derive(Default)]
pub struct RecordingDelegate {
   pub completed: Mutex<Vec<(PeerId, Result<SecurityLevel>)>>,
}

impl RecordingDelegate {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }
}

impl PairingDelegate for RecordingDelegate {
   fn confirm_pairing(&self, _peer_id: PeerId) -> BoxFuture<'static, bool> {
      Box::pin(async { true })
   }

   fn display_passkey(&self, _peer_id: PeerId, _passkey: u32) {}

   fn complete_pairing(&self, peer_id: PeerId, result: &Result<SecurityLevel>) {
      self.completed.lock().push((peer_id, result.clone()));
   }
}
