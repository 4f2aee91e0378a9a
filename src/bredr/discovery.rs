//! BR/EDR discovery and discoverability.
//!
//! A single actor owns the inquiry procedure, the inquiry-scan setting and
//! every session handed out to clients. Concurrent requests are coalesced
//! onto one in-flight procedure and resolved together once the controller
//! confirms it. Sessions report their release back through the actor's
//! loopback queue; a release that arrives after its entry is gone is
//! ignored.

use std::mem;

use futures::{
   StreamExt,
   stream::{BoxStream, SelectAll},
};
use log::{debug, info, trace, warn};
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use super::eir;
use crate::{
   address::DeviceAddress,
   config::BrEdrConfig,
   error::{GapError, Result},
   handle::{Handle, Registry},
   hci::{
      Command, CommandTransaction, EXTENDED_INQUIRY_RESPONSE_BYTES, Event, EventCode,
      EventHandlerId, GIAC, InquiryMode, MAX_NAME_LENGTH, OpCode, ReturnParams, SharedTransport,
      Transport,
      transport::{relay_events, relay_transaction},
   },
   peer::{Peer, PeerCache, PeerId},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Marks the clock offset of a remote name request as valid.
const CLOCK_OFFSET_VALID: u16 = 0x8000;

// === Sessions ===

/// Notification delivered to a discovery session.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
   PeerFound(Peer),
   /// The session was invalidated and will receive nothing further.
   Error(GapError),
}

/// Registered interest in inquiry results.
///
/// Dropping the session, or calling [`release`](Self::release), removes the
/// registration.
#[derive(Debug)]
pub struct BrEdrDiscoverySession {
   handle: Handle,
   events: mpsc::UnboundedReceiver<DiscoveryEvent>,
   manager: mpsc::WeakUnboundedSender<ManagerCommand>,
   released: bool,
}

impl BrEdrDiscoverySession {
   /// Next discovery notification, `None` once the session is invalidated.
   pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
      self.events.recv().await
   }

   pub fn try_next_event(&mut self) -> Option<DiscoveryEvent> {
      self.events.try_recv().ok()
   }

   pub fn release(mut self) {
      self.unregister();
   }

   fn unregister(&mut self) {
      if mem::replace(&mut self.released, true) {
         return;
      }
      if let Some(manager) = self.manager.upgrade() {
         let _ = manager.send(ManagerCommand::RemoveDiscoverySession(self.handle));
      }
   }
}

impl Drop for BrEdrDiscoverySession {
   fn drop(&mut self) {
      self.unregister();
   }
}

/// Keeps inquiry scan enabled while alive.
#[derive(Debug)]
pub struct BrEdrDiscoverableSession {
   handle: Handle,
   manager: mpsc::WeakUnboundedSender<ManagerCommand>,
   released: bool,
}

impl BrEdrDiscoverableSession {
   pub fn release(mut self) {
      self.unregister();
   }

   fn unregister(&mut self) {
      if mem::replace(&mut self.released, true) {
         return;
      }
      if let Some(manager) = self.manager.upgrade() {
         let _ = manager.send(ManagerCommand::RemoveDiscoverableSession(self.handle));
      }
   }
}

impl Drop for BrEdrDiscoverableSession {
   fn drop(&mut self) {
      self.unregister();
   }
}

// === State ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum InquiryState {
   Idle,
   Starting,
   Discovering,
   Restarting,
   Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanProcedure {
   Idle,
   Reading,
   Writing,
}

/// Snapshot of the manager's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryStatus {
   pub inquiry: InquiryState,
   pub discovering: bool,
   pub discoverable: bool,
   pub local_name: Option<SmolStr>,
}

/// Command whose events are being awaited.
#[derive(Debug, Clone, Copy)]
enum Procedure {
   ScanSettings(OpCode),
   WriteInquiryMode(InquiryMode),
   Inquiry,
   InquiryCancel,
   RemoteName(PeerId),
   ReadScanEnable,
   WriteScanEnable,
}

// === Commands ===

type DiscoveryReply = oneshot::Sender<Result<BrEdrDiscoverySession>>;
type DiscoverableReply = oneshot::Sender<Result<BrEdrDiscoverableSession>>;

#[derive(Debug)]
enum ManagerCommand {
   // Client requests
   RequestDiscovery(DiscoveryReply),
   RequestDiscoverable(DiscoverableReply),
   UpdateLocalName(SmolStr, oneshot::Sender<Result<()>>),
   SetInquiryMode(InquiryMode),
   GetStatus(oneshot::Sender<DiscoveryStatus>),

   // Session releases
   RemoveDiscoverySession(Handle),
   RemoveDiscoverableSession(Handle),

   // Controller traffic
   Transaction(Procedure, Event),
   TransactionClosed(Procedure),
   InquiryResult(Event),
   LocalNameWritten {
      name: SmolStr,
      result: Result<()>,
      reply: oneshot::Sender<Result<()>>,
   },
}

/// Controller traffic polled by the actor, in arrival order.
type Relay = BoxStream<'static, ManagerCommand>;

// === Main Manager ===

/// Handle to the BR/EDR discovery actor.
///
/// Dropping it shuts the actor down: event handlers are removed, a running
/// inquiry is canceled and every discovery session is invalidated.
pub struct BrEdrDiscoveryManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BrEdrDiscoveryManager {
   pub fn new(transport: SharedTransport, cache: PeerCache, config: BrEdrConfig) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = DiscoveryActor::new(transport, cache, config, command_rx)?;
      tokio::spawn(actor.run());
      Ok(Self { inbox: command_tx })
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| GapError::ManagerShutdown)?;
      rx.await.map_err(|_| GapError::ManagerShutdown)
   }

   /// Starts (or joins) inquiry and returns a session receiving results.
   pub async fn request_discovery(&self) -> Result<BrEdrDiscoverySession> {
      self.request(ManagerCommand::RequestDiscovery).await?
   }

   /// Makes the adapter discoverable for as long as the session lives.
   pub async fn request_discoverable(&self) -> Result<BrEdrDiscoverableSession> {
      self.request(ManagerCommand::RequestDiscoverable).await?
   }

   /// Writes the local name, then the matching EIR data.
   pub async fn update_local_name(&self, name: impl Into<SmolStr>) -> Result<()> {
      let name = name.into();
      self
         .request(|tx| ManagerCommand::UpdateLocalName(name, tx))
         .await?
   }

   /// Sets the inquiry mode used from the next inquiry start on.
   pub async fn set_inquiry_mode(&self, mode: InquiryMode) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::SetInquiryMode(mode))
         .await
         .map_err(|_| GapError::ManagerShutdown)
   }

   pub async fn status(&self) -> Result<DiscoveryStatus> {
      self.request(ManagerCommand::GetStatus).await
   }

   pub async fn discovering(&self) -> bool {
      self.status().await.is_ok_and(|status| status.discovering)
   }

   pub async fn discoverable(&self) -> bool {
      self.status().await.is_ok_and(|status| status.discoverable)
   }

   pub async fn local_name(&self) -> Option<SmolStr> {
      self.status().await.ok().and_then(|status| status.local_name)
   }
}

// === Manager Actor ===

struct DiscoveryActor {
   transport: SharedTransport,
   cache: PeerCache,
   config: BrEdrConfig,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::UnboundedReceiver<ManagerCommand>,
   loopback_tx: mpsc::UnboundedSender<ManagerCommand>,
   relays: SelectAll<Relay>,
   event_handlers: Vec<EventHandlerId>,

   // Inquiry
   inquiry_state: InquiryState,
   desired_inquiry_mode: InquiryMode,
   current_inquiry_mode: InquiryMode,
   discovering: Registry<mpsc::UnboundedSender<DiscoveryEvent>>,
   zombie_discovering: Vec<Handle>,
   pending_discovery: Vec<DiscoveryReply>,
   requesting_names: std::collections::HashSet<PeerId>,

   // Inquiry scan
   discoverable: Registry<()>,
   pending_discoverable: Vec<DiscoverableReply>,
   scan_procedure: ScanProcedure,
   scan_rerun: bool,

   local_name: Option<SmolStr>,
}

impl DiscoveryActor {
   fn new(
      transport: SharedTransport,
      cache: PeerCache,
      config: BrEdrConfig,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Result<Self> {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();

      let mut event_handlers = Vec::new();
      let mut relays = SelectAll::new();
      for code in [
         EventCode::InquiryResult,
         EventCode::InquiryResultWithRssi,
         EventCode::ExtendedInquiryResult,
      ] {
         let (id, stream) = transport.add_event_handler(code)?;
         event_handlers.push(id);
         relays.push(relay_events(stream, ManagerCommand::InquiryResult));
      }

      let mut actor = Self {
         desired_inquiry_mode: config.inquiry_mode,
         transport,
         cache,
         config,
         command_rx,
         loopback_rx,
         loopback_tx,
         relays,
         event_handlers,
         inquiry_state: InquiryState::Idle,
         current_inquiry_mode: InquiryMode::Standard,
         discovering: Registry::new(),
         zombie_discovering: Vec::new(),
         pending_discovery: Vec::new(),
         requesting_names: Default::default(),
         discoverable: Registry::new(),
         pending_discoverable: Vec::new(),
         scan_procedure: ScanProcedure::Idle,
         scan_rerun: false,
         local_name: None,
      };
      actor.write_inquiry_scan_settings();
      Ok(actor)
   }

   async fn run(mut self) {
      info!("BR/EDR discovery manager starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("BR/EDR discovery manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            }
            Some(cmd) = self.relays.next(), if !self.relays.is_empty() => {
               self.handle_command(cmd);
            }
         }
      }

      self.cleanup();
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::RequestDiscovery(reply) => self.request_discovery(reply),
         ManagerCommand::RequestDiscoverable(reply) => self.request_discoverable(reply),
         ManagerCommand::UpdateLocalName(name, reply) => self.update_local_name(name, reply),
         ManagerCommand::SetInquiryMode(mode) => {
            debug!("Inquiry mode set to {mode}");
            self.desired_inquiry_mode = mode;
         },
         ManagerCommand::GetStatus(reply) => {
            let _ = reply.send(DiscoveryStatus {
               inquiry: self.inquiry_state,
               discovering: !self.discovering.is_empty(),
               discoverable: !self.discoverable.is_empty(),
               local_name: self.local_name.clone(),
            });
         },
         ManagerCommand::RemoveDiscoverySession(handle) => self.remove_discovery_session(handle),
         ManagerCommand::RemoveDiscoverableSession(handle) => {
            self.remove_discoverable_session(handle);
         },
         ManagerCommand::Transaction(procedure, event) => self.handle_transaction(procedure, event),
         ManagerCommand::TransactionClosed(procedure) => self.handle_transaction_closed(procedure),
         ManagerCommand::InquiryResult(event) => self.handle_inquiry_result(event),
         ManagerCommand::LocalNameWritten {
            name,
            result,
            reply,
         } => {
            if result.is_ok() {
               info!("Local name set to {name:?}");
               self.local_name = Some(name);
            }
            let _ = reply.send(result);
         },
      }
   }

   fn send(&mut self, command: Command, procedure: Procedure) -> Result<()> {
      let txn = self.transport.send_command(command)?;
      self.watch(txn, procedure);
      Ok(())
   }

   fn watch(&mut self, txn: CommandTransaction, procedure: Procedure) {
      self.relays.push(relay_transaction(
         txn,
         move |event| ManagerCommand::Transaction(procedure, event),
         ManagerCommand::TransactionClosed(procedure),
      ));
   }

   fn handle_transaction(&mut self, procedure: Procedure, event: Event) {
      match procedure {
         Procedure::ScanSettings(opcode) => {
            let status = event.status();
            if !status.is_success() {
               warn!("Inquiry scan setting {opcode} failed: {status}");
            }
         },
         Procedure::WriteInquiryMode(mode) => {
            let status = event.status();
            if status.is_success() {
               self.current_inquiry_mode = mode;
            } else {
               warn!("Write inquiry mode {mode} failed: {status}");
            }
         },
         Procedure::Inquiry => self.handle_inquiry_event(event),
         Procedure::InquiryCancel => {
            let status = event.status();
            if !status.is_success() {
               warn!("Inquiry cancel failed: {status}");
            }
         },
         Procedure::RemoteName(id) => self.handle_remote_name_event(id, event),
         Procedure::ReadScanEnable => self.handle_read_scan_enable(event),
         Procedure::WriteScanEnable => {
            let status = event.status();
            if !status.is_success() {
               warn!("Write scan enable failed: {status}");
            }
            self.finish_scan_procedure(status.to_result());
         },
      }
   }

   /// The transport dropped a transaction before its terminating event.
   fn handle_transaction_closed(&mut self, procedure: Procedure) {
      warn!("{procedure:?} closed without completing");
      match procedure {
         Procedure::Inquiry => {
            let error = GapError::TransportClosed;
            self.fail_inquiry(&error);
            self.resolve_pending_discovery(&Err(error));
         },
         Procedure::RemoteName(id) => {
            self.requesting_names.remove(&id);
         },
         Procedure::ReadScanEnable | Procedure::WriteScanEnable => {
            self.finish_scan_procedure(Err(GapError::TransportClosed));
         },
         Procedure::ScanSettings(_) | Procedure::WriteInquiryMode(_) | Procedure::InquiryCancel => {},
      }
   }

   fn set_inquiry_state(&mut self, state: InquiryState) {
      if self.inquiry_state != state {
         debug!("Inquiry {} -> {state}", self.inquiry_state);
         self.inquiry_state = state;
      }
   }

   fn write_inquiry_scan_settings(&mut self) {
      let commands = [
         Command::WriteInquiryScanActivity {
            interval: self.config.inquiry_scan_interval,
            window: self.config.inquiry_scan_window,
         },
         Command::WriteInquiryScanType(self.config.inquiry_scan_type()),
      ];
      for command in commands {
         let opcode = command.opcode();
         if let Err(e) = self.send(command, Procedure::ScanSettings(opcode)) {
            warn!("Could not send inquiry scan setting {opcode}: {e}");
         }
      }
   }

   // === Discovery ===

   fn request_discovery(&mut self, reply: DiscoveryReply) {
      if !self.pending_discovery.is_empty() {
         trace!("Discovery start pending, queueing request");
         self.pending_discovery.push(reply);
         return;
      }

      if !self.discovering.is_empty() || !self.zombie_discovering.is_empty() {
         let session = self.add_discovery_session();
         let _ = reply.send(Ok(session));
         return;
      }

      self.pending_discovery.push(reply);
      self.maybe_start_inquiry();
   }

   fn add_discovery_session(&mut self) -> BrEdrDiscoverySession {
      let (tx, rx) = mpsc::unbounded_channel();
      let handle = self.discovering.insert(tx);
      debug!("Discovery session {handle} added");
      BrEdrDiscoverySession {
         handle,
         events: rx,
         manager: self.loopback_tx.downgrade(),
         released: false,
      }
   }

   fn remove_discovery_session(&mut self, handle: Handle) {
      if self.discovering.remove(handle).is_none() {
         trace!("Discovery session {handle} already gone");
         return;
      }
      debug!("Discovery session {handle} removed");
      // Inquiry keeps running until it completes; the handle drains until then.
      if self.inquiry_state != InquiryState::Idle {
         self.zombie_discovering.push(handle);
      }
   }

   fn invalidate_discovery_sessions(&mut self, error: &GapError) {
      for session in self.discovering.drain() {
         let _ = session.send(DiscoveryEvent::Error(error.clone()));
      }
   }

   fn resolve_pending_discovery(&mut self, result: &Result<()>) {
      for reply in mem::take(&mut self.pending_discovery) {
         let _ = reply.send(result.clone().map(|()| self.add_discovery_session()));
      }
   }

   fn maybe_start_inquiry(&mut self) {
      if self.pending_discovery.is_empty() && self.discovering.is_empty() {
         debug!("No sessions left, not starting inquiry");
         return;
      }

      if self.desired_inquiry_mode != self.current_inquiry_mode {
         let mode = self.desired_inquiry_mode;
         if let Err(e) = self.send(Command::WriteInquiryMode(mode), Procedure::WriteInquiryMode(mode)) {
            warn!("Could not write inquiry mode {mode}: {e}");
         }
      }

      let command = Command::Inquiry {
         lap: GIAC,
         inquiry_length: self.config.inquiry_length,
         num_responses: 0,
      };
      let txn = self.transport.send_exclusive_command(
         command,
         EventCode::InquiryComplete,
         &[OpCode::REMOTE_NAME_REQUEST],
      );
      match txn {
         Ok(txn) => {
            let next = if self.inquiry_state == InquiryState::Idle {
               InquiryState::Starting
            } else {
               InquiryState::Restarting
            };
            self.set_inquiry_state(next);
            self.watch(txn, Procedure::Inquiry);
         },
         Err(e) => {
            warn!("Could not start inquiry: {e}");
            self.fail_inquiry(&e);
            self.resolve_pending_discovery(&Err(e));
         },
      }
   }

   fn fail_inquiry(&mut self, error: &GapError) {
      self.invalidate_discovery_sessions(error);
      self.zombie_discovering.clear();
      self.set_inquiry_state(InquiryState::Idle);
   }

   fn handle_inquiry_event(&mut self, event: Event) {
      let status = event.status();
      if !status.is_success() {
         warn!("Inquiry failed: {status}");
         self.fail_inquiry(&GapError::Hci(status));
      }

      match event {
         Event::CommandStatus { .. } | Event::CommandComplete { .. } => {
            if status.is_success() {
               self.set_inquiry_state(InquiryState::Discovering);
            }
            self.resolve_pending_discovery(&status.to_result());
         },
         Event::InquiryComplete { .. } => {
            self.zombie_discovering.clear();
            if !status.is_success() {
               return;
            }
            debug!("Inquiry complete");
            if self.pending_discovery.is_empty() && self.discovering.is_empty() {
               self.set_inquiry_state(InquiryState::Idle);
            } else {
               // The controller ends inquiry after a fixed length; renew it.
               self.maybe_start_inquiry();
            }
         },
         other => trace!("Ignoring {} during inquiry", other.code()),
      }
   }

   fn stop_inquiry(&mut self) {
      self.set_inquiry_state(InquiryState::Stopping);
      if let Err(e) = self.send(Command::InquiryCancel, Procedure::InquiryCancel) {
         warn!("Could not cancel inquiry: {e}");
      }
   }

   // === Inquiry results ===

   fn handle_inquiry_result(&mut self, event: Event) {
      let responses = match event {
         Event::InquiryResult(responses) | Event::InquiryResultWithRssi(responses) => responses,
         Event::ExtendedInquiryResult(response) => {
            if response
               .eir
               .as_ref()
               .is_some_and(|eir| eir.len() > EXTENDED_INQUIRY_RESPONSE_BYTES)
            {
               warn!("Ignoring malformed extended inquiry result from {}", response.address);
               return;
            }
            vec![response]
         },
         other => {
            trace!("Unexpected {} on inquiry result handler", other.code());
            return;
         },
      };

      let mut updated: SmallVec<[PeerId; 4]> = SmallVec::new();
      for response in &responses {
         let peer = self
            .cache
            .find_or_create(DeviceAddress::bredr(response.address), true);
         self.cache.update(peer.id, |peer| {
            peer.set_inquiry_data(response);
            if let Some(name) = response.eir.as_deref().and_then(eir::parse_local_name) {
               peer.set_name(name);
            }
         });
         if !updated.contains(&peer.id) {
            updated.push(peer.id);
         }
      }

      for id in updated {
         let Some(peer) = self.cache.find_by_id(id) else {
            continue;
         };
         if peer.name.is_none() {
            self.request_peer_name(&peer);
         }
         for session in self.discovering.values() {
            let _ = session.send(DiscoveryEvent::PeerFound(peer.clone()));
         }
      }
   }

   fn request_peer_name(&mut self, peer: &Peer) {
      if self.requesting_names.contains(&peer.id) {
         trace!("Already requesting name for {}", peer.id);
         return;
      }
      let Some(bredr) = &peer.bredr else {
         return;
      };

      let clock_offset = if bredr.clock_offset != 0 {
         bredr.clock_offset | CLOCK_OFFSET_VALID
      } else {
         0
      };
      let command = Command::RemoteNameRequest {
         address: peer.address.value,
         page_scan_repetition_mode: bredr.page_scan_repetition_mode,
         clock_offset,
      };
      match self.transport.send_exclusive_command(
         command,
         EventCode::RemoteNameRequestComplete,
         &[OpCode::INQUIRY],
      ) {
         Ok(txn) => {
            self.requesting_names.insert(peer.id);
            self.watch(txn, Procedure::RemoteName(peer.id));
         },
         Err(e) => warn!("Could not request name of {}: {e}", peer.id),
      }
   }

   fn handle_remote_name_event(&mut self, id: PeerId, event: Event) {
      let status = event.status();
      if !status.is_success() {
         warn!("Remote name request for {id} failed: {status}");
         self.requesting_names.remove(&id);
         return;
      }

      match event {
         Event::CommandStatus { .. } => {},
         Event::RemoteNameRequestComplete { name, .. } => {
            self.requesting_names.remove(&id);
            self.cache.update(id, |peer| peer.set_name(&name));
            debug!("Resolved name of {id}");
         },
         other => trace!("Ignoring {} for name request", other.code()),
      }
   }

   // === Discoverability ===

   fn request_discoverable(&mut self, reply: DiscoverableReply) {
      if !self.pending_discoverable.is_empty() {
         self.pending_discoverable.push(reply);
         return;
      }

      if !self.discoverable.is_empty() {
         let session = self.add_discoverable_session();
         let _ = reply.send(Ok(session));
         return;
      }

      self.pending_discoverable.push(reply);
      self.set_inquiry_scan();
   }

   fn add_discoverable_session(&mut self) -> BrEdrDiscoverableSession {
      let handle = self.discoverable.insert(());
      debug!("Discoverable session {handle} added");
      BrEdrDiscoverableSession {
         handle,
         manager: self.loopback_tx.downgrade(),
         released: false,
      }
   }

   fn remove_discoverable_session(&mut self, handle: Handle) {
      if self.discoverable.remove(handle).is_none() {
         trace!("Discoverable session {handle} already gone");
         return;
      }
      debug!("Discoverable session {handle} removed");
      if self.discoverable.is_empty() {
         self.set_inquiry_scan();
      }
   }

   fn inquiry_scan_desired(&self) -> bool {
      !self.discoverable.is_empty() || !self.pending_discoverable.is_empty()
   }

   /// Reconciles the controller's inquiry scan bit with the session count.
   fn set_inquiry_scan(&mut self) {
      if self.scan_procedure != ScanProcedure::Idle {
         trace!("Scan enable procedure in flight, deferring");
         self.scan_rerun = true;
         return;
      }

      match self.send(Command::ReadScanEnable, Procedure::ReadScanEnable) {
         Ok(()) => self.scan_procedure = ScanProcedure::Reading,
         Err(e) => {
            warn!("Could not read scan enable: {e}");
            self.resolve_pending_discoverable(Err(e));
         },
      }
   }

   fn handle_read_scan_enable(&mut self, event: Event) {
      let status = event.status();
      if !status.is_success() {
         warn!("Read scan enable failed: {status}");
         self.finish_scan_procedure(Err(GapError::Hci(status)));
         return;
      }
      let Event::CommandComplete {
         params: ReturnParams::ScanEnable(scan),
         ..
      } = event
      else {
         trace!("Ignoring {} for scan enable read", event.code());
         return;
      };

      let enable = self.inquiry_scan_desired();
      if scan.inquiry() == enable {
         self.finish_scan_procedure(Ok(()));
         return;
      }

      debug!("{} inquiry scan", if enable { "Enabling" } else { "Disabling" });
      match self.send(
         Command::WriteScanEnable(scan.with_inquiry(enable)),
         Procedure::WriteScanEnable,
      ) {
         Ok(()) => self.scan_procedure = ScanProcedure::Writing,
         Err(e) => self.finish_scan_procedure(Err(e)),
      }
   }

   fn finish_scan_procedure(&mut self, result: Result<()>) {
      self.scan_procedure = ScanProcedure::Idle;
      let rerun = mem::take(&mut self.scan_rerun);
      if rerun && result.is_ok() {
         // The desired state changed mid-flight; callers wait for the rerun.
         self.set_inquiry_scan();
         return;
      }

      self.resolve_pending_discoverable(result);
      if rerun {
         self.set_inquiry_scan();
      }
   }

   fn resolve_pending_discoverable(&mut self, result: Result<()>) {
      for reply in mem::take(&mut self.pending_discoverable) {
         let _ = reply.send(result.clone().map(|()| self.add_discoverable_session()));
      }
   }

   // === Local name ===

   fn update_local_name(&mut self, name: SmolStr, reply: oneshot::Sender<Result<()>>) {
      let transport = self.transport.clone();
      let loopback = self.loopback_tx.downgrade();
      tokio::spawn(async move {
         let result = write_local_name(transport.as_ref(), &name).await;
         if let Some(loopback) = loopback.upgrade() {
            let _ = loopback.send(ManagerCommand::LocalNameWritten {
               name,
               result,
               reply,
            });
         }
      });
   }

   fn cleanup(&mut self) {
      info!("Cleaning up BR/EDR discovery manager");

      for id in self.event_handlers.drain(..) {
         self.transport.remove_event_handler(id);
      }

      if matches!(
         self.inquiry_state,
         InquiryState::Starting | InquiryState::Discovering | InquiryState::Restarting
      ) {
         self.stop_inquiry();
      }

      self.invalidate_discovery_sessions(&GapError::ManagerShutdown);
      for reply in self.pending_discovery.drain(..) {
         let _ = reply.send(Err(GapError::ManagerShutdown));
      }
      for reply in self.pending_discoverable.drain(..) {
         let _ = reply.send(Err(GapError::ManagerShutdown));
      }
   }
}

/// Sets the controller name and, only if that succeeds, the EIR data.
async fn write_local_name(transport: &dyn Transport, name: &str) -> Result<()> {
   let bytes = name.as_bytes();
   let bytes = &bytes[..bytes.len().min(MAX_NAME_LENGTH)];
   transport
      .send_command(Command::WriteLocalName(bytes.to_vec()))?
      .complete(EventCode::CommandComplete)
      .await
      .inspect_err(|e| warn!("Set local name failed: {e}"))?;

   let data = eir::local_name_response(name);
   trace!("EIR data: {}", hex::encode(&data));
   transport
      .send_command(Command::WriteExtendedInquiryResponse {
         fec_required: false,
         data,
      })?
      .complete(EventCode::CommandComplete)
      .await
      .inspect_err(|e| warn!("Write EIR failed: {e}"))?;
   Ok(())
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use parking_lot::Mutex;
   use tokio::time;

   use super::*;
   use crate::{
      hci::{InquiryResponse, ScanEnable, StatusCode},
      testing::{FakeTransport, bredr_address, init_logging, run_until_idle},
   };

   struct Harness {
      transport: Arc<FakeTransport>,
      cache: PeerCache,
      manager: Arc<BrEdrDiscoveryManager>,
   }

   async fn setup() -> Harness {
      init_logging();
      let transport = FakeTransport::new();
      for opcode in [OpCode::WRITE_INQUIRY_SCAN_ACTIVITY, OpCode::WRITE_INQUIRY_SCAN_TYPE] {
         transport.auto_respond(opcode, move |_| vec![Event::command_complete(opcode)]);
      }
      transport.auto_respond(OpCode::WRITE_INQUIRY_MODE, |_| {
         vec![Event::command_complete(OpCode::WRITE_INQUIRY_MODE)]
      });

      let cache = PeerCache::new();
      let manager =
         BrEdrDiscoveryManager::new(transport.clone(), cache.clone(), BrEdrConfig::default())
            .unwrap();
      run_until_idle().await;
      Harness {
         transport,
         cache,
         manager: Arc::new(manager),
      }
   }

   /// Models the controller's scan enable register.
   fn emulate_scan_enable(transport: &FakeTransport, initial: u8) -> Arc<Mutex<u8>> {
      let register = Arc::new(Mutex::new(initial));
      let read = register.clone();
      transport.auto_respond(OpCode::READ_SCAN_ENABLE, move |_| {
         vec![Event::CommandComplete {
            opcode: OpCode::READ_SCAN_ENABLE,
            status: StatusCode::Success,
            params: ReturnParams::ScanEnable(ScanEnable(*read.lock())),
         }]
      });
      let write = register.clone();
      transport.auto_respond(OpCode::WRITE_SCAN_ENABLE, move |command| {
         if let Command::WriteScanEnable(scan) = command {
            *write.lock() = scan.0;
         }
         vec![Event::command_complete(OpCode::WRITE_SCAN_ENABLE)]
      });
      register
   }

   async fn start_discovery(h: &Harness) -> BrEdrDiscoverySession {
      let (session, ()) = tokio::join!(h.manager.request_discovery(), async {
         run_until_idle().await;
         assert!(h.transport.respond(
            OpCode::INQUIRY,
            [Event::command_status(OpCode::INQUIRY, StatusCode::Success)]
         ));
      });
      session.unwrap()
   }

   fn inquiry_result(last: u8) -> Event {
      let mut response = InquiryResponse::new(bredr_address(last));
      response.clock_offset = 0x1234;
      Event::InquiryResult(vec![response])
   }

   #[tokio::test(start_paused = true)]
   async fn test_startup_writes_scan_settings() {
      let h = setup().await;
      let sent = h.transport.sent();
      assert_eq!(
         sent[0].command,
         Command::WriteInquiryScanActivity {
            interval: 0x01E0,
            window: 0x0012
         }
      );
      assert_eq!(
         sent[1].command,
         Command::WriteInquiryScanType(crate::hci::InquiryScanType::Interlaced)
      );
      assert_eq!(h.transport.handler_count(EventCode::InquiryResult), 1);
      assert_eq!(h.transport.handler_count(EventCode::ExtendedInquiryResult), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_concurrent_requests_share_one_inquiry() {
      let h = setup().await;

      let (a, b, c, ()) = tokio::join!(
         h.manager.request_discovery(),
         h.manager.request_discovery(),
         h.manager.request_discovery(),
         async {
            run_until_idle().await;
            assert_eq!(h.transport.count(OpCode::INQUIRY), 1);
            h.transport.respond(
               OpCode::INQUIRY,
               [Event::command_status(OpCode::INQUIRY, StatusCode::Success)],
            );
         }
      );
      assert!(a.is_ok() && b.is_ok() && c.is_ok());
      assert_eq!(
         h.transport.last_exclusions(OpCode::INQUIRY),
         Some(vec![OpCode::REMOTE_NAME_REQUEST])
      );
      assert_eq!(
         h.transport.commands(OpCode::WRITE_INQUIRY_MODE),
         vec![Command::WriteInquiryMode(InquiryMode::Extended)]
      );

      // Inquiry is running, so the next request is satisfied immediately.
      let d = h.manager.request_discovery().await;
      assert!(d.is_ok());
      assert_eq!(h.transport.count(OpCode::INQUIRY), 1);
      assert!(h.manager.discovering().await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_inquiry_start_failure_fails_waiters() {
      let h = setup().await;

      let (result, ()) = tokio::join!(h.manager.request_discovery(), async {
         run_until_idle().await;
         h.transport.respond(
            OpCode::INQUIRY,
            [Event::command_status(OpCode::INQUIRY, StatusCode::CommandDisallowed)],
         );
      });
      assert_eq!(
         result.unwrap_err(),
         GapError::Hci(StatusCode::CommandDisallowed)
      );
      assert!(!h.manager.discovering().await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_dropped_inquiry_fails_waiters() {
      let h = setup().await;

      let (result, ()) = tokio::join!(h.manager.request_discovery(), async {
         run_until_idle().await;
         assert!(h.transport.close(OpCode::INQUIRY));
      });
      assert_eq!(result.unwrap_err(), GapError::TransportClosed);
      assert_eq!(h.manager.status().await.unwrap().inquiry, InquiryState::Idle);

      // Nothing is left pending, so the next request starts a fresh inquiry.
      let _session = start_discovery(&h).await;
      assert_eq!(h.transport.count(OpCode::INQUIRY), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_dropped_inquiry_invalidates_sessions() {
      let h = setup().await;
      let mut session = start_discovery(&h).await;

      assert!(h.transport.close(OpCode::INQUIRY));
      run_until_idle().await;
      assert!(matches!(
         session.next_event().await,
         Some(DiscoveryEvent::Error(GapError::TransportClosed))
      ));
      assert!(session.next_event().await.is_none());
      assert!(!h.manager.discovering().await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_inquiry_restarts_while_sessions_remain() {
      let h = setup().await;
      let _session = start_discovery(&h).await;

      h.transport.respond(
         OpCode::INQUIRY,
         [Event::InquiryComplete {
            status: StatusCode::Success,
         }],
      );
      run_until_idle().await;
      assert_eq!(h.transport.count(OpCode::INQUIRY), 2);
      // The mode was confirmed the first time around.
      assert_eq!(h.transport.count(OpCode::WRITE_INQUIRY_MODE), 1);
      assert_eq!(
         h.manager.status().await.unwrap().inquiry,
         InquiryState::Restarting
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_dropped_session_drains_until_inquiry_completes() {
      let h = setup().await;
      let session = start_discovery(&h).await;
      drop(session);
      run_until_idle().await;
      assert!(!h.manager.discovering().await);

      // The dropped session is still draining, so no new inquiry is needed.
      let session = h.manager.request_discovery().await.unwrap();
      assert_eq!(h.transport.count(OpCode::INQUIRY), 1);
      session.release();
      run_until_idle().await;

      h.transport.respond(
         OpCode::INQUIRY,
         [Event::InquiryComplete {
            status: StatusCode::Success,
         }],
      );
      run_until_idle().await;
      assert_eq!(h.transport.count(OpCode::INQUIRY), 1);
      assert_eq!(h.manager.status().await.unwrap().inquiry, InquiryState::Idle);
   }

   #[tokio::test(start_paused = true)]
   async fn test_name_request_is_deduplicated() {
      let h = setup().await;
      let mut session = start_discovery(&h).await;

      h.transport.emit(inquiry_result(1));
      run_until_idle().await;
      h.transport.emit(inquiry_result(1));
      run_until_idle().await;

      let requests = h.transport.commands(OpCode::REMOTE_NAME_REQUEST);
      assert_eq!(
         requests,
         vec![Command::RemoteNameRequest {
            address: bredr_address(1),
            page_scan_repetition_mode: crate::hci::PageScanRepetitionMode::R1,
            clock_offset: 0x1234 | CLOCK_OFFSET_VALID,
         }]
      );
      assert_eq!(
         h.transport.last_exclusions(OpCode::REMOTE_NAME_REQUEST),
         Some(vec![OpCode::INQUIRY])
      );

      // Every event is reported, even for the same peer.
      for _ in 0..2 {
         assert!(matches!(
            session.try_next_event(),
            Some(DiscoveryEvent::PeerFound(peer)) if peer.address.value == bredr_address(1)
         ));
      }
      assert!(session.try_next_event().is_none());

      h.transport.respond(
         OpCode::REMOTE_NAME_REQUEST,
         [
            Event::command_status(OpCode::REMOTE_NAME_REQUEST, StatusCode::Success),
            Event::RemoteNameRequestComplete {
               status: StatusCode::Success,
               address: bredr_address(1),
               name: b"Speaker\0\0\0".to_vec(),
            },
         ],
      );
      run_until_idle().await;
      let peer = h
         .cache
         .find_by_address(&DeviceAddress::bredr(bredr_address(1)))
         .unwrap();
      assert_eq!(peer.name.as_deref(), Some("Speaker"));

      // Named peers are not asked again.
      h.transport.emit(inquiry_result(1));
      run_until_idle().await;
      assert_eq!(h.transport.count(OpCode::REMOTE_NAME_REQUEST), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_failed_name_request_can_be_retried() {
      let h = setup().await;
      let _session = start_discovery(&h).await;

      h.transport.emit(inquiry_result(2));
      run_until_idle().await;
      h.transport.respond(
         OpCode::REMOTE_NAME_REQUEST,
         [Event::command_status(
            OpCode::REMOTE_NAME_REQUEST,
            StatusCode::PageTimeout,
         )],
      );
      run_until_idle().await;

      h.transport.emit(inquiry_result(2));
      run_until_idle().await;
      assert_eq!(h.transport.count(OpCode::REMOTE_NAME_REQUEST), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_dropped_name_request_can_be_retried() {
      let h = setup().await;
      let _session = start_discovery(&h).await;

      h.transport.emit(inquiry_result(4));
      run_until_idle().await;
      assert!(h.transport.close(OpCode::REMOTE_NAME_REQUEST));
      run_until_idle().await;

      h.transport.emit(inquiry_result(4));
      run_until_idle().await;
      assert_eq!(h.transport.count(OpCode::REMOTE_NAME_REQUEST), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_results_of_mixed_types_keep_arrival_order() {
      let h = setup().await;
      let mut session = start_discovery(&h).await;

      let mut extended = InquiryResponse::new(bredr_address(7));
      extended.rssi = Some(-40);
      let mut with_rssi = InquiryResponse::new(bredr_address(6));
      with_rssi.rssi = Some(-60);
      h.transport.emit(inquiry_result(5));
      h.transport.emit(Event::ExtendedInquiryResult(extended));
      h.transport.emit(Event::InquiryResultWithRssi(vec![with_rssi]));
      h.transport.emit(inquiry_result(8));
      run_until_idle().await;

      let mut found = Vec::new();
      while let Some(DiscoveryEvent::PeerFound(peer)) = session.try_next_event() {
         found.push(peer.address.value);
      }
      assert_eq!(found, [5, 7, 6, 8].map(bredr_address));
   }

   #[tokio::test(start_paused = true)]
   async fn test_extended_result_carries_name() {
      let h = setup().await;
      let mut session = start_discovery(&h).await;

      let mut response = InquiryResponse::new(bredr_address(3));
      response.rssi = Some(-55);
      response.eir = Some(eir::local_name_response("Keyboard").to_vec());
      h.transport.emit(Event::ExtendedInquiryResult(response));
      run_until_idle().await;

      let Some(DiscoveryEvent::PeerFound(peer)) = session.try_next_event() else {
         panic!("expected a discovery result");
      };
      assert_eq!(peer.name.as_deref(), Some("Keyboard"));
      assert_eq!(peer.bredr.unwrap().rssi, Some(-55));
      assert_eq!(h.transport.count(OpCode::REMOTE_NAME_REQUEST), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_inquiry_error_invalidates_sessions_without_restart() {
      let h = setup().await;
      let register = emulate_scan_enable(&h.transport, 0);
      h.transport.auto_respond(OpCode::READ_SCAN_ENABLE, |_| Vec::new());
      let mut session = start_discovery(&h).await;

      // Leave a discoverable request pending on the scan enable read.
      let manager = h.manager.clone();
      let discoverable = tokio::spawn(async move { manager.request_discoverable().await });
      run_until_idle().await;
      assert_eq!(h.transport.open_transactions(OpCode::READ_SCAN_ENABLE), 1);

      h.transport.respond(
         OpCode::INQUIRY,
         [Event::InquiryComplete {
            status: StatusCode::HardwareFailure,
         }],
      );
      run_until_idle().await;

      assert!(matches!(
         session.next_event().await,
         Some(DiscoveryEvent::Error(GapError::Hci(StatusCode::HardwareFailure)))
      ));
      assert!(session.next_event().await.is_none());
      assert_eq!(h.transport.count(OpCode::INQUIRY), 1);
      assert!(!h.manager.discovering().await);
      assert!(!discoverable.is_finished());
      assert_eq!(*register.lock(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discoverable_toggles_inquiry_scan() {
      let h = setup().await;
      let register = emulate_scan_enable(&h.transport, ScanEnable::PAGE);

      let (a, b) = tokio::join!(
         h.manager.request_discoverable(),
         h.manager.request_discoverable()
      );
      let (a, b) = (a.unwrap(), b.unwrap());
      assert_eq!(*register.lock(), ScanEnable::PAGE | ScanEnable::INQUIRY);
      assert_eq!(h.transport.count(OpCode::READ_SCAN_ENABLE), 1);
      assert_eq!(h.transport.count(OpCode::WRITE_SCAN_ENABLE), 1);
      assert!(h.manager.discoverable().await);

      // Already discoverable: satisfied without touching the controller.
      let c = h.manager.request_discoverable().await.unwrap();
      assert_eq!(h.transport.count(OpCode::READ_SCAN_ENABLE), 1);

      drop(a);
      c.release();
      run_until_idle().await;
      assert_eq!(*register.lock() & ScanEnable::INQUIRY, ScanEnable::INQUIRY);

      drop(b);
      run_until_idle().await;
      assert_eq!(*register.lock(), ScanEnable::PAGE);
      assert!(!h.manager.discoverable().await);

      let _again = h.manager.request_discoverable().await.unwrap();
      assert_eq!(*register.lock(), ScanEnable::PAGE | ScanEnable::INQUIRY);
      assert_eq!(h.transport.count(OpCode::WRITE_SCAN_ENABLE), 3);
   }

   #[tokio::test(start_paused = true)]
   async fn test_dropped_scan_read_fails_discoverable() {
      let h = setup().await;
      h.transport.auto_respond(OpCode::READ_SCAN_ENABLE, |_| Vec::new());

      let (result, ()) = tokio::join!(h.manager.request_discoverable(), async {
         run_until_idle().await;
         assert!(h.transport.close(OpCode::READ_SCAN_ENABLE));
      });
      assert_eq!(result.unwrap_err(), GapError::TransportClosed);
      assert!(!h.manager.discoverable().await);

      // The scan procedure is idle again, so a new request reads afresh.
      let register = emulate_scan_enable(&h.transport, 0);
      let _session = h.manager.request_discoverable().await.unwrap();
      assert_eq!(h.transport.count(OpCode::READ_SCAN_ENABLE), 2);
      assert_eq!(*register.lock(), ScanEnable::INQUIRY);
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_already_matching_skips_write() {
      let h = setup().await;
      let _register = emulate_scan_enable(&h.transport, ScanEnable::INQUIRY);

      let session = h.manager.request_discoverable().await;
      assert!(session.is_ok());
      assert_eq!(h.transport.count(OpCode::WRITE_SCAN_ENABLE), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_change_during_write_is_rerun() {
      let h = setup().await;
      let register = emulate_scan_enable(&h.transport, ScanEnable::INQUIRY);
      h.transport.auto_respond(OpCode::WRITE_SCAN_ENABLE, |_| Vec::new());

      // Discoverable with inquiry scan already on.
      let session = h.manager.request_discoverable().await.unwrap();
      drop(session);
      run_until_idle().await;
      assert_eq!(h.transport.open_transactions(OpCode::WRITE_SCAN_ENABLE), 1);

      // A new request arrives while scan is being disabled.
      let manager = h.manager.clone();
      let request = tokio::spawn(async move { manager.request_discoverable().await });
      run_until_idle().await;
      *register.lock() = 0;
      h.transport.respond(
         OpCode::WRITE_SCAN_ENABLE,
         [Event::command_complete(OpCode::WRITE_SCAN_ENABLE)],
      );
      run_until_idle().await;
      assert!(!request.is_finished());

      // The rerun reads the disabled state and enables it again.
      assert_eq!(h.transport.count(OpCode::READ_SCAN_ENABLE), 3);
      assert_eq!(
         h.transport.commands(OpCode::WRITE_SCAN_ENABLE).last(),
         Some(&Command::WriteScanEnable(ScanEnable(ScanEnable::INQUIRY)))
      );
      h.transport.respond(
         OpCode::WRITE_SCAN_ENABLE,
         [Event::command_complete(OpCode::WRITE_SCAN_ENABLE)],
      );
      assert!(request.await.unwrap().is_ok());
   }

   #[tokio::test(start_paused = true)]
   async fn test_local_name_failure_skips_eir() {
      let h = setup().await;
      h.transport.auto_respond(OpCode::WRITE_LOCAL_NAME, |_| {
         vec![Event::CommandComplete {
            opcode: OpCode::WRITE_LOCAL_NAME,
            status: StatusCode::HardwareFailure,
            params: ReturnParams::None,
         }]
      });

      let result = h.manager.update_local_name("Desk").await;
      assert_eq!(result, Err(GapError::Hci(StatusCode::HardwareFailure)));
      assert_eq!(h.transport.count(OpCode::WRITE_EXTENDED_INQUIRY_RESPONSE), 0);
      assert_eq!(h.manager.local_name().await, None);
   }

   #[tokio::test(start_paused = true)]
   async fn test_local_name_writes_eir_after_name() {
      let h = setup().await;
      for opcode in [OpCode::WRITE_LOCAL_NAME, OpCode::WRITE_EXTENDED_INQUIRY_RESPONSE] {
         h.transport
            .auto_respond(opcode, move |_| vec![Event::command_complete(opcode)]);
      }

      h.manager.update_local_name("Desk").await.unwrap();
      assert_eq!(
         h.transport.commands(OpCode::WRITE_LOCAL_NAME),
         vec![Command::WriteLocalName(b"Desk".to_vec())]
      );
      let eir = h.transport.commands(OpCode::WRITE_EXTENDED_INQUIRY_RESPONSE);
      let [Command::WriteExtendedInquiryResponse { fec_required, data }] = eir.as_slice() else {
         panic!("expected one EIR write");
      };
      assert!(!*fec_required);
      assert_eq!(&data[..6], b"\x05\x09Desk");
      assert_eq!(h.manager.local_name().await.as_deref(), Some("Desk"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_eir_failure_keeps_previous_name() {
      let h = setup().await;
      h.transport.auto_respond(OpCode::WRITE_LOCAL_NAME, |_| {
         vec![Event::command_complete(OpCode::WRITE_LOCAL_NAME)]
      });
      h.transport
         .auto_respond(OpCode::WRITE_EXTENDED_INQUIRY_RESPONSE, |_| {
            vec![Event::CommandComplete {
               opcode: OpCode::WRITE_EXTENDED_INQUIRY_RESPONSE,
               status: StatusCode::UnspecifiedError,
               params: ReturnParams::None,
            }]
         });

      assert!(h.manager.update_local_name("Desk").await.is_err());
      assert_eq!(h.manager.local_name().await, None);
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_invalidates_sessions() {
      let h = setup().await;
      let mut session = start_discovery(&h).await;

      let Harness {
         transport, manager, ..
      } = h;
      drop(manager);
      time::sleep(Duration::from_millis(10)).await;

      assert!(matches!(
         session.next_event().await,
         Some(DiscoveryEvent::Error(GapError::ManagerShutdown))
      ));
      assert_eq!(transport.count(OpCode::INQUIRY_CANCEL), 1);
      assert_eq!(transport.handler_count(EventCode::InquiryResult), 0);

      // Releasing after shutdown is a no-op.
      session.release();
   }
}
