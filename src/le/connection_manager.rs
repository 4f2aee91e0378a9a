//! LE connection management.
//!
//! The actor owns every active connection and every outstanding connect
//! request. Concurrent requests for one peer share a single connector
//! attempt; attempts for different peers run one at a time. A connection
//! is handed out as [`LowEnergyConnectionRef`]s only once interrogation has
//! finished, and it is torn down when the last ref goes away, on explicit
//! disconnect, or when the controller reports the link lost.

use std::{
   collections::{HashMap, VecDeque},
   mem,
   sync::Arc,
};

use futures::{
   StreamExt,
   stream::{BoxStream, SelectAll},
};
use log::{debug, info, trace, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use super::{
   connection_ref::{LowEnergyConnectionRef, RefShared},
   connector::{ConnectionOptions, LeLink, LinkRole, LowEnergyConnector},
   interrogator::LowEnergyInterrogator,
};
use crate::{
   address::DeviceAddress,
   bearer::{Gatt, L2cap},
   config::LeConfig,
   error::{GapError, Result},
   handle::{Handle, Registry},
   hci::{
      Command, CommandTransaction, ConnectionHandle, Event, EventCode, EventHandlerId,
      LeConnectionParameters, LePreferredConnectionParameters, SharedTransport, StatusCode,
      transport::{relay_events, relay_transaction},
   },
   peer::{ConnectionState, LE_FEATURE_CONNECTION_PARAMETERS_REQUEST, PeerCache, PeerId},
   sm::{BondableMode, SecurityLevel, SecurityManager, SharedPairingDelegate},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

type ConnectReply = oneshot::Sender<Result<LowEnergyConnectionRef>>;
type StatusReply = oneshot::Sender<Result<()>>;
type PairingReply = oneshot::Sender<Result<SecurityLevel>>;

// === Connection State ===

enum Interrogation {
   InProgress(JoinHandle<()>),
   Complete,
}

impl Interrogation {
   const fn is_complete(&self) -> bool {
      matches!(self, Self::Complete)
   }
}

struct Pairing {
   task: JoinHandle<()>,
   bondable_mode: BondableMode,
   reply: PairingReply,
}

struct ParamUpdate {
   id: u64,
   params: LePreferredConnectionParameters,
   reply: Option<StatusReply>,
   timeout: JoinHandle<()>,
}

struct LowEnergyConnection {
   peer_id: PeerId,
   link: LeLink,
   options: ConnectionOptions,
   refs: Vec<Handle>,
   interrogation: Interrogation,
   /// Connect requests that arrived before interrogation finished.
   waiters: VecDeque<ConnectReply>,
   security_level: SecurityLevel,
   pairing: Option<Pairing>,
   param_update: Option<ParamUpdate>,
   deferred_update: Option<(LePreferredConnectionParameters, StatusReply)>,
}

/// Callers waiting on one outstanding connector attempt.
struct PendingRequestData {
   address: DeviceAddress,
   options: ConnectionOptions,
   callbacks: VecDeque<ConnectReply>,
}

struct RefEntry {
   peer_id: PeerId,
   shared: Arc<RefShared>,
}

// === Commands ===

#[derive(Debug, Clone, Copy)]
pub(super) enum Procedure {
   Disconnect(ConnectionHandle),
   ConnectionUpdate { peer_id: PeerId, id: u64 },
}

pub(super) enum ManagerCommand {
   // Client requests
   Connect {
      peer_id: PeerId,
      options: ConnectionOptions,
      reply: ConnectReply,
   },
   RegisterRemoteInitiatedLink {
      link: LeLink,
      bondable_mode: BondableMode,
      reply: ConnectReply,
   },
   Disconnect(PeerId, StatusReply),
   Pair {
      peer_id: PeerId,
      level: SecurityLevel,
      bondable_mode: BondableMode,
      reply: PairingReply,
   },
   SetPairingDelegate(Option<SharedPairingDelegate>),
   UpdateConnectionParams {
      peer_id: PeerId,
      params: LePreferredConnectionParameters,
      reply: StatusReply,
   },
   ConnectionCount(oneshot::Sender<usize>),
   IsConnected(PeerId, oneshot::Sender<bool>),

   // Ref releases
   ReleaseRef(Handle),

   // Continuations
   ConnectResult {
      peer_id: PeerId,
      result: Result<LeLink>,
   },
   InterrogationComplete {
      peer_id: PeerId,
      handle: ConnectionHandle,
      result: Result<()>,
   },
   PairingComplete {
      peer_id: PeerId,
      handle: ConnectionHandle,
      result: Result<SecurityLevel>,
   },
   L2capParamUpdate {
      peer_id: PeerId,
      id: u64,
      accepted: bool,
   },
   ParamUpdateTimeout {
      peer_id: PeerId,
      id: u64,
   },
   Transaction(Procedure, Event),
   TransactionClosed(Procedure),
   LinkEvent(Event),
}

/// Controller traffic polled by the actor, in arrival order.
type Relay = BoxStream<'static, ManagerCommand>;

fn post(loopback: &mpsc::WeakUnboundedSender<ManagerCommand>, cmd: ManagerCommand) {
   if let Some(loopback) = loopback.upgrade() {
      let _ = loopback.send(cmd);
   }
}

// === Main Manager ===

/// Handle to the LE connection actor.
///
/// Dropping it disconnects every link and fails outstanding requests with
/// [`GapError::ManagerShutdown`].
pub struct LowEnergyConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl LowEnergyConnectionManager {
   pub fn new(
      transport: SharedTransport,
      cache: PeerCache,
      connector: Arc<dyn LowEnergyConnector>,
      l2cap: Arc<dyn L2cap>,
      gatt: Arc<dyn Gatt>,
      security: Arc<dyn SecurityManager>,
      config: LeConfig,
   ) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();

      let mut event_handlers = Vec::new();
      let mut relays = SelectAll::new();
      for code in [EventCode::DisconnectionComplete, EventCode::LeConnectionUpdateComplete] {
         let (id, stream) = transport.add_event_handler(code)?;
         event_handlers.push(id);
         relays.push(relay_events(stream, ManagerCommand::LinkEvent));
      }

      let actor = ConnectionActor {
         interrogator: Arc::new(LowEnergyInterrogator::new(transport.clone(), cache.clone())),
         transport,
         cache,
         config,
         connector,
         l2cap,
         gatt,
         security,
         command_rx,
         loopback_rx,
         loopback_tx,
         relays,
         event_handlers,
         connections: HashMap::new(),
         refs: Registry::new(),
         pending_requests: HashMap::new(),
         connect_queue: VecDeque::new(),
         connecting: None,
         delegate: None,
         next_update_id: 0,
      };
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

   /// Connects to a cached peer, or joins an existing connection.
   pub async fn connect(
      &self,
      peer_id: PeerId,
      options: ConnectionOptions,
   ) -> Result<LowEnergyConnectionRef> {
      self
         .request(|reply| ManagerCommand::Connect {
            peer_id,
            options,
            reply,
         })
         .await?
   }

   /// Adopts a link the remote device initiated.
   pub async fn register_remote_initiated_link(
      &self,
      link: LeLink,
      bondable_mode: BondableMode,
   ) -> Result<LowEnergyConnectionRef> {
      self
         .request(|reply| ManagerCommand::RegisterRemoteInitiatedLink {
            link,
            bondable_mode,
            reply,
         })
         .await?
   }

   /// Tears the connection down regardless of outstanding refs.
   pub async fn disconnect(&self, peer_id: PeerId) -> Result<()> {
      self
         .request(|reply| ManagerCommand::Disconnect(peer_id, reply))
         .await?
   }

   /// Raises the link's security to at least `level`.
   pub async fn pair(
      &self,
      peer_id: PeerId,
      level: SecurityLevel,
      bondable_mode: BondableMode,
   ) -> Result<SecurityLevel> {
      self
         .request(|reply| ManagerCommand::Pair {
            peer_id,
            level,
            bondable_mode,
            reply,
         })
         .await?
   }

   /// Replaces the pairing delegate. Pairings started under a previous
   /// delegate are canceled; without a delegate pairing is rejected.
   pub async fn set_pairing_delegate(&self, delegate: Option<SharedPairingDelegate>) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::SetPairingDelegate(delegate))
         .await
         .map_err(|_| GapError::ManagerShutdown)
   }

   pub async fn update_connection_params(
      &self,
      peer_id: PeerId,
      params: LePreferredConnectionParameters,
   ) -> Result<()> {
      self
         .request(|reply| ManagerCommand::UpdateConnectionParams {
            peer_id,
            params,
            reply,
         })
         .await?
   }

   pub async fn connection_count(&self) -> usize {
      self
         .request(ManagerCommand::ConnectionCount)
         .await
         .unwrap_or_default()
   }

   pub async fn is_connected(&self, peer_id: PeerId) -> bool {
      self
         .request(|reply| ManagerCommand::IsConnected(peer_id, reply))
         .await
         .unwrap_or_default()
   }
}

// === Manager Actor ===

struct ConnectionActor {
   transport: SharedTransport,
   cache: PeerCache,
   config: LeConfig,
   connector: Arc<dyn LowEnergyConnector>,
   l2cap: Arc<dyn L2cap>,
   gatt: Arc<dyn Gatt>,
   security: Arc<dyn SecurityManager>,
   interrogator: Arc<LowEnergyInterrogator>,

   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::UnboundedReceiver<ManagerCommand>,
   loopback_tx: mpsc::UnboundedSender<ManagerCommand>,
   relays: SelectAll<Relay>,
   event_handlers: Vec<EventHandlerId>,

   connections: HashMap<PeerId, LowEnergyConnection>,
   refs: Registry<RefEntry>,
   pending_requests: HashMap<PeerId, PendingRequestData>,
   connect_queue: VecDeque<PeerId>,
   connecting: Option<(PeerId, JoinHandle<()>)>,
   delegate: Option<SharedPairingDelegate>,
   next_update_id: u64,
}

impl ConnectionActor {
   async fn run(mut self) {
      info!("LE connection manager starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("LE connection manager shutting down");
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
         ManagerCommand::Connect {
            peer_id,
            options,
            reply,
         } => self.connect(peer_id, options, reply),
         ManagerCommand::RegisterRemoteInitiatedLink {
            link,
            bondable_mode,
            reply,
         } => self.register_remote_initiated_link(link, bondable_mode, reply),
         ManagerCommand::Disconnect(peer_id, reply) => {
            let _ = reply.send(self.disconnect(peer_id));
         },
         ManagerCommand::Pair {
            peer_id,
            level,
            bondable_mode,
            reply,
         } => self.pair(peer_id, level, bondable_mode, reply),
         ManagerCommand::SetPairingDelegate(delegate) => self.set_pairing_delegate(delegate),
         ManagerCommand::UpdateConnectionParams {
            peer_id,
            params,
            reply,
         } => self.update_connection_params(peer_id, params, reply),
         ManagerCommand::ConnectionCount(reply) => {
            let _ = reply.send(self.connections.len());
         },
         ManagerCommand::IsConnected(peer_id, reply) => {
            let _ = reply.send(self.connections.contains_key(&peer_id));
         },
         ManagerCommand::ReleaseRef(handle) => self.release_ref(handle),
         ManagerCommand::ConnectResult { peer_id, result } => {
            self.handle_connect_result(peer_id, result);
         },
         ManagerCommand::InterrogationComplete {
            peer_id,
            handle,
            result,
         } => self.handle_interrogation_complete(peer_id, handle, result),
         ManagerCommand::PairingComplete {
            peer_id,
            handle,
            result,
         } => self.handle_pairing_complete(peer_id, handle, result),
         ManagerCommand::L2capParamUpdate {
            peer_id,
            id,
            accepted,
         } => {
            let result = if accepted {
               Ok(())
            } else {
               Err(GapError::ParameterUpdateRejected)
            };
            self.finish_param_update(peer_id, id, result);
         },
         ManagerCommand::ParamUpdateTimeout { peer_id, id } => {
            self.finish_param_update(peer_id, id, Err(GapError::RequestTimeout));
         },
         ManagerCommand::Transaction(procedure, event) => self.handle_transaction(procedure, event),
         ManagerCommand::TransactionClosed(procedure) => self.handle_transaction_closed(procedure),
         ManagerCommand::LinkEvent(event) => self.handle_link_event(event),
      }
   }

   fn watch(&mut self, txn: CommandTransaction, procedure: Procedure) {
      self.relays.push(relay_transaction(
         txn,
         move |event| ManagerCommand::Transaction(procedure, event),
         ManagerCommand::TransactionClosed(procedure),
      ));
   }

   fn peer_for_handle(&self, handle: ConnectionHandle) -> Option<PeerId> {
      self
         .connections
         .values()
         .find(|conn| conn.link.handle == handle)
         .map(|conn| conn.peer_id)
   }

   // === Connection establishment ===

   fn connect(&mut self, peer_id: PeerId, options: ConnectionOptions, reply: ConnectReply) {
      let Some(peer) = self.cache.find_by_id(peer_id) else {
         warn!("Connect request for unknown peer {peer_id}");
         let _ = reply.send(Err(GapError::PeerNotFound(peer_id)));
         return;
      };

      if let Some(conn) = self.connections.get_mut(&peer_id) {
         if !conn.interrogation.is_complete() {
            debug!("{peer_id}: connection still interrogating, queueing request");
            conn.waiters.push_back(reply);
            return;
         }
         if let Some(conn_ref) = self.add_ref(peer_id) {
            let _ = reply.send(Ok(conn_ref));
         }
         return;
      }

      if let Some(pending) = self.pending_requests.get_mut(&peer_id) {
         trace!("{peer_id}: joining pending connection request");
         pending.callbacks.push_back(reply);
         return;
      }

      self.pending_requests.insert(
         peer_id,
         PendingRequestData {
            address: peer.address,
            options,
            callbacks: VecDeque::from([reply]),
         },
      );
      self.connect_queue.push_back(peer_id);
      self.try_next_connection();
   }

   fn try_next_connection(&mut self) {
      if self.connecting.is_some() {
         return;
      }

      while let Some(peer_id) = self.connect_queue.pop_front() {
         let Some(pending) = self.pending_requests.get(&peer_id) else {
            continue;
         };
         let address = pending.address;
         debug!("Connecting to {peer_id} at {address}");

         let attempt = self.connector.connect(address);
         let timeout = self.config.connect_timeout();
         let loopback = self.loopback_tx.downgrade();
         let task = tokio::spawn(async move {
            let result = time::timeout(timeout, attempt)
               .await
               .unwrap_or(Err(GapError::RequestTimeout));
            post(&loopback, ManagerCommand::ConnectResult { peer_id, result });
         });
         self.connecting = Some((peer_id, task));
         return;
      }
   }

   fn handle_connect_result(&mut self, peer_id: PeerId, result: Result<LeLink>) {
      if self
         .connecting
         .as_ref()
         .is_some_and(|(connecting, _)| *connecting == peer_id)
      {
         self.connecting = None;
      }

      let Some(pending) = self.pending_requests.remove(&peer_id) else {
         if let Ok(link) = result {
            warn!("No request waiting for link {} to {peer_id}", link.handle);
            self.disconnect_link(link.handle);
         }
         self.try_next_connection();
         return;
      };

      match result {
         Ok(link) => {
            info!("Connected to {peer_id} on {}", link.handle);
            self.initialize_connection(peer_id, link, pending.options, pending.callbacks);
         },
         Err(e) => {
            warn!("Connection to {peer_id} failed: {e}");
            for reply in pending.callbacks {
               let _ = reply.send(Err(e.clone()));
            }
         },
      }
      self.try_next_connection();
   }

   fn register_remote_initiated_link(
      &mut self,
      link: LeLink,
      bondable_mode: BondableMode,
      reply: ConnectReply,
   ) {
      let peer = self.cache.find_or_create(link.peer_address, true);
      info!("Remote-initiated link {} from {} ({})", link.handle, link.peer_address, peer.id);
      let options = ConnectionOptions {
         bondable_mode,
         service_uuid: None,
      };
      self.initialize_connection(peer.id, link, options, VecDeque::from([reply]));
   }

   fn initialize_connection(
      &mut self,
      peer_id: PeerId,
      link: LeLink,
      options: ConnectionOptions,
      waiters: VecDeque<ConnectReply>,
   ) {
      if self.connections.contains_key(&peer_id) {
         warn!("{peer_id}: rejecting duplicate link {}", link.handle);
         self.disconnect_link(link.handle);
         for reply in waiters {
            let _ = reply.send(Err(GapError::ConnectionExists(peer_id)));
         }
         return;
      }

      self.cache.update(peer_id, |peer| {
         peer.temporary = false;
         let le = peer.mut_le();
         le.connection_state = ConnectionState::Initializing;
         le.connection_parameters = Some(link.params);
      });
      self.l2cap.add_le_link(link.handle, link.role);
      self.gatt.add_connection(peer_id, link.handle);

      let interrogator = self.interrogator.clone();
      let loopback = self.loopback_tx.downgrade();
      let handle = link.handle;
      let task = tokio::spawn(async move {
         let result = interrogator.interrogate(peer_id, handle).await;
         post(
            &loopback,
            ManagerCommand::InterrogationComplete {
               peer_id,
               handle,
               result,
            },
         );
      });

      self.connections.insert(
         peer_id,
         LowEnergyConnection {
            peer_id,
            link,
            options,
            refs: Vec::new(),
            interrogation: Interrogation::InProgress(task),
            waiters,
            security_level: SecurityLevel::NoSecurity,
            pairing: None,
            param_update: None,
            deferred_update: None,
         },
      );
   }

   fn handle_interrogation_complete(
      &mut self,
      peer_id: PeerId,
      handle: ConnectionHandle,
      result: Result<()>,
   ) {
      let Some(conn) = self.connections.get_mut(&peer_id) else {
         trace!("{peer_id}: interrogation finished after disconnect");
         return;
      };
      if conn.link.handle != handle {
         trace!("{peer_id}: stale interrogation for {handle}");
         return;
      }

      if let Err(e) = result {
         warn!("Interrogation of {peer_id} failed: {e}");
         if let Some(conn) = self.connections.remove(&peer_id) {
            self.clean_up_connection(conn, false, GapError::InterrogationFailed(Box::new(e)));
         }
         return;
      }

      debug!("{peer_id}: interrogation complete");
      conn.interrogation = Interrogation::Complete;
      let waiters = mem::take(&mut conn.waiters);
      let deferred = conn.deferred_update.take();
      let service_uuid = conn.options.service_uuid;

      self.cache.update(peer_id, |peer| {
         peer.mut_le().connection_state = ConnectionState::Connected;
      });
      self.gatt.discover_services(peer_id, service_uuid);
      if let Some((params, reply)) = deferred {
         self.start_param_update(peer_id, params, Some(reply));
      }

      for reply in waiters {
         if let Some(conn_ref) = self.add_ref(peer_id) {
            let _ = reply.send(Ok(conn_ref));
         }
      }
   }

   // === Refs and teardown ===

   fn add_ref(&mut self, peer_id: PeerId) -> Option<LowEnergyConnectionRef> {
      let conn = self.connections.get_mut(&peer_id)?;
      let shared = RefShared::new();
      let handle = self.refs.insert(RefEntry {
         peer_id,
         shared: shared.clone(),
      });
      conn.refs.push(handle);
      trace!("{peer_id}: ref {handle} added, {} total", conn.refs.len());
      Some(LowEnergyConnectionRef::new(
         peer_id,
         conn.link.handle,
         conn.options.bondable_mode,
         handle,
         shared,
         self.loopback_tx.downgrade(),
      ))
   }

   fn release_ref(&mut self, handle: Handle) {
      let Some(entry) = self.refs.remove(handle) else {
         trace!("Ref {handle} already released");
         return;
      };
      let peer_id = entry.peer_id;
      let Some(conn) = self.connections.get_mut(&peer_id) else {
         return;
      };
      conn.refs.retain(|other| *other != handle);
      trace!("{peer_id}: ref {handle} released, {} left", conn.refs.len());
      if !conn.refs.is_empty() {
         return;
      }

      debug!("{peer_id}: last ref released");
      if let Some(conn) = self.connections.remove(&peer_id) {
         self.clean_up_connection(conn, false, GapError::NotConnected(peer_id));
      }
   }

   fn disconnect(&mut self, peer_id: PeerId) -> Result<()> {
      let Some(conn) = self.connections.remove(&peer_id) else {
         if self.pending_requests.contains_key(&peer_id) {
            return Err(GapError::ConnectInProgress(peer_id));
         }
         return Err(GapError::NotConnected(peer_id));
      };
      info!("Disconnecting {peer_id}");
      self.clean_up_connection(conn, false, GapError::NotConnected(peer_id));
      Ok(())
   }

   fn disconnect_link(&mut self, handle: ConnectionHandle) {
      let command = Command::Disconnect {
         handle,
         reason: StatusCode::RemoteUserTerminatedConnection,
      };
      match self.transport.send_command(command) {
         Ok(txn) => self.watch(txn, Procedure::Disconnect(handle)),
         Err(e) => warn!("Could not disconnect {handle}: {e}"),
      }
   }

   /// Consumes a connection entry; callers remove it from the map first.
   fn clean_up_connection(
      &mut self,
      conn: LowEnergyConnection,
      link_disconnected: bool,
      error: GapError,
   ) {
      let peer_id = conn.peer_id;
      let handle = conn.link.handle;
      info!("Cleaning up connection to {peer_id} on {handle}");

      if let Interrogation::InProgress(task) = &conn.interrogation {
         task.abort();
      }
      for ref_handle in &conn.refs {
         if let Some(entry) = self.refs.remove(*ref_handle) {
            entry.shared.mark_closed();
         }
      }
      for reply in conn.waiters {
         let _ = reply.send(Err(error.clone()));
      }
      if let Some(pairing) = conn.pairing {
         pairing.task.abort();
         let _ = pairing.reply.send(Err(GapError::PairingCanceled));
      }
      if let Some(update) = conn.param_update {
         update.timeout.abort();
         if let Some(reply) = update.reply {
            let _ = reply.send(Err(GapError::NotConnected(peer_id)));
         }
      }
      if let Some((_, reply)) = conn.deferred_update {
         let _ = reply.send(Err(GapError::NotConnected(peer_id)));
      }

      if !link_disconnected {
         self.disconnect_link(handle);
      }
      self.cache.update(peer_id, |peer| {
         peer.mut_le().connection_state = ConnectionState::NotConnected;
      });
      self.l2cap.remove_link(handle);
      self.gatt.remove_connection(peer_id);
   }

   fn handle_link_event(&mut self, event: Event) {
      match event {
         Event::DisconnectionComplete {
            status,
            handle,
            reason,
         } => {
            if !status.is_success() {
               warn!("Disconnect of {handle} failed: {status}");
               return;
            }
            let Some(peer_id) = self.peer_for_handle(handle) else {
               trace!("Disconnection of unknown link {handle}");
               return;
            };
            info!("Link {handle} to {peer_id} closed: {reason}");
            if let Some(conn) = self.connections.remove(&peer_id) {
               self.clean_up_connection(conn, true, GapError::NotConnected(peer_id));
            }
         },
         Event::LeConnectionUpdateComplete {
            status,
            handle,
            params,
         } => self.handle_connection_update_complete(status, handle, params),
         other => trace!("Ignoring {} on link handler", other.code()),
      }
   }

   fn handle_transaction(&mut self, procedure: Procedure, event: Event) {
      let status = event.status();
      match procedure {
         Procedure::Disconnect(handle) => {
            if !status.is_success() {
               warn!("Disconnect command for {handle} failed: {status}");
            }
         },
         Procedure::ConnectionUpdate { peer_id, id } => match status {
            StatusCode::Success => trace!("{peer_id}: connection update pending"),
            StatusCode::UnsupportedRemoteFeature => self.fall_back_to_l2cap(peer_id, id),
            status => self.finish_param_update(peer_id, id, Err(GapError::Hci(status))),
         },
      }
   }

   fn handle_transaction_closed(&mut self, procedure: Procedure) {
      match procedure {
         Procedure::Disconnect(handle) => warn!("Disconnect command for {handle} was dropped"),
         Procedure::ConnectionUpdate { peer_id, id } => {
            self.finish_param_update(peer_id, id, Err(GapError::TransportClosed));
         },
      }
   }

   // === Pairing ===

   fn pair(
      &mut self,
      peer_id: PeerId,
      level: SecurityLevel,
      bondable_mode: BondableMode,
      reply: PairingReply,
   ) {
      let Some(conn) = self.connections.get_mut(&peer_id) else {
         let _ = reply.send(Err(GapError::NotConnected(peer_id)));
         return;
      };
      if conn.security_level >= level {
         debug!("{peer_id}: already at {}", conn.security_level);
         let _ = reply.send(Ok(conn.security_level));
         return;
      }
      let Some(delegate) = self.delegate.clone() else {
         warn!("No pairing delegate, rejecting pairing with {peer_id}");
         let _ = reply.send(Err(GapError::PairingRejected));
         return;
      };
      if conn.pairing.is_some() {
         let _ = reply.send(Err(GapError::PairingInProgress));
         return;
      }

      info!("Pairing with {peer_id} for {level} ({bondable_mode})");
      let handle = conn.link.handle;
      let upgrade = self
         .security
         .upgrade_security(peer_id, handle, level, bondable_mode, delegate);
      let loopback = self.loopback_tx.downgrade();
      let task = tokio::spawn(async move {
         let result = upgrade.await;
         post(
            &loopback,
            ManagerCommand::PairingComplete {
               peer_id,
               handle,
               result,
            },
         );
      });
      conn.pairing = Some(Pairing {
         task,
         bondable_mode,
         reply,
      });
   }

   fn handle_pairing_complete(
      &mut self,
      peer_id: PeerId,
      handle: ConnectionHandle,
      result: Result<SecurityLevel>,
   ) {
      let Some(conn) = self.connections.get_mut(&peer_id) else {
         return;
      };
      if conn.link.handle != handle {
         return;
      }
      let Some(pairing) = conn.pairing.take() else {
         return;
      };

      match &result {
         Ok(level) => {
            info!("Paired with {peer_id} at {level}");
            conn.security_level = *level;
            if pairing.bondable_mode == BondableMode::Bondable {
               self.cache.update(peer_id, |peer| peer.mut_le().bonded = true);
            }
         },
         Err(e) => warn!("Pairing with {peer_id} failed: {e}"),
      }
      if let Some(delegate) = &self.delegate {
         delegate.complete_pairing(peer_id, &result);
      }
      let _ = pairing.reply.send(result);
   }

   fn set_pairing_delegate(&mut self, delegate: Option<SharedPairingDelegate>) {
      if let Some(previous) = self.delegate.take() {
         for conn in self.connections.values_mut() {
            let Some(pairing) = conn.pairing.take() else {
               continue;
            };
            debug!("{}: canceling pairing for delegate change", conn.peer_id);
            pairing.task.abort();
            let canceled: Result<SecurityLevel> = Err(GapError::PairingCanceled);
            previous.complete_pairing(conn.peer_id, &canceled);
            let _ = pairing.reply.send(canceled);
         }
      }
      if delegate.is_none() {
         info!("Pairing delegate cleared, pairing requests will be rejected");
      }
      self.delegate = delegate;
   }

   // === Connection parameters ===

   fn update_connection_params(
      &mut self,
      peer_id: PeerId,
      params: LePreferredConnectionParameters,
      reply: StatusReply,
   ) {
      let Some(conn) = self.connections.get_mut(&peer_id) else {
         let _ = reply.send(Err(GapError::NotConnected(peer_id)));
         return;
      };
      self.cache.update(peer_id, |peer| {
         peer.mut_le().preferred_parameters = Some(params);
      });

      if !conn.interrogation.is_complete() {
         debug!("{peer_id}: deferring parameter update until interrogation completes");
         if let Some((_, previous)) = conn.deferred_update.replace((params, reply)) {
            let _ = previous.send(Err(GapError::CommandRejected(
               "superseded by a newer parameter update",
            )));
         }
         return;
      }
      if conn.param_update.is_some() {
         let _ = reply.send(Err(GapError::CommandRejected(
            "connection parameter update in progress",
         )));
         return;
      }
      self.start_param_update(peer_id, params, Some(reply));
   }

   fn start_param_update(
      &mut self,
      peer_id: PeerId,
      params: LePreferredConnectionParameters,
      reply: Option<StatusReply>,
   ) {
      let Some(conn) = self.connections.get(&peer_id) else {
         return;
      };
      let (handle, role) = (conn.link.handle, conn.link.role);
      let peer_supports_request = self
         .cache
         .find_by_id(peer_id)
         .and_then(|peer| peer.le)
         .is_some_and(|le| le.supports(LE_FEATURE_CONNECTION_PARAMETERS_REQUEST));

      let id = self.next_update_id;
      self.next_update_id += 1;
      let loopback = self.loopback_tx.downgrade();
      let timeout = self.config.connection_parameter_update_timeout();
      let timer = tokio::spawn(async move {
         time::sleep(timeout).await;
         post(&loopback, ManagerCommand::ParamUpdateTimeout { peer_id, id });
      });
      if let Some(conn) = self.connections.get_mut(&peer_id) {
         conn.param_update = Some(ParamUpdate {
            id,
            params,
            reply,
            timeout: timer,
         });
      }

      if role == LinkRole::Central || peer_supports_request {
         debug!("{peer_id}: requesting parameter update over HCI");
         match self
            .transport
            .send_command(Command::LeConnectionUpdate { handle, params })
         {
            Ok(txn) => self.watch(txn, Procedure::ConnectionUpdate { peer_id, id }),
            Err(e) => self.finish_param_update(peer_id, id, Err(e)),
         }
      } else {
         self.request_l2cap_param_update(peer_id, id, handle, params);
      }
   }

   fn request_l2cap_param_update(
      &self,
      peer_id: PeerId,
      id: u64,
      handle: ConnectionHandle,
      params: LePreferredConnectionParameters,
   ) {
      debug!("{peer_id}: requesting parameter update over L2CAP");
      let request = self
         .l2cap
         .request_connection_parameter_update(handle, params);
      let loopback = self.loopback_tx.downgrade();
      tokio::spawn(async move {
         let accepted = request.await;
         post(
            &loopback,
            ManagerCommand::L2capParamUpdate {
               peer_id,
               id,
               accepted,
            },
         );
      });
   }

   fn fall_back_to_l2cap(&self, peer_id: PeerId, id: u64) {
      let Some(conn) = self.connections.get(&peer_id) else {
         return;
      };
      let Some(update) = conn.param_update.as_ref().filter(|update| update.id == id) else {
         return;
      };
      info!("{peer_id}: remote does not support the HCI update, falling back to L2CAP");
      self.request_l2cap_param_update(peer_id, id, conn.link.handle, update.params);
   }

   fn handle_connection_update_complete(
      &mut self,
      status: StatusCode,
      handle: ConnectionHandle,
      params: LeConnectionParameters,
   ) {
      let Some(peer_id) = self.peer_for_handle(handle) else {
         trace!("Connection update for unknown link {handle}");
         return;
      };
      let pending = self
         .connections
         .get(&peer_id)
         .and_then(|conn| conn.param_update.as_ref())
         .map(|update| update.id);

      match status {
         StatusCode::Success => {
            debug!("{peer_id}: connection parameters now {params:?}");
            if let Some(conn) = self.connections.get_mut(&peer_id) {
               conn.link.params = params;
            }
            self.cache.update(peer_id, |peer| {
               peer.mut_le().connection_parameters = Some(params);
            });
            if let Some(id) = pending {
               self.finish_param_update(peer_id, id, Ok(()));
            }
         },
         StatusCode::UnsupportedRemoteFeature => {
            if let Some(id) = pending {
               self.fall_back_to_l2cap(peer_id, id);
            }
         },
         status => {
            if let Some(id) = pending {
               self.finish_param_update(peer_id, id, Err(GapError::Hci(status)));
            }
         },
      }
   }

   fn finish_param_update(&mut self, peer_id: PeerId, id: u64, result: Result<()>) {
      let Some(conn) = self.connections.get_mut(&peer_id) else {
         return;
      };
      if conn.param_update.as_ref().is_none_or(|update| update.id != id) {
         trace!("{peer_id}: stale parameter update {id}");
         return;
      }
      let Some(update) = conn.param_update.take() else {
         return;
      };
      update.timeout.abort();
      if let Err(e) = &result {
         warn!("{peer_id}: connection parameter update failed: {e}");
      }
      if let Some(reply) = update.reply {
         let _ = reply.send(result);
      }
   }

   fn cleanup(&mut self) {
      info!("Cleaning up LE connection manager");

      for id in self.event_handlers.drain(..) {
         self.transport.remove_event_handler(id);
      }
      if let Some((_, task)) = self.connecting.take() {
         task.abort();
      }
      self.connect_queue.clear();
      for (_, pending) in self.pending_requests.drain() {
         for reply in pending.callbacks {
            let _ = reply.send(Err(GapError::ManagerShutdown));
         }
      }

      let connections: Vec<_> = self.connections.drain().map(|(_, conn)| conn).collect();
      for conn in connections {
         self.clean_up_connection(conn, false, GapError::ManagerShutdown);
      }
   }
}
