//! Client-held references to a shared LE connection.

use std::{fmt, mem, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::connection_manager::ManagerCommand;
use crate::{handle::Handle, hci::ConnectionHandle, peer::PeerId, sm::BondableMode};

type ClosedCallback = Box<dyn FnOnce() + Send>;

/// State shared between a ref and the manager's bookkeeping.
pub(super) struct RefShared {
   active: watch::Sender<bool>,
   closed_callback: Mutex<Option<ClosedCallback>>,
}

impl RefShared {
   pub(super) fn new() -> Arc<Self> {
      Arc::new(Self {
         active: watch::Sender::new(true),
         closed_callback: Mutex::new(None),
      })
   }

   /// Marks the ref inactive and runs its closed callback, at most once.
   pub(super) fn mark_closed(&self) {
      let callback = {
         let mut callback = self.closed_callback.lock();
         if !self.active.send_replace(false) {
            return;
         }
         callback.take()
      };
      if let Some(callback) = callback {
         callback();
      }
   }
}

/// One client's hold on an LE connection.
///
/// The link stays up while at least one ref exists. Dropping the last ref,
/// or calling [`release`](Self::release) on it, disconnects.
pub struct LowEnergyConnectionRef {
   peer_id: PeerId,
   link_handle: ConnectionHandle,
   bondable_mode: BondableMode,
   handle: Handle,
   shared: Arc<RefShared>,
   manager: mpsc::WeakUnboundedSender<ManagerCommand>,
   released: bool,
}

impl LowEnergyConnectionRef {
   pub(super) fn new(
      peer_id: PeerId,
      link_handle: ConnectionHandle,
      bondable_mode: BondableMode,
      handle: Handle,
      shared: Arc<RefShared>,
      manager: mpsc::WeakUnboundedSender<ManagerCommand>,
   ) -> Self {
      Self {
         peer_id,
         link_handle,
         bondable_mode,
         handle,
         shared,
         manager,
         released: false,
      }
   }

   pub const fn peer_id(&self) -> PeerId {
      self.peer_id
   }

   pub const fn handle(&self) -> ConnectionHandle {
      self.link_handle
   }

   pub const fn bondable_mode(&self) -> BondableMode {
      self.bondable_mode
   }

   /// False once the connection has been torn down.
   pub fn is_active(&self) -> bool {
      *self.shared.active.borrow()
   }

   /// Runs `callback` once when the connection closes underneath this ref.
   /// If it has already closed the callback runs immediately.
   pub fn set_closed_callback(&self, callback: impl FnOnce() + Send + 'static) {
      let mut slot = self.shared.closed_callback.lock();
      if *self.shared.active.borrow() {
         *slot = Some(Box::new(callback));
         return;
      }
      drop(slot);
      callback();
   }

   /// Resolves once the connection is closed.
   pub async fn closed(&self) {
      let mut active = self.shared.active.subscribe();
      let _ = active.wait_for(|active| !active).await;
   }

   pub fn release(mut self) {
      self.unregister();
   }

   fn unregister(&mut self) {
      if mem::replace(&mut self.released, true) {
         return;
      }
      if let Some(manager) = self.manager.upgrade() {
         let _ = manager.send(ManagerCommand::ReleaseRef(self.handle));
      }
   }
}

impl Drop for LowEnergyConnectionRef {
   fn drop(&mut self) {
      self.unregister();
   }
}

impl fmt::Debug for LowEnergyConnectionRef {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("LowEnergyConnectionRef")
         .field("peer_id", &self.peer_id)
         .field("handle", &self.link_handle)
         .field("active", &self.is_active())
         .finish_non_exhaustive()
   }
}
