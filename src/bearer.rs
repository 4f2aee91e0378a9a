//! Data-plane collaborators of the LE connection manager.

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
   hci::{ConnectionHandle, LePreferredConnectionParameters},
   le::LinkRole,
   peer::PeerId,
};

/// L2CAP channel manager.
pub trait L2cap: Send + Sync {
   fn add_le_link(&self, handle: ConnectionHandle, role: LinkRole);

   fn remove_link(&self, handle: ConnectionHandle);

   /// Sends an L2CAP Connection Parameter Update Request; resolves to
   /// whether the peer accepted it.
   fn request_connection_parameter_update(
      &self,
      handle: ConnectionHandle,
      params: LePreferredConnectionParameters,
   ) -> BoxFuture<'static, bool>;
}

/// GATT client/server registry.
pub trait Gatt: Send + Sync {
   fn add_connection(&self, peer_id: PeerId, handle: ConnectionHandle);

   fn remove_connection(&self, peer_id: PeerId);

   /// Starts primary service discovery, optionally limited to one service.
   fn discover_services(&self, peer_id: PeerId, service_uuid: Option<Uuid>);
}
