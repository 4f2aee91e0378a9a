//! LE link establishment seam and the values attached to connect requests.

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
   address::DeviceAddress,
   error::Result,
   hci::{ConnectionHandle, LeConnectionParameters},
   sm::BondableMode,
};

/// Local role on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LinkRole {
   Central,
   Peripheral,
}

/// An established LE ACL link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeLink {
   pub handle: ConnectionHandle,
   pub role: LinkRole,
   pub peer_address: DeviceAddress,
   pub params: LeConnectionParameters,
}

/// Options fixed by the first caller of a connection request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
   pub bondable_mode: BondableMode,
   /// Limits post-connection service discovery to this service.
   pub service_uuid: Option<Uuid>,
}

/// Creates outgoing LE connections, one at a time.
///
/// Dropping the returned future cancels the attempt.
pub trait LowEnergyConnector: Send + Sync {
   fn connect(&self, address: DeviceAddress) -> BoxFuture<'static, Result<LeLink>>;
}
