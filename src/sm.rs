//! Security levels and the pairing seams consumed by the LE manager.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{error::Result, hci::ConnectionHandle, peer::PeerId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum SecurityLevel {
   #[default]
   NoSecurity,
   Encrypted,
   Authenticated,
   SecureAuthenticated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
pub enum BondableMode {
   #[default]
   Bondable,
   NonBondable,
}

/// User-facing half of pairing.
pub trait PairingDelegate: Send + Sync {
   /// Asks the user to accept pairing with `peer_id`.
   fn confirm_pairing(&self, peer_id: PeerId) -> BoxFuture<'static, bool>;

   fn display_passkey(&self, peer_id: PeerId, passkey: u32);

   /// Reports the end of a pairing procedure.
   fn complete_pairing(&self, peer_id: PeerId, result: &Result<SecurityLevel>);
}

pub type SharedPairingDelegate = Arc<dyn PairingDelegate>;

/// Security Manager procedures for an LE link.
pub trait SecurityManager: Send + Sync {
   /// Raises the link to at least `level`, resolving to the level reached.
   /// Dropping the future cancels pairing.
   fn upgrade_security(
      &self,
      peer_id: PeerId,
      handle: ConnectionHandle,
      level: SecurityLevel,
      bondable_mode: BondableMode,
      delegate: SharedPairingDelegate,
   ) -> BoxFuture<'static, Result<SecurityLevel>>;
}
