//! Error types for the GAP layer.
//!
//! Controller failures, collaborator failures and state errors all surface
//! as [`GapError`]. The type is cheap to clone so that a single outcome can
//! be fanned out to every caller waiting on the same procedure.

use thiserror::Error;

use crate::{hci::StatusCode, peer::PeerId};

/// Main error type for the GAP managers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GapError {
   #[error("HCI command failed: {0}")]
   Hci(StatusCode),

   #[error("Transport closed")]
   TransportClosed,

   #[error("Transport rejected command: {0}")]
   CommandRejected(&'static str),

   #[error("Peer not found: {0}")]
   PeerNotFound(PeerId),

   #[error("Peer not connected: {0}")]
   NotConnected(PeerId),

   #[error("Connection already exists for peer {0}")]
   ConnectionExists(PeerId),

   #[error("Connection to peer {0} is still being established")]
   ConnectInProgress(PeerId),

   #[error("Connection failed: {0}")]
   ConnectionFailed(String),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Pairing canceled")]
   PairingCanceled,

   #[error("Pairing rejected: no pairing delegate")]
   PairingRejected,

   #[error("Pairing already in progress")]
   PairingInProgress,

   #[error("Connection parameter update rejected")]
   ParameterUpdateRejected,

   #[error("Interrogation failed: {0}")]
   InterrogationFailed(Box<GapError>),

   #[error("Session invalidated")]
   SessionInvalidated,

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl GapError {
   /// Returns the controller status carried by this error, if any.
   pub fn status(&self) -> Option<StatusCode> {
      match self {
         Self::Hci(status) => Some(*status),
         Self::InterrogationFailed(inner) => inner.status(),
         _ => None,
      }
   }
}

impl From<StatusCode> for GapError {
   fn from(status: StatusCode) -> Self {
      Self::Hci(status)
   }
}

/// Convenience type alias for Results with `GapError`.
pub type Result<T> = std::result::Result<T, GapError>;
