//! Generic Access Profile layer of a Bluetooth host stack.
//!
//! [`bredr::BrEdrDiscoveryManager`] arbitrates inquiry and inquiry scan
//! between clients through sessions. [`le::LowEnergyConnectionManager`]
//! shares LE links between clients through connection refs. Both talk to
//! the controller through an [`hci::Transport`] and record what they learn
//! in a [`peer::PeerCache`].

pub mod address;
pub mod bearer;
pub mod bredr;
pub mod config;
pub mod error;
pub mod handle;
pub mod hci;
pub mod le;
pub mod peer;
pub mod sm;

#[cfg(test)]
mod testing;

pub use address::{AddressType, BdAddr, DeviceAddress};
pub use config::{BrEdrConfig, Config, LeConfig};
pub use error::{GapError, Result};
pub use peer::{Peer, PeerCache, PeerId};
