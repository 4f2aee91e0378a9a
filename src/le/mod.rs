//! LE connection management and interrogation.

pub mod connection_manager;
pub mod connection_ref;
pub mod connector;
pub mod interrogator;

pub use connection_manager::LowEnergyConnectionManager;
pub use connection_ref::LowEnergyConnectionRef;
pub use connector::{ConnectionOptions, LeLink, LinkRole, LowEnergyConnector};
pub use interrogator::LowEnergyInterrogator;
