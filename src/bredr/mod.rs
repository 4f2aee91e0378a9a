//! BR/EDR discovery, discoverability and interrogation.

pub mod discovery;
pub mod eir;
pub mod interrogator;

pub use discovery::{
   BrEdrDiscoverableSession, BrEdrDiscoveryManager, BrEdrDiscoverySession, DiscoveryEvent,
   DiscoveryStatus, InquiryState,
};
pub use interrogator::BrEdrInterrogator;
